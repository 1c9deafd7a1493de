//! 実行方針の状態機械
//!
//! コンパイル済みの式を、デバッガ側で解釈実行するか、ターゲットに注入して実行するかを
//! 決めます。状態の遷移は記録され、後から確認できます。
//!
//! ```text
//! NotCompiled ─┬─> Compiled ─┬─> Interpretable ───┬─> Completed
//!              │             │                    └─> Failed
//!              │             └─> NotInterpretable ─┬─> Injected ─┬─> Completed
//!              │                                   │             └─> Failed
//!              └─> Failed                          └─> Failed
//! ```

use crate::errors::{ERR_TARGET_NOT_RUNNABLE, ERR_TOP_LEVEL_NOT_RUNNABLE};
use crate::{EvalError, ExecutionPolicy};
use kotoba_expr::{Compiler, IrModule};
use std::fmt;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanState {
    NotCompiled,
    Compiled,
    Interpretable,
    NotInterpretable,
    Injected,
    Completed,
    Failed,
}

impl fmt::Display for PlanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    #[error("illegal transition from {from} to {to} under the '{policy}' policy")]
    IllegalTransition {
        from: PlanState,
        to: PlanState,
        policy: ExecutionPolicy,
    },
}

/// 式の実行経路
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// デバッガ側で解釈実行する
    Interpret,
    /// ターゲットに注入して実行する
    Inject,
}

/// 実行方針の状態機械
#[derive(Debug, Clone)]
pub struct ExecutionPlanner {
    policy: ExecutionPolicy,
    state: PlanState,
    history: Vec<PlanState>,
    /// 解釈実行できない理由
    reason: Option<String>,
}

impl ExecutionPlanner {
    pub fn new(policy: ExecutionPolicy) -> Self {
        Self {
            policy,
            state: PlanState::NotCompiled,
            history: vec![PlanState::NotCompiled],
            reason: None,
        }
    }

    pub fn policy(&self) -> ExecutionPolicy {
        self.policy
    }

    pub fn state(&self) -> PlanState {
        self.state
    }

    /// これまでに通った状態（初期状態を含む）
    pub fn history(&self) -> &[PlanState] {
        &self.history
    }

    /// 解釈実行できないと判定された理由
    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    fn allowed(&self, to: PlanState) -> bool {
        use PlanState::*;
        match (self.state, to) {
            (NotCompiled, Compiled | Failed) => true,
            (Compiled, Interpretable) => !self.policy.skips_interpretation(),
            (Compiled, NotInterpretable) => true,
            (Interpretable, Completed | Failed) => true,
            (NotInterpretable, Injected) => self.policy != ExecutionPolicy::Never,
            (NotInterpretable, Failed) => true,
            (Injected, Completed | Failed) => true,
            _ => false,
        }
    }

    /// 状態を遷移させる
    pub fn transition(&mut self, to: PlanState) -> Result<(), PlanError> {
        if !self.allowed(to) {
            return Err(PlanError::IllegalTransition {
                from: self.state,
                to,
                policy: self.policy,
            });
        }
        debug!("Planner ({}): {} -> {}", self.policy, self.state, to);
        self.state = to;
        self.history.push(to);
        Ok(())
    }

    /// コンパイル結果を記録する
    pub fn compiled(&mut self, success: bool) -> Result<(), PlanError> {
        self.transition(if success {
            PlanState::Compiled
        } else {
            PlanState::Failed
        })
    }

    /// 解釈実行できるかを判定する
    ///
    /// `Always` と `TopLevel` では判定自体を行いません。
    pub fn classify(
        &mut self,
        module: &IrModule,
        compiler: &dyn Compiler,
    ) -> Result<PlanState, PlanError> {
        let next = if self.policy.skips_interpretation() {
            PlanState::NotInterpretable
        } else {
            match compiler.can_interpret(module) {
                Ok(()) => PlanState::Interpretable,
                Err(reason) => {
                    debug!("Not interpretable: {}", reason);
                    self.reason = Some(reason);
                    PlanState::NotInterpretable
                }
            }
        };
        self.transition(next)?;
        Ok(next)
    }

    /// 実行経路を決める
    ///
    /// `runnable` は再開可能なスレッドを持つ生存中のターゲットがあるかどうかです。
    /// 実行できない場合は `Failed` に遷移してからエラーを返します。
    pub fn route(&mut self, runnable: bool) -> Result<Route, EvalError> {
        match self.state {
            PlanState::Interpretable => Ok(Route::Interpret),
            PlanState::NotInterpretable if self.policy == ExecutionPolicy::Never => {
                self.transition(PlanState::Failed)?;
                let reason = self
                    .reason
                    .clone()
                    .unwrap_or_else(|| "the expression could not be interpreted".to_string());
                Err(EvalError::InterpretationUnavailable(reason))
            }
            PlanState::NotInterpretable if runnable => {
                self.transition(PlanState::Injected)?;
                Ok(Route::Inject)
            }
            PlanState::NotInterpretable => {
                self.transition(PlanState::Failed)?;
                Err(EvalError::TargetNotRunnable(if self.policy == ExecutionPolicy::TopLevel {
                    ERR_TOP_LEVEL_NOT_RUNNABLE
                } else {
                    ERR_TARGET_NOT_RUNNABLE
                }))
            }
            from => Err(PlanError::IllegalTransition {
                from,
                to: PlanState::Injected,
                policy: self.policy,
            }
            .into()),
        }
    }

    pub fn complete(&mut self) -> Result<(), PlanError> {
        self.transition(PlanState::Completed)
    }

    /// 失敗を記録する（既に失敗している場合は何もしない）
    pub fn fail(&mut self) -> Result<(), PlanError> {
        if self.state == PlanState::Failed {
            return Ok(());
        }
        self.transition(PlanState::Failed)
    }
}
