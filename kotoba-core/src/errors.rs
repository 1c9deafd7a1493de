//! エラー型とエラーメッセージ定数

use crate::codegen::LowerError;
use crate::coordinator::RunError;
use crate::disasm::DisasmError;
use crate::injector::InjectError;
use crate::planner::PlanError;
use kotoba_expr::{FixupFailure, InterpretError};
use kotoba_symbols::SymbolError;
use kotoba_target::{TargetError, ThreadHandle};
use std::time::Duration;
use thiserror::Error;

/// プロセスに接続されていない場合のエラーメッセージ
pub const ERR_NOT_ATTACHED: &str = "Not attached to a process";

/// 式をターゲットで実行する必要があるが実行できない場合のエラーメッセージ
pub const ERR_TARGET_NOT_RUNNABLE: &str =
    "Expression needed to run in the target, but the target can't be run";

/// トップレベルコードを挿入できない場合のエラーメッセージ
pub const ERR_TOP_LEVEL_NOT_RUNNABLE: &str =
    "Top-level code needs to be inserted into a runnable target, but the target can't be run";

/// 式評価のエラー
#[derive(Debug, Error)]
pub enum EvalError {
    /// コンパイルに失敗した（診断はそのまま保持する）
    #[error("{0}")]
    Compile(#[from] FixupFailure),

    /// 解釈実行しかできない方針で、解釈実行できなかった
    #[error("Can't evaluate the expression without a running target due to: {0}")]
    InterpretationUnavailable(String),

    #[error("{0}")]
    TargetNotRunnable(&'static str),

    #[error("could not find the entry function '{0}' in the compiled module")]
    EntryNotFound(String),

    /// コードの書き込みが途中で終わった
    #[error("only {written} of {expected} bytes of code could be written at 0x{address:x}")]
    InjectionIncomplete {
        address: u64,
        written: usize,
        expected: usize,
    },

    #[error("the process exited with status {0} while the expression was running")]
    TargetExited(i32),

    /// 時間内に完了しなかった（スレッドは停止したまま残る）
    #[error("the expression did not finish within {timeout:?}; thread {thread} was left suspended")]
    Timeout {
        timeout: Duration,
        thread: ThreadHandle,
    },

    #[error("unknown register '{0}'")]
    UnknownRegister(String),

    /// 実行中のコードが完了前に停止した
    #[error("the expression stopped before completing: {0}")]
    Fault(String),

    #[error("failed to interpret the expression: {0}")]
    Interpret(#[from] InterpretError),

    #[error("failed to generate code: {0}")]
    Codegen(#[from] LowerError),

    #[error(transparent)]
    Disassembly(#[from] DisasmError),

    #[error(transparent)]
    Target(TargetError),

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    Symbols(#[from] SymbolError),

    #[error("{}", ERR_NOT_ATTACHED)]
    NotAttached,

    /// コマンド引数などの不正な入力
    #[error("{0}")]
    InvalidArgument(String),

    /// 式ファイルを読めなかった
    #[error("failed to read '{path}': {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
}

impl From<TargetError> for EvalError {
    fn from(e: TargetError) -> Self {
        match e {
            TargetError::UnknownRegister(name) => EvalError::UnknownRegister(name),
            TargetError::ProcessExited(code) => EvalError::TargetExited(code),
            other => EvalError::Target(other),
        }
    }
}

impl From<InjectError> for EvalError {
    fn from(e: InjectError) -> Self {
        match e {
            InjectError::EntryNotFound(name) => EvalError::EntryNotFound(name),
            InjectError::InjectionIncomplete {
                address,
                written,
                expected,
            } => EvalError::InjectionIncomplete {
                address,
                written,
                expected,
            },
            InjectError::Lower(e) => EvalError::Codegen(e),
            InjectError::Disassembly(e) => EvalError::Disassembly(e),
            InjectError::NoReturn(name) => {
                EvalError::Fault(format!("function '{}' has no return instruction", name))
            }
            InjectError::Target(e) => e.into(),
        }
    }
}

impl From<RunError> for EvalError {
    fn from(e: RunError) -> Self {
        match e {
            RunError::Target(e) => e.into(),
            RunError::Abandoned(thread) => EvalError::Fault(format!(
                "the event gate was abandoned while waiting for thread {}",
                thread
            )),
            RunError::TooManyArguments(n) => {
                EvalError::InvalidArgument(format!("too many call arguments ({})", n))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_errors_map_to_taxonomy() {
        let e: EvalError = TargetError::UnknownRegister("st9".into()).into();
        assert!(matches!(e, EvalError::UnknownRegister(ref n) if n == "st9"));
        let e: EvalError = TargetError::ProcessExited(3).into();
        assert!(matches!(e, EvalError::TargetExited(3)));
        let e: EvalError = TargetError::Detached.into();
        assert!(matches!(e, EvalError::Target(TargetError::Detached)));
    }

    #[test]
    fn test_messages() {
        assert_eq!(
            EvalError::InterpretationUnavailable("the expression accesses target memory".into())
                .to_string(),
            "Can't evaluate the expression without a running target due to: the expression accesses target memory"
        );
        assert_eq!(
            EvalError::TargetNotRunnable(ERR_TARGET_NOT_RUNNABLE).to_string(),
            ERR_TARGET_NOT_RUNNABLE
        );
    }
}
