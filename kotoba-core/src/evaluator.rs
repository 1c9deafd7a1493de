//! 式評価の入口
//!
//! 式をコンパイルし（fix-itによる再試行を含む）、実行方針に従って解釈実行または
//! ターゲットへの注入を行います。トップレベル宣言で定義したグローバル変数は
//! 以降の式から参照できます。

use crate::coordinator::{CallOutcome, CallSite, RunCoordinator};
use crate::injector::{self, PreparedCode};
use crate::planner::{ExecutionPlanner, PlanState, Route};
use crate::{EvalError, EvalOptions, ExecutionPolicy, Result};
use kotoba_expr::{
    CFamilyCompiler, CompileOptions, CompileSession, Compiler, Completion, Diagnostic, Expression,
    FixupLoop, FixupSuccess, Interpreter, IrModule, Scalar, SessionState, SymbolLookup, ValueType,
    VariableInfo, VariableLocation,
};
use kotoba_target::{Register, RemoteTarget, ThreadHandle};
use std::fmt;
use tracing::{debug, info, warn};

/// 式を評価する環境
#[derive(Clone, Copy)]
pub struct EvalContext<'a> {
    pub target: Option<&'a dyn RemoteTarget>,
    /// 実行に使うスレッド（`None` ならターゲットの現在のスレッド）
    pub thread: Option<ThreadHandle>,
    pub symbols: &'a dyn SymbolLookup,
    /// フレーム変数の基準アドレス（`None` ならスレッドの rbp）
    pub frame_base: Option<u64>,
}

impl<'a> EvalContext<'a> {
    /// ターゲットのない環境
    pub fn detached(symbols: &'a dyn SymbolLookup) -> Self {
        Self {
            target: None,
            thread: None,
            symbols,
            frame_base: None,
        }
    }

    pub fn with_target(symbols: &'a dyn SymbolLookup, target: &'a dyn RemoteTarget) -> Self {
        Self {
            target: Some(target),
            ..Self::detached(symbols)
        }
    }
}

/// 評価で得られた値
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvalValue {
    Scalar { raw: i64, ty: ValueType },
    /// トップレベル宣言で定義した名前
    Declared(Vec<String>),
}

impl fmt::Display for EvalValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvalValue::Scalar { raw, ty } => match ty {
                ValueType::Pointer(_) => write!(f, "({}) 0x{:x}", ty, *raw as u64),
                ValueType::Scalar(Scalar::Bool) => write!(f, "({}) {}", ty, *raw != 0),
                ValueType::Scalar(Scalar::U64) => write!(f, "({}) {}", ty, *raw as u64),
                ValueType::Scalar(_) => write!(f, "({}) {}", ty, raw),
            },
            EvalValue::Declared(names) => write!(f, "declared {}", names.join(", ")),
        }
    }
}

/// 評価の結果
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub value: EvalValue,
    /// 実際にコンパイルされた式（fix-it適用後）
    pub expression: Expression,
    /// 警告などの診断
    pub diagnostics: Vec<Diagnostic>,
    pub route: Route,
    pub history: Vec<PlanState>,
    pub attempts: usize,
}

impl Evaluation {
    pub fn was_fixed(&self) -> bool {
        self.attempts > 1
    }
}

/// トップレベル宣言で定義したグローバル変数
#[derive(Debug, Clone, Default)]
pub struct PersistentScope {
    variables: Vec<VariableInfo>,
}

impl PersistentScope {
    pub fn variables(&self) -> &[VariableInfo] {
        &self.variables
    }

    fn insert(&mut self, info: VariableInfo) {
        self.variables.retain(|v| v.name != info.name);
        self.variables.push(info);
    }
}

impl SymbolLookup for PersistentScope {
    fn lookup(&self, name: &str) -> Option<VariableInfo> {
        self.variables.iter().find(|v| v.name == name).cloned()
    }

    fn candidates(&self) -> Vec<String> {
        self.variables.iter().map(|v| v.name.clone()).collect()
    }
}

/// 2つの名前空間を順に探す
struct Chained<'a> {
    first: &'a dyn SymbolLookup,
    second: &'a dyn SymbolLookup,
}

impl SymbolLookup for Chained<'_> {
    fn lookup(&self, name: &str) -> Option<VariableInfo> {
        self.first
            .lookup(name)
            .or_else(|| self.second.lookup(name))
    }

    fn candidates(&self) -> Vec<String> {
        let mut names = self.first.candidates();
        for name in self.second.candidates() {
            if !names.contains(&name) {
                names.push(name);
            }
        }
        names
    }
}

/// 式評価器
///
/// インクルードとトップレベル宣言は、評価が成功した場合にだけ保存されます。
pub struct Evaluator {
    compiler: Box<dyn Compiler>,
    state: SessionState,
    persistent: PersistentScope,
    /// 保持しているトップレベルコードの領域
    images: Vec<u64>,
}

impl Default for Evaluator {
    fn default() -> Self {
        Self::new()
    }
}

impl Evaluator {
    /// 組み込みのC系コンパイラを使う評価器を作る
    pub fn new() -> Self {
        Self::with_compiler(Box::new(CFamilyCompiler))
    }

    pub fn with_compiler(compiler: Box<dyn Compiler>) -> Self {
        Self {
            compiler,
            state: SessionState::default(),
            persistent: PersistentScope::default(),
            images: Vec::new(),
        }
    }

    pub fn session_state(&self) -> &SessionState {
        &self.state
    }

    pub fn persistent(&self) -> &PersistentScope {
        &self.persistent
    }

    /// 保持しているトップレベルコードの領域の先頭アドレス
    pub fn persistent_images(&self) -> &[u64] {
        &self.images
    }

    /// 入力途中の式の補完候補
    ///
    /// トップレベル宣言で定義した名前も候補になります。
    pub fn complete(
        &self,
        text: &str,
        pos: usize,
        symbols: &dyn SymbolLookup,
        options: &EvalOptions,
    ) -> Completion {
        let symbols = Chained {
            first: &self.persistent,
            second: symbols,
        };
        let compile_options = CompileOptions {
            language: options.language,
            result_type: options.result_type,
            top_level: options.policy == ExecutionPolicy::TopLevel,
        };
        self.compiler.complete(text, pos, &compile_options, &symbols)
    }

    /// 式を評価する
    pub fn evaluate(
        &mut self,
        text: &str,
        context: &EvalContext<'_>,
        options: &EvalOptions,
    ) -> Result<Evaluation> {
        let policy = options.policy;
        let top_level = policy == ExecutionPolicy::TopLevel;
        let expr = Expression::new(text, options.language, options.result_type);
        let mut planner = ExecutionPlanner::new(policy);

        let compiled = {
            let symbols = Chained {
                first: &self.persistent,
                second: context.symbols,
            };
            FixupLoop::new(CompileSession::new(&*self.compiler), &self.state, &symbols)
                .top_level(top_level)
                .compile_with_fixups(&expr, options.max_fixup_attempts)
        };
        let compiled = match compiled {
            Ok(compiled) => compiled,
            Err(failure) => {
                planner.compiled(false)?;
                return Err(failure.into());
            }
        };
        if compiled.was_fixed() {
            info!(
                "Expression was fixed to '{}' after {} attempts",
                compiled.expression.text(),
                compiled.attempts
            );
        }

        planner.compiled(true)?;
        planner.classify(&compiled.module, &*self.compiler)?;

        // ターゲットへの問い合わせは注入が必要な場合だけ行う
        let runnable = planner.state() == PlanState::NotInterpretable
            && policy != ExecutionPolicy::Never
            && context.target.is_some_and(|t| t.is_alive());
        let route = planner.route(runnable)?;

        let FixupSuccess {
            module,
            expression,
            diagnostics,
            attempts,
            new_includes,
        } = compiled;

        let result = match route {
            Route::Interpret => self.interpret(&module),
            Route::Inject => self.inject(module, context, options),
        };
        let value = match result {
            Ok(value) => value,
            Err(e) => {
                planner.fail()?;
                return Err(e);
            }
        };
        planner.complete()?;

        // 成功した場合にだけ永続状態を更新する
        if options.keep_persistent {
            self.state.commit_includes(new_includes);
        }

        Ok(Evaluation {
            value,
            expression,
            diagnostics,
            route,
            history: planner.history().to_vec(),
            attempts,
        })
    }

    fn interpret(&self, module: &IrModule) -> Result<EvalValue> {
        let raw = Interpreter::run(module)?;
        let ty = result_type(module);
        debug!("Interpreted result: {}", raw);
        Ok(EvalValue::Scalar {
            raw: ty.storage().convert(raw),
            ty,
        })
    }

    fn inject(
        &mut self,
        module: IrModule,
        context: &EvalContext<'_>,
        options: &EvalOptions,
    ) -> Result<EvalValue> {
        let target = context.target.ok_or(EvalError::NotAttached)?;
        let thread = match context.thread {
            Some(thread) => thread,
            None => target.current_thread()?,
        };
        let frame_base = match context.frame_base {
            Some(base) => base,
            None => target.get_register(thread, Register::Rbp.name())?.as_u64(),
        };
        let ty = result_type(&module);

        let code = injector::prepare(module, target, options.policy)?;
        let coordinator = RunCoordinator::new(target);
        // 呼び出しを開始できなかった場合はイメージを残さない
        let call_at = |entry: u64| {
            let call = CallSite {
                entry,
                trampoline: code.trampoline,
            };
            coordinator
                .call_and_wait(thread, call, &[frame_base], options.timeout)
                .map_err(|e| {
                    release(target, &code);
                    EvalError::from(e)
                })
        };

        if options.policy == ExecutionPolicy::TopLevel {
            for &ctor in &code.constructors {
                let outcome = call_at(ctor)?;
                finish_call(target, &code, outcome, thread, options)?;
            }

            let names = code.globals.iter().map(|g| g.name.clone()).collect();
            if options.keep_persistent {
                for global in &code.globals {
                    self.persistent.insert(VariableInfo {
                        name: global.name.clone(),
                        location: VariableLocation::Global(global.address),
                        ty: global.ty,
                    });
                }
                self.images.push(code.base);
            } else {
                release(target, &code);
            }
            return Ok(EvalValue::Declared(names));
        }

        let Some(entry) = code.entry else {
            release(target, &code);
            return Err(EvalError::EntryNotFound(
                kotoba_expr::ir::EXPR_FUNCTION_NAME.to_string(),
            ));
        };
        let outcome = call_at(entry)?;
        let raw = finish_call(target, &code, outcome, thread, options)?;
        release(target, &code);

        Ok(EvalValue::Scalar {
            raw: ty.storage().convert(raw as i64),
            ty,
        })
    }
}

/// 式関数の結果型
fn result_type(module: &IrModule) -> ValueType {
    module
        .entry_function()
        .map(|(_, f)| f.result)
        .unwrap_or(ValueType::INT)
}

/// 呼び出しの結果を値またはエラーにする
///
/// 関数が完了しなかった場合、タイムアウト以外ではコード領域を解放します。
fn finish_call(
    target: &dyn RemoteTarget,
    code: &PreparedCode,
    outcome: CallOutcome,
    thread: ThreadHandle,
    options: &EvalOptions,
) -> Result<u64> {
    match outcome {
        CallOutcome::Completed(value) => Ok(value),
        // スレッドはまだコード領域の中にいる
        CallOutcome::Timeout => Err(EvalError::Timeout {
            timeout: options.timeout,
            thread,
        }),
        CallOutcome::TargetExited(code) => Err(EvalError::TargetExited(code)),
        CallOutcome::Fault(reason) => {
            release(target, code);
            Err(EvalError::Fault(reason))
        }
    }
}

fn release(target: &dyn RemoteTarget, code: &PreparedCode) {
    if let Err(e) = code.release(target) {
        warn!("Failed to release injected code at 0x{:x}: {}", code.base, e);
    }
}
