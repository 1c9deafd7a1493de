//! Kotoba デバッガのコア機能
//!
//! このクレートは、デバッガに入力された式をコンパイルし、デバッガ側で解釈実行するか、
//! 停止中のターゲットプロセスに機械語として注入して実行するかを決めて評価します。
//!
//! - [`ExecutionPlanner`]: 実行方針に従って実行経路を決める状態機械
//! - [`injector`]: IRモジュールをx86-64機械語に変換してターゲットに書き込む
//! - [`RunCoordinator`]: 注入した関数を呼び出し、イベントゲートで完了を待つ
//! - [`Evaluator`]: これらをつなぐ式評価の入口

pub mod options;
pub mod errors;
pub mod planner;
pub mod codegen;
pub mod disasm;
pub mod injector;
pub mod coordinator;
pub mod evaluator;
pub mod debugger;
pub mod command;
pub mod parse;

pub use options::{EvalOptions, ExecutionPolicy};
pub use errors::EvalError;
pub use planner::{ExecutionPlanner, PlanError, PlanState, Route};
pub use injector::{InjectError, PreparedCode};
pub use coordinator::{CallOutcome, CallSite, RunCoordinator, RunError, StopOutcome};
pub use evaluator::{EvalContext, EvalValue, Evaluation, Evaluator, PersistentScope};
pub use debugger::{Breakpoint, BreakpointId, Debugger};
pub use command::{Command, ExprOverrides};

// 他のクレートから使用するために再エクスポート
pub use kotoba_symbols::Symbol;
pub use kotoba_target::{RegisterValue, ThreadHandle};

/// 式評価の結果型
pub type Result<T> = std::result::Result<T, EvalError>;
