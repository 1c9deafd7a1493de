//! Kotoba 式コンパイラ
//!
//! デバッガに入力された式をIRモジュールへコンパイルし、診断のfix-itを適用しながら
//! 再コンパイルを繰り返す仕組みを提供します。
//!
//! - [`FixupLoop`]: 診断に付随するfix-itを適用して再試行する
//! - [`CompileSession`]: 1回のコンパイル（インクルードの蓄積と診断位置の補正）
//! - [`CFamilyCompiler`]: 組み込みのC系整数式フロントエンド
//! - [`Interpreter`]: ターゲットに触れずにIRを評価するインタプリタ

pub mod expression;
pub mod diagnostic;
pub mod fixit;
pub mod ir;
pub mod interp;
pub mod compiler;
pub mod session;
pub mod fixup;
mod lexer;
pub mod cfamily;

pub use expression::{Expression, Language, ResultType};
pub use diagnostic::{fold_notes, Diagnostic, FixIt, Severity};
pub use fixit::{apply_fixits, FixItError};
pub use ir::{BinOp, Inst, IrFunction, IrGlobal, IrModule, Place, Scalar, UnOp, ValueType};
pub use interp::{InterpretError, Interpreter};
pub use compiler::{
    CompileOptions, CompileOutput, Compiler, Completion, NoSymbols, SymbolLookup, VariableInfo,
    VariableLocation,
};
pub use session::{CompileSession, SessionOutput, SessionState};
pub use fixup::{FixupFailure, FixupLoop, FixupStop, FixupSuccess};
pub use cfamily::CFamilyCompiler;
