//! Kotoba ターゲットプロセス制御
//!
//! このクレートは、式評価の実行先となるデバッグ対象プロセスを制御するための
//! 共通インターフェース（[`RemoteTarget`]）と、その2つのバックエンドを提供します。
//!
//! - [`NativeTarget`]: ptraceによるネイティブバックエンド（Linux x86-64）
//! - [`EngineTarget`]: デバッガエンジンのインターフェース経由のバックエンド
//!
//! どちらのバックエンドも、ブレークポイントの到達を [`EventGate`] に通知し、
//! コントローラスレッドの待機を解放します。

pub mod error;
pub mod thread;
pub mod registers;
pub mod remote;
pub mod gate;
pub mod engine;

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub mod memory;
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub mod breakpoint;
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub mod native;

pub use error::TargetError;
pub use thread::ThreadHandle;
pub use registers::{Register, RegisterSnapshot, RegisterValue, RegisterWidth, ARGUMENT_REGISTERS};
pub use remote::{BreakpointRecord, ModuleInfo, RemoteTarget};
pub use gate::{BreakpointHit, EventGate, GateSignal, WaitError, Waiter};
pub use engine::{
    DebugEngine, EngineTarget, EngineValue, EngineValueKind, EventCallbacks, EventStatus,
    OutputCallbacks,
};

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub use native::NativeTarget;

/// ターゲット制御の結果型
pub type Result<T> = std::result::Result<T, TargetError>;
