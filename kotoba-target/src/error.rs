//! ターゲット制御のエラー型

use crate::ThreadHandle;
use thiserror::Error;

/// リモートターゲット操作のエラー
#[derive(Debug, Error)]
pub enum TargetError {
    /// 未知のレジスタ名
    ///
    /// 呼び出し側で回復可能なエラーとして扱います。
    #[error("unknown register '{0}'")]
    UnknownRegister(String),

    /// レジスタ幅と値の論理幅が一致しない
    #[error("register '{name}' is {expected} bytes wide, but a {actual}-byte value was given")]
    WidthMismatch {
        name: String,
        expected: usize,
        actual: usize,
    },

    /// 停止していないスレッドに対する操作
    #[error("thread {0} is running")]
    ThreadRunning(ThreadHandle),

    /// 存在しないスレッド
    #[error("no such thread: {0}")]
    NoSuchThread(ThreadHandle),

    /// プロセスが終了している
    #[error("process exited with status {0}")]
    ProcessExited(i32),

    /// メモリアクセスの失敗
    #[error("memory access failed at 0x{addr:x}: {reason}")]
    MemoryFault { addr: u64, reason: String },

    /// ターゲット内のメモリ確保の失敗
    #[error("failed to allocate {size} bytes in the target: {reason}")]
    Allocation { size: usize, reason: String },

    /// デバッガエンジンへの要求の失敗
    #[error("engine request '{request}' failed: {reason}")]
    Engine { request: String, reason: String },

    /// 予期しない停止
    #[error("thread {thread} stopped unexpectedly: {status}")]
    UnexpectedStop { thread: ThreadHandle, status: String },

    /// OSのシステムコールエラー
    #[error(transparent)]
    Os(#[from] nix::errno::Errno),

    /// I/Oエラー
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// バックエンドが停止している
    #[error("target backend is no longer running")]
    Detached,
}

impl TargetError {
    /// エンジン要求の失敗を作成する
    pub fn engine(request: impl Into<String>, reason: impl Into<String>) -> Self {
        TargetError::Engine {
            request: request.into(),
            reason: reason.into(),
        }
    }
}
