//! シンボル解決のエラー型

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SymbolError {
    /// ファイルを読み込めない
    #[error("failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// ELFとして解析できない
    #[error("failed to parse {path:?}: {reason}")]
    Parse { path: PathBuf, reason: String },
}
