//! Kotoba シンボル解決
//!
//! このクレートは、ELFファイルのシンボルテーブルを読み込み、式から参照される名前を
//! 実行中のプロセス内のアドレスへ解決する機能を提供します。
//! PIE実行ファイルでは、ロード済みモジュールの情報からロードバイアスを求めて加算します。

pub mod error;
pub mod loader;
pub mod symbols;
pub mod scope;

pub use error::SymbolError;
pub use loader::ElfImage;
pub use symbols::{Symbol, SymbolKind, SymbolResolver};
pub use scope::GlobalScope;

/// シンボル解決の結果型
pub type Result<T> = std::result::Result<T, SymbolError>;
