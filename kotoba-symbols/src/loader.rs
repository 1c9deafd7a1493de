//! ELFの読み込み機能

use crate::{Result, Symbol, SymbolError, SymbolKind};
use kotoba_target::ModuleInfo;
use object::{Object, ObjectKind, ObjectSegment, ObjectSymbol};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

const PAGE_MASK: u64 = !0xfff;

/// 読み込み済みのELFイメージ
///
/// シンボルテーブルは読み込み時に全て取り出すため、ファイルの内容は保持しません。
pub struct ElfImage {
    path: PathBuf,
    is_pie: bool,
    /// 最初のPT_LOADセグメントのリンク時アドレス（ページ境界）
    link_base: u64,
    symbols: Vec<Symbol>,
}

impl ElfImage {
    /// ELFファイルを読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let data = fs::read(path).map_err(|source| SymbolError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let object_file = object::File::parse(&*data).map_err(|e| SymbolError::Parse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        // ET_DYN (Dynamic/Shared Object) = PIE実行ファイルまたは共有ライブラリ
        // ET_EXEC (Executable) = 非PIE実行ファイル
        let is_pie = matches!(object_file.kind(), ObjectKind::Dynamic);
        let link_base = object_file
            .segments()
            .map(|s| s.address())
            .min()
            .unwrap_or(0)
            & PAGE_MASK;

        // .symtab が削除されている場合は .dynsym だけが残る
        let mut seen = HashSet::new();
        let mut symbols = Vec::new();
        for symbol in object_file.symbols().chain(object_file.dynamic_symbols()) {
            if !symbol.is_definition() {
                continue;
            }
            let Ok(name) = symbol.name() else {
                continue;
            };
            if name.is_empty() || !seen.insert(name.to_string()) {
                continue;
            }
            let kind = match symbol.kind() {
                object::SymbolKind::Text => SymbolKind::Function,
                object::SymbolKind::Data => SymbolKind::Data,
                _ => SymbolKind::Other,
            };
            symbols.push(Symbol::new(name.to_string(), symbol.address(), symbol.size(), kind));
        }

        debug!(
            "Loaded {} symbols from {:?} (pie={}, link base 0x{:x})",
            symbols.len(),
            path,
            is_pie,
            link_base
        );

        Ok(Self {
            path: path.to_path_buf(),
            is_pie,
            link_base,
            symbols,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// PIE（Position Independent Executable）かどうかを判定する
    ///
    /// PIE実行ファイルの場合、シンボルアドレスはオフセットであり、
    /// 実行時ベースアドレスを加算する必要があります。
    pub fn is_pie(&self) -> bool {
        self.is_pie
    }

    pub fn symbols(&self) -> &[Symbol] {
        &self.symbols
    }

    /// ロード済みモジュールからこのイメージのロードバイアスを求める
    ///
    /// 非PIEでは常に0です。PIEで対応するモジュールが見つからない場合は `None` を返します。
    pub fn load_bias(&self, modules: &[ModuleInfo]) -> Option<u64> {
        if !self.is_pie {
            return Some(0);
        }
        let file_name = self.path.file_name()?;
        let module = modules.iter().find(|m| {
            let name = m.name.trim_end_matches(" (deleted)");
            Path::new(name).file_name() == Some(file_name)
        })?;
        Some(module.base.wrapping_sub(self.link_base))
    }
}
