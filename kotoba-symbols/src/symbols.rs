//! シンボル解決機能

use crate::ElfImage;
use std::collections::HashMap;

/// シンボルの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    Function,
    Data,
    Other,
}

/// シンボル情報
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    /// マングルされたシンボル名
    pub name: String,
    /// デマングルされたシンボル名（可読な形式）
    pub demangled_name: String,
    /// リンク時アドレス（PIEではロードバイアスを含まない）
    pub address: u64,
    pub size: u64,
    pub kind: SymbolKind,
}

impl Symbol {
    /// シンボルを作成し、デマングルされた名前を設定する
    pub fn new(name: String, address: u64, size: u64, kind: SymbolKind) -> Self {
        let demangled_name = demangle_symbol(&name);
        Self {
            name,
            demangled_name,
            address,
            size,
            kind,
        }
    }

    /// 表示用の名前を取得（デマングル可能ならデマングル後、できなければマングル名）
    pub fn display_name(&self) -> &str {
        &self.demangled_name
    }
}

/// シンボル名をデマングルする
fn demangle_symbol(name: &str) -> String {
    if let Ok(demangled) = rustc_demangle::try_demangle(name) {
        return format!("{:#}", demangled);
    }
    // C++のマングル名はそのまま
    name.to_string()
}

/// シンボル解決
pub struct SymbolResolver {
    /// シンボル名（マングル名とデマングル名の両方） -> インデックス
    by_name: HashMap<String, usize>,
    /// アドレス順のシンボル
    by_address: Vec<Symbol>,
}

impl SymbolResolver {
    /// ELFイメージからシンボル解決を作成する
    pub fn new(image: &ElfImage) -> Self {
        Self::from_symbols(image.symbols().to_vec())
    }

    pub fn from_symbols(mut symbols: Vec<Symbol>) -> Self {
        symbols.sort_by_key(|s| s.address);
        let mut by_name = HashMap::new();
        for (i, sym) in symbols.iter().enumerate() {
            by_name.entry(sym.name.clone()).or_insert(i);
            by_name.entry(sym.demangled_name.clone()).or_insert(i);
        }
        Self {
            by_name,
            by_address: symbols,
        }
    }

    /// シンボル名（マングル名またはデマングル名）からシンボルを探す
    pub fn lookup(&self, name: &str) -> Option<&Symbol> {
        self.by_name.get(name).map(|&i| &self.by_address[i])
    }

    /// シンボル名からリンク時アドレスを解決する
    pub fn resolve(&self, name: &str) -> Option<u64> {
        self.lookup(name).map(|s| s.address)
    }

    /// アドレスからシンボルを解決する（最も近いシンボルを返す）
    pub fn reverse_resolve(&self, addr: u64) -> Option<&Symbol> {
        let idx = match self.by_address.binary_search_by_key(&addr, |s| s.address) {
            Ok(idx) => return Some(&self.by_address[idx]),
            Err(0) => return None,
            Err(idx) => idx - 1,
        };
        let sym = &self.by_address[idx];
        // サイズ情報がない場合は単純に最も近いシンボルを返す
        (sym.size == 0 || addr < sym.address + sym.size).then_some(sym)
    }

    /// すべてのシンボルを取得する
    pub fn all_symbols(&self) -> impl Iterator<Item = &Symbol> {
        self.by_address.iter()
    }

    /// パターンにマッチするシンボルを検索する
    /// マングル名とデマングル名の両方で検索する
    pub fn find_symbols(&self, pattern: &str) -> Vec<&Symbol> {
        self.by_address
            .iter()
            .filter(|s| s.name.contains(pattern) || s.demangled_name.contains(pattern))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> SymbolResolver {
        SymbolResolver::from_symbols(vec![
            Symbol::new("main".into(), 0x1200, 0x40, SymbolKind::Function),
            Symbol::new("counter".into(), 0x4010, 4, SymbolKind::Data),
            Symbol::new(
                "_ZN7example6helper17h0123456789abcdefE".into(),
                0x1100,
                0x20,
                SymbolKind::Function,
            ),
            Symbol::new("_start".into(), 0x1000, 0, SymbolKind::Function),
        ])
    }

    #[test]
    fn test_demangle_rust_symbol() {
        let r = resolver();
        let sym = r.lookup("example::helper").unwrap();
        assert_eq!(sym.name, "_ZN7example6helper17h0123456789abcdefE");
        assert_eq!(sym.display_name(), "example::helper");
        // C++やCの名前はそのまま
        assert_eq!(r.lookup("main").unwrap().display_name(), "main");
    }

    #[test]
    fn test_reverse_resolve() {
        let r = resolver();
        assert_eq!(r.reverse_resolve(0x1210).unwrap().name, "main");
        assert_eq!(r.reverse_resolve(0x1100).unwrap().demangled_name, "example::helper");
        // サイズの範囲外
        assert!(r.reverse_resolve(0x1250).is_none());
        // サイズ不明のシンボルは最も近いものを返す
        assert_eq!(r.reverse_resolve(0x1050).unwrap().name, "_start");
        assert!(r.reverse_resolve(0x10).is_none());
    }

    #[test]
    fn test_find_symbols() {
        let r = resolver();
        let found: Vec<_> = r.find_symbols("help").iter().map(|s| s.address).collect();
        assert_eq!(found, vec![0x1100]);
        assert_eq!(r.resolve("counter"), Some(0x4010));
    }
}
