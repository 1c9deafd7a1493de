//! 式から参照できるグローバル変数のスコープ

use crate::{SymbolKind, SymbolResolver};
use kotoba_expr::{Scalar, SymbolLookup, ValueType, VariableInfo, VariableLocation};
use std::collections::BTreeMap;

/// シンボルテーブルのデータシンボルから作るグローバルスコープ
///
/// 型情報を持たないため、サイズが1/2/4/8バイトのデータシンボルを
/// 同じ幅の符号付き整数として公開します。
#[derive(Debug, Clone, Default)]
pub struct GlobalScope {
    entries: BTreeMap<String, VariableInfo>,
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn scalar_for_size(size: u64) -> Option<Scalar> {
    match size {
        1 => Some(Scalar::I8),
        2 => Some(Scalar::I16),
        4 => Some(Scalar::I32),
        8 => Some(Scalar::I64),
        _ => None,
    }
}

impl GlobalScope {
    /// ロードバイアスを加えた実行時アドレスでスコープを作る
    pub fn new(resolver: &SymbolResolver, bias: u64) -> Self {
        let mut entries = BTreeMap::new();
        for sym in resolver.all_symbols() {
            // マングルされた名前は式から参照できない
            if sym.kind != SymbolKind::Data
                || sym.demangled_name != sym.name
                || !is_identifier(&sym.name)
            {
                continue;
            }
            let Some(scalar) = scalar_for_size(sym.size) else {
                continue;
            };
            entries.entry(sym.name.clone()).or_insert_with(|| VariableInfo {
                name: sym.name.clone(),
                location: VariableLocation::Global(sym.address.wrapping_add(bias)),
                ty: ValueType::Scalar(scalar),
            });
        }
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl SymbolLookup for GlobalScope {
    fn lookup(&self, name: &str) -> Option<VariableInfo> {
        self.entries.get(name).cloned()
    }

    fn candidates(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }
}
