//! コンパイラとシンボル解決のインターフェース

use crate::{apply_fixits, Diagnostic, FixIt, FixItError, Interpreter, IrModule, Language, ResultType, ValueType};

/// コンパイルオプション
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CompileOptions {
    pub language: Language,
    pub result_type: ResultType,
    /// トップレベル宣言としてコンパイルする
    pub top_level: bool,
}

/// 1回のコンパイル結果
#[derive(Debug, Clone, Default)]
pub struct CompileOutput {
    /// エラーがあった場合は `None`
    pub module: Option<IrModule>,
    pub diagnostics: Vec<Diagnostic>,
}

impl CompileOutput {
    pub fn has_errors(&self) -> bool {
        self.diagnostics.iter().any(Diagnostic::is_error)
    }
}

/// 変数の格納場所
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariableLocation {
    /// 固定アドレス（グローバル変数や永続化されたトップレベル宣言）
    Global(u64),
    /// 現在のフレームベースからのオフセット
    Frame(i64),
}

/// 式から参照できる変数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableInfo {
    pub name: String,
    pub location: VariableLocation,
    pub ty: ValueType,
}

/// 式中の名前を解決する
pub trait SymbolLookup {
    fn lookup(&self, name: &str) -> Option<VariableInfo>;

    /// タイプミスの修正候補に使う名前の一覧
    fn candidates(&self) -> Vec<String>;
}

/// 補完の候補
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Completion {
    /// 置き換える語の開始位置（バイト）
    pub start: usize,
    /// 語を置き換える候補（辞書順）
    pub candidates: Vec<String>,
}

impl Completion {
    /// `pos` の直前にある識別子を、`names` のうちそれで始まるもので補完する
    ///
    /// 内部用の `$__` で始まる名前は候補にしません。
    pub fn identifier<I, S>(text: &str, pos: usize, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let pos = pos.min(text.len());
        let Some(before) = text.get(..pos) else {
            return Self::default();
        };
        let start = before
            .char_indices()
            .rev()
            .take_while(|&(_, c)| c.is_ascii_alphanumeric() || c == '_' || c == '$')
            .last()
            .map_or(pos, |(i, _)| i);
        let prefix = &before[start..];
        if prefix.starts_with(|c: char| c.is_ascii_digit()) {
            return Self {
                start,
                candidates: Vec::new(),
            };
        }

        let mut candidates: Vec<String> = names
            .into_iter()
            .map(Into::into)
            .filter(|name| name.starts_with(prefix) && !name.starts_with("$__"))
            .collect();
        candidates.sort();
        candidates.dedup();
        Self { start, candidates }
    }
}

/// 何も解決しないシンボル表
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSymbols;

impl SymbolLookup for NoSymbols {
    fn lookup(&self, _name: &str) -> Option<VariableInfo> {
        None
    }

    fn candidates(&self) -> Vec<String> {
        Vec::new()
    }
}

/// 式のコンパイラ
pub trait Compiler {
    /// 式テキストをIRモジュールにコンパイルする
    fn compile(&self, text: &str, options: &CompileOptions, symbols: &dyn SymbolLookup) -> CompileOutput;

    /// モジュールをターゲットなしで評価できるか判定する
    fn can_interpret(&self, module: &IrModule) -> Result<(), String> {
        Interpreter::can_interpret(module)
    }

    /// `text` の `pos` にある語の補完候補を返す
    fn complete(
        &self,
        text: &str,
        pos: usize,
        _options: &CompileOptions,
        symbols: &dyn SymbolLookup,
    ) -> Completion {
        Completion::identifier(text, pos, symbols.candidates())
    }

    /// エラー診断のfix-itを全て適用したテキストを返す
    fn apply_fix_its(&self, text: &str, diagnostics: &[Diagnostic]) -> Result<String, FixItError> {
        let fixits: Vec<FixIt> = diagnostics
            .iter()
            .filter(|d| d.is_error())
            .flat_map(|d| d.fixits.iter().cloned())
            .collect();
        apply_fixits(text, &fixits)
    }
}
