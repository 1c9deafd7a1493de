//! 評価対象の式

use std::fmt;
use std::str::FromStr;

/// 式のソース言語
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Language {
    C,
    #[default]
    Cpp,
    ObjC,
    ObjCpp,
}

impl Language {
    /// 言語ごとに予約されたキーワード（識別子として使えない名前）
    pub fn keywords(self) -> &'static [&'static str] {
        match self {
            Language::C => &["sizeof", "_Bool"],
            Language::Cpp => &["sizeof", "true", "false", "nullptr", "bool"],
            Language::ObjC => &["sizeof", "YES", "NO", "nil", "BOOL", "_Bool"],
            Language::ObjCpp => &[
                "sizeof", "true", "false", "nullptr", "bool", "YES", "NO", "nil", "BOOL",
            ],
        }
    }

    /// 名前が予約語か
    pub fn is_keyword(self, name: &str) -> bool {
        self.keywords().contains(&name)
    }

    pub fn name(self) -> &'static str {
        match self {
            Language::C => "c",
            Language::Cpp => "c++",
            Language::ObjC => "objective-c",
            Language::ObjCpp => "objective-c++",
        }
    }
}

impl FromStr for Language {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "c" => Ok(Language::C),
            "c++" | "cpp" | "cxx" => Ok(Language::Cpp),
            "objc" | "objective-c" => Ok(Language::ObjC),
            "objc++" | "objective-c++" => Ok(Language::ObjCpp),
            other => Err(format!("unknown language '{}'", other)),
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// 呼び出し側が希望する結果の型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResultType {
    /// 式の型のまま
    #[default]
    Default,
    Integer,
    Unsigned,
    Bool,
    Address,
}

impl FromStr for ResultType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "default" => Ok(ResultType::Default),
            "int" | "integer" => Ok(ResultType::Integer),
            "unsigned" | "uint" => Ok(ResultType::Unsigned),
            "bool" => Ok(ResultType::Bool),
            "address" | "addr" | "pointer" => Ok(ResultType::Address),
            other => Err(format!("unknown result type '{}'", other)),
        }
    }
}

/// 評価する式
///
/// 不変です。fix-itを適用した結果は [`Expression::with_text`] で新しい式として作ります。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expression {
    text: String,
    result_type: ResultType,
    language: Language,
}

impl Expression {
    pub fn new(text: impl Into<String>, language: Language, result_type: ResultType) -> Self {
        Self {
            text: text.into(),
            result_type,
            language,
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn result_type(&self) -> ResultType {
        self.result_type
    }

    pub fn language(&self) -> Language {
        self.language
    }

    /// テキストだけを差し替えた式を作る
    pub fn with_text(&self, text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..self.clone()
        }
    }
}
