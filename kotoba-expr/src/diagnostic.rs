//! コンパイラ診断とfix-it

use std::fmt;

/// 診断の重大度
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Note,
    Remark,
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Remark => "remark",
            Severity::Note => "note",
        })
    }
}

/// ソースの書き換え指示
///
/// `start..end` のバイト範囲を `replacement` で置き換えます。範囲が空なら挿入です。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixIt {
    pub start: usize,
    pub end: usize,
    pub replacement: String,
}

impl FixIt {
    pub fn replace(start: usize, end: usize, replacement: impl Into<String>) -> Self {
        Self {
            start,
            end,
            replacement: replacement.into(),
        }
    }

    /// `offset` への挿入
    pub fn insert(offset: usize, text: impl Into<String>) -> Self {
        Self::replace(offset, offset, text)
    }

    pub fn is_insertion(&self) -> bool {
        self.start == self.end
    }
}

/// コンパイラ診断
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
    /// 式テキスト内のバイトオフセット
    pub offset: Option<usize>,
    pub fixits: Vec<FixIt>,
}

impl Diagnostic {
    pub fn new(severity: Severity, message: impl Into<String>, offset: Option<usize>) -> Self {
        Self {
            severity,
            message: message.into(),
            offset,
            fixits: Vec::new(),
        }
    }

    pub fn error(message: impl Into<String>, offset: usize) -> Self {
        Self::new(Severity::Error, message, Some(offset))
    }

    pub fn warning(message: impl Into<String>, offset: usize) -> Self {
        Self::new(Severity::Warning, message, Some(offset))
    }

    pub fn note(message: impl Into<String>, offset: usize) -> Self {
        Self::new(Severity::Note, message, Some(offset))
    }

    pub fn with_fixit(mut self, fixit: FixIt) -> Self {
        self.fixits.push(fixit);
        self
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }

    pub fn has_fixits(&self) -> bool {
        !self.fixits.is_empty()
    }

    /// 式テキストを添えてキャレット付きで表示用に整形する
    pub fn render(&self, source: &str) -> String {
        let mut out = self.to_string();
        if let Some(offset) = self.offset {
            // 最初の行だけを示す（メッセージに追記されたnoteは位置を持たない）
            let line_start = source[..offset.min(source.len())]
                .rfind('\n')
                .map_or(0, |i| i + 1);
            let line_end = source[line_start..]
                .find('\n')
                .map_or(source.len(), |i| line_start + i);
            let column = source[line_start..offset.min(line_end)].chars().count();
            out.push('\n');
            out.push_str(&source[line_start..line_end]);
            out.push('\n');
            out.push_str(&" ".repeat(column));
            out.push('^');
        }
        out
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.severity, self.message)
    }
}

/// noteを直前の診断のメッセージに追記し、エラー以外のfix-itを落とす
///
/// 先頭にnoteしかない場合は、そのnoteを単独の診断として残します。
pub fn fold_notes(diagnostics: Vec<Diagnostic>) -> Vec<Diagnostic> {
    let mut folded: Vec<Diagnostic> = Vec::with_capacity(diagnostics.len());
    for mut diag in diagnostics {
        if diag.severity == Severity::Note {
            if let Some(last) = folded.last_mut() {
                last.message.push('\n');
                last.message.push_str(&diag.to_string());
                continue;
            }
        }
        if !diag.is_error() {
            diag.fixits.clear();
        }
        folded.push(diag);
    }
    folded
}
