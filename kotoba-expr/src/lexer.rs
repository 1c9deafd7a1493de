//! C系の字句解析

use crate::Diagnostic;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TokenKind {
    Int {
        value: u64,
        unsigned: bool,
        long: bool,
        /// 10進表記か（型の決め方が異なる）
        decimal: bool,
    },
    Char(i64),
    Ident(String),
    Punct(&'static str),
    Eof,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Token {
    pub kind: TokenKind,
    pub start: usize,
    pub end: usize,
}

impl Token {
    pub fn is_punct(&self, p: &str) -> bool {
        matches!(self.kind, TokenKind::Punct(q) if q == p)
    }
}

static PUNCTUATORS: [&str; 47] = [
    "<<=", ">>=", "...", "->", "++", "--", "<<", ">>", "<=", ">=", "==", "!=", "&&", "||", "+=",
    "-=", "*=", "/=", "%=", "&=", "|=", "^=", "::", "+", "-", "*", "/", "%", "&", "|", "^", "~",
    "!", "<", ">", "=", "?", ":", "(", ")", "[", "]", "{", "}", ",", ";", ".",
];

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_' || c == '$'
}

fn is_ident_continue(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '$'
}

struct Lexer<'a> {
    text: &'a str,
    pos: usize,
    tokens: Vec<Token>,
    diagnostics: Vec<Diagnostic>,
}

/// テキストを字句に分割する
///
/// 字句エラーは診断として報告し、問題の箇所を読み飛ばして続行します。
/// 結果の末尾には必ず [`TokenKind::Eof`] があります。
pub(crate) fn tokenize(text: &str) -> (Vec<Token>, Vec<Diagnostic>) {
    let mut lexer = Lexer {
        text,
        pos: 0,
        tokens: Vec::new(),
        diagnostics: Vec::new(),
    };
    lexer.run();
    let Lexer {
        tokens, diagnostics, ..
    } = lexer;
    (tokens, diagnostics)
}

impl<'a> Lexer<'a> {
    fn rest(&self) -> &'a str {
        &self.text[self.pos..]
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn push(&mut self, kind: TokenKind, start: usize) {
        self.tokens.push(Token {
            kind,
            start,
            end: self.pos,
        });
    }

    fn error(&mut self, message: impl Into<String>, offset: usize) {
        self.diagnostics.push(Diagnostic::error(message, offset));
    }

    fn at_line_start(&self) -> bool {
        self.text[..self.pos]
            .rsplit('\n')
            .next()
            .is_some_and(|line| line.trim().is_empty())
    }

    fn skip_while(&mut self, f: impl Fn(char) -> bool) {
        while let Some(c) = self.peek() {
            if !f(c) {
                break;
            }
            self.pos += c.len_utf8();
        }
    }

    fn run(&mut self) {
        while let Some(c) = self.peek() {
            let start = self.pos;
            if c.is_whitespace() {
                self.pos += c.len_utf8();
            } else if self.rest().starts_with("//") {
                self.skip_while(|c| c != '\n');
            } else if self.rest().starts_with("/*") {
                match self.rest()[2..].find("*/") {
                    Some(end) => self.pos += end + 4,
                    None => {
                        self.error("unterminated /* comment", start);
                        self.pos = self.text.len();
                    }
                }
            } else if c == '#' && self.at_line_start() {
                self.directive();
            } else if is_ident_start(c) {
                self.skip_while(is_ident_continue);
                let name = self.text[start..self.pos].to_string();
                self.push(TokenKind::Ident(name), start);
            } else if c.is_ascii_digit() {
                self.number();
            } else if c == '\'' {
                self.char_literal();
            } else if c == '"' {
                self.pos += 1;
                self.skip_while(|c| c != '"' && c != '\n');
                if self.peek() == Some('"') {
                    self.pos += 1;
                }
                self.error("string literals are not supported in expressions", start);
            } else if let Some(p) = PUNCTUATORS.iter().find(|p| self.rest().starts_with(**p)) {
                self.pos += p.len();
                self.push(TokenKind::Punct(*p), start);
            } else {
                self.pos += c.len_utf8();
                self.error(format!("unexpected character '{}'", c), start);
            }
        }
        let end = self.text.len();
        self.tokens.push(Token {
            kind: TokenKind::Eof,
            start: end,
            end,
        });
    }

    /// 前処理指令（インクルードだけを受け付けて読み飛ばす）
    fn directive(&mut self) {
        let text = self.text;
        let start = self.pos;
        self.skip_while(|c| c != '\n');
        let line = &text[start..self.pos];
        let name = line[1..].trim_start();
        if !(name.starts_with("include") || name.starts_with("import")) {
            self.error("invalid preprocessing directive", start);
        }
    }

    fn number(&mut self) {
        let text = self.text;
        let start = self.pos;
        let rest = self.rest();
        let (radix, prefix) = if rest.starts_with("0x") || rest.starts_with("0X") {
            (16, 2)
        } else if rest.starts_with("0b") || rest.starts_with("0B") {
            (2, 2)
        } else if rest.starts_with('0') && rest[1..].starts_with(|c: char| c.is_ascii_digit()) {
            (8, 1)
        } else {
            (10, 0)
        };
        self.pos += prefix;
        let digits_start = self.pos;
        self.skip_while(|c| c.is_ascii_hexdigit() && (radix == 16 || c.is_ascii_digit()));
        let digits = &text[digits_start..self.pos];

        if self.peek() == Some('.') {
            self.skip_while(|c| c.is_ascii_alphanumeric() || c == '.');
            self.error("floating-point literals are not supported in expressions", start);
            return;
        }

        let suffix_start = self.pos;
        self.skip_while(is_ident_continue);
        let suffix = &text[suffix_start..self.pos];
        let lower = suffix.to_ascii_lowercase();
        let unsigned = lower.matches('u').count();
        let long = lower.matches('l').count();
        if unsigned > 1 || long > 2 || lower.chars().any(|c| c != 'u' && c != 'l') {
            self.error(
                format!("invalid suffix '{}' on integer constant", suffix),
                suffix_start,
            );
            return;
        }

        if digits.is_empty() {
            self.error("expected digits after the base prefix", start);
            return;
        }
        if let Some((i, bad)) = digits.char_indices().find(|(_, c)| !c.is_digit(radix)) {
            let base = match radix {
                2 => "binary",
                8 => "octal",
                _ => "decimal",
            };
            self.error(
                format!("invalid digit '{}' in {} constant", bad, base),
                digits_start + i,
            );
            return;
        }

        match u64::from_str_radix(digits, radix) {
            Ok(value) => self.push(
                TokenKind::Int {
                    value,
                    unsigned: unsigned == 1,
                    long: long > 0,
                    decimal: radix == 10,
                },
                start,
            ),
            Err(_) => self.error(
                "integer literal is too large to be represented in any integer type",
                start,
            ),
        }
    }

    fn char_literal(&mut self) {
        let start = self.pos;
        self.pos += 1;
        let value = match self.peek() {
            Some('\\') => {
                self.pos += 1;
                let escape = self.peek();
                if let Some(c) = escape {
                    self.pos += c.len_utf8();
                }
                match escape {
                    Some('n') => Some(b'\n' as i64),
                    Some('t') => Some(b'\t' as i64),
                    Some('r') => Some(b'\r' as i64),
                    Some('0') => Some(0),
                    Some('a') => Some(7),
                    Some('b') => Some(8),
                    Some('\\') => Some(b'\\' as i64),
                    Some('\'') => Some(b'\'' as i64),
                    Some('"') => Some(b'"' as i64),
                    Some('x') => {
                        let hex_start = self.pos;
                        self.skip_while(|c| c.is_ascii_hexdigit());
                        i64::from_str_radix(&self.text[hex_start..self.pos], 16)
                            .ok()
                            .map(|v| v as u8 as i8 as i64)
                    }
                    _ => None,
                }
            }
            Some(c) if c != '\'' && c != '\n' => {
                self.pos += c.len_utf8();
                c.is_ascii().then_some(c as i64)
            }
            _ => None,
        };

        if self.peek() != Some('\'') {
            self.skip_while(|c| c != '\'' && c != '\n');
            if self.peek() == Some('\'') {
                self.pos += 1;
                self.error("character literal must contain a single ASCII character", start);
            } else {
                self.error("missing terminating ' character", start);
            }
            return;
        }
        self.pos += 1;
        match value {
            Some(v) => self.push(TokenKind::Char(v), start),
            None => self.error("invalid character literal", start),
        }
    }
}
