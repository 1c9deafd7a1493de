//! デバッガコマンド

use crate::parse::{parse_address, parse_value};
use crate::{EvalError, EvalOptions, ExecutionPolicy, Result};
use kotoba_expr::{Language, ResultType};

/// `x` コマンドで表示する既定のバイト数
pub const DEFAULT_EXAMINE_LEN: usize = 32;

/// コマンド名（補完用）
pub const COMMAND_NAMES: [&str; 12] = [
    "print", "expr", "top", "register", "x", "break", "continue", "find", "source", "help",
    "quit", "exit",
];

/// 引数が式になるコマンド
pub fn takes_expression(name: &str) -> bool {
    matches!(name, "print" | "p" | "expr" | "e" | "top")
}

/// `expr` コマンドで指定された設定の上書き
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExprOverrides {
    pub policy: Option<ExecutionPolicy>,
    pub language: Option<Language>,
    pub result_type: Option<ResultType>,
}

impl ExprOverrides {
    /// 既定の設定に上書きを適用する
    pub fn apply(&self, base: &EvalOptions) -> EvalOptions {
        let mut options = base.clone();
        if let Some(policy) = self.policy {
            options.policy = policy;
        }
        if let Some(language) = self.language {
            options.language = language;
        }
        if let Some(result_type) = self.result_type {
            options.result_type = result_type;
        }
        options
    }
}

/// デバッガコマンド
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// 式を既定の設定で評価
    Print(String),
    /// 設定を指定して式を評価
    Expr {
        text: String,
        overrides: ExprOverrides,
    },
    /// トップレベル宣言をターゲットに挿入
    Top(String),
    /// レジスタ読み取り
    RegisterRead(String),
    /// レジスタ書き込み
    RegisterWrite { name: String, value: u128 },
    /// メモリ表示
    Examine { address: u64, len: usize },
    /// ブレークポイントを設定
    Break(String),
    /// 実行継続
    Continue,
    /// シンボル検索
    Find(String),
    /// ファイルに書かれた式を評価
    Source(String),
    /// ヘルプ表示
    Help,
    /// 終了
    Quit,
}

fn usage(text: &str) -> EvalError {
    EvalError::InvalidArgument(format!("usage: {}", text))
}

/// 先頭の単語と残りに分ける
fn split_word(s: &str) -> (&str, &str) {
    let s = s.trim_start();
    match s.find(char::is_whitespace) {
        Some(i) => (&s[..i], &s[i..]),
        None => (s, ""),
    }
}

impl Command {
    /// コマンド文字列をパースする
    ///
    /// 未知のコマンドは `Ok(None)`、引数の誤りはエラーになります。
    pub fn parse(input: &str) -> Result<Option<Self>> {
        let (name, rest) = split_word(input);
        let args = rest.trim();

        let command = match name {
            "" => return Ok(None),
            "print" | "p" => {
                if args.is_empty() {
                    return Err(usage("print <expr>"));
                }
                Command::Print(args.to_string())
            }
            "expr" | "e" => Self::parse_expr(rest)?,
            "top" => {
                if args.is_empty() {
                    return Err(usage("top <declaration>"));
                }
                Command::Top(args.to_string())
            }
            "register" | "reg" => {
                let parts: Vec<&str> = args.split_whitespace().collect();
                match parts.as_slice() {
                    ["read", name] => Command::RegisterRead(name.to_string()),
                    ["write", name, value] => Command::RegisterWrite {
                        name: name.to_string(),
                        value: parse_value(value)?,
                    },
                    _ => return Err(usage("register read <name> | register write <name> <value>")),
                }
            }
            "x" => {
                let parts: Vec<&str> = args.split_whitespace().collect();
                match parts.as_slice() {
                    [address] => Command::Examine {
                        address: parse_address(address)?,
                        len: DEFAULT_EXAMINE_LEN,
                    },
                    [address, len] => Command::Examine {
                        address: parse_address(address)?,
                        len: len.parse().map_err(|_| {
                            EvalError::InvalidArgument(format!("Invalid length '{}'", len))
                        })?,
                    },
                    _ => return Err(usage("x <addr> [len]")),
                }
            }
            "break" | "b" => {
                if args.is_empty() {
                    return Err(usage("break <symbol|address>"));
                }
                Command::Break(args.to_string())
            }
            "continue" | "c" => Command::Continue,
            "find" => Command::Find(args.to_string()),
            "source" => {
                if args.is_empty() {
                    return Err(usage("source <file>"));
                }
                Command::Source(args.to_string())
            }
            "help" | "h" | "?" => Command::Help,
            "quit" | "q" | "exit" => Command::Quit,
            _ => return Ok(None),
        };
        Ok(Some(command))
    }

    /// `expr [--policy P] [--lang L] [--type T] -- <expr>`
    fn parse_expr(mut rest: &str) -> Result<Self> {
        let mut overrides = ExprOverrides::default();
        loop {
            let (word, tail) = split_word(rest);
            match word {
                "--" => {
                    rest = tail;
                    break;
                }
                "--policy" | "--lang" | "--type" => {
                    let (value, tail) = split_word(tail);
                    match word {
                        "--policy" => {
                            overrides.policy =
                                Some(value.parse::<ExecutionPolicy>().map_err(EvalError::InvalidArgument)?)
                        }
                        "--lang" => {
                            overrides.language =
                                Some(value.parse::<Language>().map_err(EvalError::InvalidArgument)?)
                        }
                        _ => {
                            overrides.result_type =
                                Some(value.parse::<ResultType>().map_err(EvalError::InvalidArgument)?)
                        }
                    }
                    rest = tail;
                }
                w if w.starts_with("--") => {
                    return Err(EvalError::InvalidArgument(format!("unknown option '{}'", w)))
                }
                _ => break,
            }
        }

        let text = rest.trim();
        if text.is_empty() {
            return Err(usage("expr [--policy P] [--lang L] [--type T] -- <expr>"));
        }
        Ok(Command::Expr {
            text: text.to_string(),
            overrides,
        })
    }
}
