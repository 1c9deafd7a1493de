//! REPLの補完
//!
//! 先頭の単語はコマンド名で、式を取るコマンドの引数はデバッガのシンボルと
//! キーワードで補完します。

use kotoba_core::command::{takes_expression, COMMAND_NAMES};
use kotoba_core::Debugger;
use rustyline::completion::Completer;
use rustyline::highlight::Highlighter;
use rustyline::hint::Hinter;
use rustyline::validate::Validator;
use rustyline::{Context, Helper};
use std::cell::RefCell;
use std::rc::Rc;

/// 行の `pos` にある語の補完（置き換え開始位置と候補）
pub fn complete_line(debugger: &Debugger, line: &str, pos: usize) -> (usize, Vec<String>) {
    let Some(before) = line.get(..pos) else {
        return (pos, Vec::new());
    };
    let start = before.len() - before.trim_start().len();
    let word_end = before[start..]
        .find(char::is_whitespace)
        .map(|i| start + i);

    match word_end {
        // コマンド名を入力中
        None => {
            let prefix = &before[start..];
            let candidates = COMMAND_NAMES
                .iter()
                .filter(|name| name.starts_with(prefix))
                .map(|name| name.to_string())
                .collect();
            (start, candidates)
        }
        Some(end) if takes_expression(&before[start..end]) => {
            let completion = debugger.complete(&line[end..], pos - end);
            (end + completion.start, completion.candidates)
        }
        Some(_) => (pos, Vec::new()),
    }
}

/// rustylineに渡す補完器
pub struct KotobaHelper {
    debugger: Rc<RefCell<Debugger>>,
}

impl KotobaHelper {
    pub fn new(debugger: Rc<RefCell<Debugger>>) -> Self {
        Self { debugger }
    }
}

impl Completer for KotobaHelper {
    type Candidate = String;

    fn complete(
        &self,
        line: &str,
        pos: usize,
        _ctx: &Context<'_>,
    ) -> rustyline::Result<(usize, Vec<String>)> {
        // コマンドの実行中は補完しない
        match self.debugger.try_borrow() {
            Ok(debugger) => Ok(complete_line(&debugger, line, pos)),
            Err(_) => Ok((pos, Vec::new())),
        }
    }
}

impl Hinter for KotobaHelper {
    type Hint = String;
}

impl Highlighter for KotobaHelper {}

impl Validator for KotobaHelper {}

impl Helper for KotobaHelper {}
