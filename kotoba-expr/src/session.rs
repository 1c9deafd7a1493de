//! 1回分のコンパイル
//!
//! 式の先頭にある `#include` 行を取り出し、これまでに蓄積されたインクルードと合わせて
//! 翻訳単位の前置部にします。コンパイラが報告した位置は式テキストの座標に戻します。

use crate::{
    fold_notes, CompileOptions, Compiler, Diagnostic, Expression, FixIt, IrModule, SymbolLookup,
};
use tracing::debug;

/// セッション間で引き継ぐコンパイル状態
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionState {
    /// 蓄積済みのインクルード行（評価に成功した式のものだけ）
    pub includes: Vec<String>,
}

impl SessionState {
    /// インクルードを登録する（重複は無視）
    pub fn commit_includes(&mut self, includes: impl IntoIterator<Item = String>) {
        for include in includes {
            if !self.includes.contains(&include) {
                self.includes.push(include);
            }
        }
    }

    fn prefix(&self, extra: &[String]) -> String {
        self.includes
            .iter()
            .chain(extra)
            .map(|line| format!("{}\n", line))
            .collect()
    }
}

/// [`CompileSession::compile`] の結果
#[derive(Debug, Clone)]
pub struct SessionOutput {
    pub module: Option<IrModule>,
    /// 式テキストの座標に補正し、noteを畳み込んだ診断
    pub diagnostics: Vec<Diagnostic>,
    /// この式で新たに現れたインクルード（評価成功後に呼び出し側が登録する）
    pub new_includes: Vec<String>,
}

impl SessionOutput {
    pub fn has_errors(&self) -> bool {
        self.diagnostics.iter().any(Diagnostic::is_error)
    }
}

/// 式の先頭のインクルード行と、本体の開始オフセットを求める
fn split_includes(text: &str) -> (Vec<String>, usize) {
    let mut includes = Vec::new();
    let mut body_start = 0;
    for line in text.split_inclusive('\n') {
        let trimmed = line.trim();
        if trimmed.starts_with("#include") || trimmed.starts_with("#import") {
            includes.push(trimmed.to_string());
        } else if !trimmed.is_empty() {
            break;
        }
        body_start += line.len();
    }
    (includes, body_start)
}

/// コンパイラ呼び出し1回分
pub struct CompileSession<'a> {
    compiler: &'a dyn Compiler,
}

impl<'a> CompileSession<'a> {
    pub fn new(compiler: &'a dyn Compiler) -> Self {
        Self { compiler }
    }

    pub fn compiler(&self) -> &'a dyn Compiler {
        self.compiler
    }

    /// 式をコンパイルする
    ///
    /// `state` は変更しません。
    pub fn compile(
        &self,
        expr: &Expression,
        state: &SessionState,
        symbols: &dyn SymbolLookup,
        top_level: bool,
    ) -> SessionOutput {
        let (hoisted, body_start) = split_includes(expr.text());
        let new_includes: Vec<String> = hoisted
            .into_iter()
            .filter(|line| !state.includes.contains(line))
            .collect();

        let prefix = state.prefix(&new_includes);
        let body = &expr.text()[body_start..];
        let unit = format!("{}{}", prefix, body);

        let options = CompileOptions {
            language: expr.language(),
            result_type: expr.result_type(),
            top_level,
        };
        debug!(
            "Compiling expression ({} prefix bytes, top_level={}): {}",
            prefix.len(),
            top_level,
            body
        );
        let output = self.compiler.compile(&unit, &options, symbols);

        let remap = |offset: usize| {
            offset
                .checked_sub(prefix.len())
                .map(|in_body| in_body + body_start)
        };
        let diagnostics = output
            .diagnostics
            .into_iter()
            .map(|mut diag| {
                diag.offset = diag.offset.and_then(remap);
                // 前置部を指すfix-itは式テキストに適用できない
                diag.fixits = diag
                    .fixits
                    .into_iter()
                    .filter_map(|f| {
                        Some(FixIt::replace(remap(f.start)?, remap(f.end)?, f.replacement))
                    })
                    .collect();
                diag
            })
            .collect();
        let diagnostics = fold_notes(diagnostics);

        let failed = diagnostics.iter().any(Diagnostic::is_error);
        SessionOutput {
            module: if failed { None } else { output.module },
            diagnostics,
            new_includes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CompileOutput, Language, NoSymbols, ResultType, Severity};
    use std::cell::RefCell;

    /// 受け取ったテキストを記録し、最後の文字の位置にエラーを報告するコンパイラ
    #[derive(Default)]
    struct Recorder {
        seen: RefCell<Vec<String>>,
    }

    impl Compiler for Recorder {
        fn compile(&self, text: &str, _: &CompileOptions, _: &dyn SymbolLookup) -> CompileOutput {
            self.seen.borrow_mut().push(text.to_string());
            let end = text.len();
            CompileOutput {
                module: None,
                diagnostics: vec![
                    Diagnostic::error("expected ';'", end).with_fixit(FixIt::insert(end, ";")),
                    Diagnostic::note("in prefix", 0),
                    Diagnostic::warning("header warning", 0)
                        .with_fixit(FixIt::insert(0, "x")),
                ],
            }
        }
    }

    #[test]
    fn test_split_includes() {
        let (includes, start) = split_includes("#include <stdint.h>\n\n  x + 1");
        assert_eq!(includes, vec!["#include <stdint.h>"]);
        assert_eq!(start, "#include <stdint.h>\n\n".len());

        let (includes, start) = split_includes("x + 1");
        assert!(includes.is_empty());
        assert_eq!(start, 0);
    }

    #[test]
    fn test_prefix_and_offset_remap() {
        let compiler = Recorder::default();
        let session = CompileSession::new(&compiler);
        let mut state = SessionState::default();
        state.commit_includes(["#include <a.h>".to_string()]);

        let text = "#include <b.h>\nint y";
        let expr = Expression::new(text, Language::Cpp, ResultType::Default);
        let out = session.compile(&expr, &state, &NoSymbols, false);

        assert_eq!(
            compiler.seen.borrow()[0],
            "#include <a.h>\n#include <b.h>\nint y"
        );
        assert_eq!(out.new_includes, vec!["#include <b.h>"]);
        // state は変更されない
        assert_eq!(state.includes.len(), 1);

        // 2つ目の診断（note）は前の診断に畳み込まれる
        assert_eq!(out.diagnostics.len(), 2);
        let error = &out.diagnostics[0];
        assert_eq!(error.offset, Some(text.len()));
        assert_eq!(error.fixits, vec![FixIt::insert(text.len(), ";")]);
        assert!(error.message.ends_with("note: in prefix"));

        // 前置部を指す警告は位置を失い、fix-itも持たない
        assert_eq!(out.diagnostics[1].severity, Severity::Warning);
        assert_eq!(out.diagnostics[1].offset, None);
        assert!(out.diagnostics[1].fixits.is_empty());
    }

    #[test]
    fn test_known_includes_are_not_new() {
        let compiler = Recorder::default();
        let session = CompileSession::new(&compiler);
        let mut state = SessionState::default();
        state.commit_includes(["#include <a.h>".to_string()]);

        let expr = Expression::new("#include <a.h>\n1", Language::C, ResultType::Default);
        let out = session.compile(&expr, &state, &NoSymbols, false);
        assert!(out.new_includes.is_empty());
        assert_eq!(compiler.seen.borrow()[0], "#include <a.h>\n1");
    }
}
