//! fix-itループのテスト

use kotoba_expr::{
    CFamilyCompiler, CompileOptions, CompileOutput, CompileSession, Compiler, Diagnostic,
    Expression, FixIt, FixItError, FixupLoop, FixupStop, Interpreter, Language, NoSymbols,
    ResultType, Scalar, SessionState, SymbolLookup, ValueType, VariableInfo, VariableLocation,
};
use std::cell::Cell;

struct Frame;

impl SymbolLookup for Frame {
    fn lookup(&self, name: &str) -> Option<VariableInfo> {
        (name == "count").then(|| VariableInfo {
            name: "count".to_string(),
            location: VariableLocation::Frame(-12),
            ty: ValueType::Scalar(Scalar::I32),
        })
    }

    fn candidates(&self) -> Vec<String> {
        vec!["count".to_string()]
    }
}

fn cpp(text: &str) -> Expression {
    Expression::new(text, Language::Cpp, ResultType::Default)
}

#[test]
fn test_clean_expression_converges_on_first_attempt() {
    let compiler = CFamilyCompiler;
    let state = SessionState::default();
    let fixups = FixupLoop::new(CompileSession::new(&compiler), &state, &NoSymbols);

    let success = fixups.compile_with_fixups(&cpp("2+3"), 3).unwrap();
    assert_eq!(success.attempts, 1);
    assert!(!success.was_fixed());
    assert_eq!(success.expression.text(), "2+3");
    assert_eq!(Interpreter::can_interpret(&success.module), Ok(()));
    assert_eq!(Interpreter::run(&success.module), Ok(5));
}

#[test]
fn test_missing_paren_converges_within_two_attempts() {
    let compiler = CFamilyCompiler;
    let state = SessionState::default();
    let fixups = FixupLoop::new(CompileSession::new(&compiler), &state, &NoSymbols);

    let success = fixups.compile_with_fixups(&cpp("(1 + 2"), 3).unwrap();
    assert_eq!(success.attempts, 2);
    assert_eq!(success.expression.text(), "(1 + 2)");
    assert_eq!(Interpreter::run(&success.module), Ok(3));
}

#[test]
fn test_typo_is_corrected() {
    let compiler = CFamilyCompiler;
    let state = SessionState::default();
    let fixups = FixupLoop::new(CompileSession::new(&compiler), &state, &Frame);

    let success = fixups.compile_with_fixups(&cpp("cuont * 2"), 3).unwrap();
    assert_eq!(success.expression.text(), "count * 2");
    assert!(Interpreter::can_interpret(&success.module).is_err());
}

#[test]
fn test_error_without_fixit_fails_immediately() {
    let compiler = CFamilyCompiler;
    let state = SessionState::default();
    let fixups = FixupLoop::new(CompileSession::new(&compiler), &state, &NoSymbols);

    let failure = fixups.compile_with_fixups(&cpp("zebra + 1"), 3).unwrap_err();
    assert_eq!(failure.attempts, 1);
    assert_eq!(failure.stop, FixupStop::Unfixable);
    assert_eq!(failure.fixed_text, "zebra + 1");
    assert_eq!(failure.diagnostics[0].offset, Some(0));
    assert!(failure.to_string().contains("use of undeclared identifier 'zebra'"));
}

#[test]
fn test_best_effort_text_is_reported() {
    // 括弧は直せるが、未宣言の識別子は直せない
    let compiler = CFamilyCompiler;
    let state = SessionState::default();
    let fixups = FixupLoop::new(CompileSession::new(&compiler), &state, &NoSymbols);

    let failure = fixups.compile_with_fixups(&cpp("(1 + 2"), 1).unwrap_err();
    assert_eq!(failure.stop, FixupStop::AttemptsExhausted);
    assert_eq!(failure.fixed_text, "(1 + 2");
}

/// 常に同じfix-itを返し続けるコンパイラ
struct Stubborn {
    fixits: Vec<FixIt>,
    calls: Cell<usize>,
}

impl Compiler for Stubborn {
    fn compile(&self, _: &str, _: &CompileOptions, _: &dyn SymbolLookup) -> CompileOutput {
        self.calls.set(self.calls.get() + 1);
        let mut diag = Diagnostic::error("stubborn", 0);
        diag.fixits = self.fixits.clone();
        CompileOutput {
            module: None,
            diagnostics: vec![diag],
        }
    }
}

#[test]
fn test_attempts_are_bounded() {
    let compiler = Stubborn {
        fixits: vec![FixIt::insert(0, " ")],
        calls: Cell::new(0),
    };
    let state = SessionState::default();
    let fixups = FixupLoop::new(CompileSession::new(&compiler), &state, &NoSymbols);

    let failure = fixups.compile_with_fixups(&cpp("x"), 3).unwrap_err();
    assert_eq!(failure.stop, FixupStop::AttemptsExhausted);
    assert_eq!(failure.attempts, 3);
    assert_eq!(compiler.calls.get(), 3);
    assert_eq!(failure.fixed_text, "  x");
}

#[test]
fn test_overlapping_fixits_abort() {
    let compiler = Stubborn {
        fixits: vec![FixIt::replace(0, 3, "a"), FixIt::replace(1, 4, "b")],
        calls: Cell::new(0),
    };
    let state = SessionState::default();
    let fixups = FixupLoop::new(CompileSession::new(&compiler), &state, &NoSymbols);

    let failure = fixups.compile_with_fixups(&cpp("abcdef"), 5).unwrap_err();
    assert!(matches!(
        failure.stop,
        FixupStop::FixIt(FixItError::Overlap { .. })
    ));
    assert_eq!(compiler.calls.get(), 1);
    assert_eq!(failure.fixed_text, "abcdef");
}

#[test]
fn test_top_level_missing_semicolon_is_fixed() {
    let compiler = CFamilyCompiler;
    let state = SessionState::default();
    let fixups = FixupLoop::new(CompileSession::new(&compiler), &state, &NoSymbols).top_level(true);

    let success = fixups.compile_with_fixups(&cpp("int x = 5"), 3).unwrap();
    assert_eq!(success.expression.text(), "int x = 5;");
    assert_eq!(success.module.globals.len(), 1);
    assert_eq!(success.module.entry, None);
}

#[test]
fn test_includes_are_hoisted_and_offsets_remapped() {
    let compiler = CFamilyCompiler;
    let mut state = SessionState::default();
    state.commit_includes(["#include <stddef.h>".to_string()]);
    let fixups = FixupLoop::new(CompileSession::new(&compiler), &state, &NoSymbols);

    let text = "#include <stdint.h>\n(uint8_t)300 + (1";
    let success = fixups.compile_with_fixups(&cpp(text), 3).unwrap();
    assert_eq!(success.attempts, 2);
    assert_eq!(
        success.expression.text(),
        "#include <stdint.h>\n(uint8_t)300 + (1)"
    );
    assert_eq!(success.new_includes, vec!["#include <stdint.h>"]);
    assert_eq!(Interpreter::run(&success.module), Ok(45));

    // ループは蓄積済みの状態を変更しない
    assert_eq!(state.includes, vec!["#include <stddef.h>"]);
}
