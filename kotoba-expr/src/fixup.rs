//! fix-itによる再コンパイルループ

use crate::{
    CompileSession, Diagnostic, Expression, FixItError, IrModule, SessionState, SymbolLookup,
};
use std::fmt;
use tracing::{debug, info};

/// コンパイルに成功した結果
#[derive(Debug, Clone)]
pub struct FixupSuccess {
    pub module: IrModule,
    /// 実際にコンパイルできた式（fix-it適用後）
    pub expression: Expression,
    /// 最後の試行の診断（警告など）
    pub diagnostics: Vec<Diagnostic>,
    pub attempts: usize,
    pub new_includes: Vec<String>,
}

impl FixupSuccess {
    /// fix-itが適用されたか
    pub fn was_fixed(&self) -> bool {
        self.attempts > 1
    }
}

/// ループを打ち切った理由
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FixupStop {
    /// fix-itを持たないエラーがある
    Unfixable,
    /// 試行回数の上限に達した
    AttemptsExhausted,
    /// fix-itを適用できなかった
    FixIt(FixItError),
}

/// コンパイルに失敗した結果
#[derive(Debug, Clone)]
pub struct FixupFailure {
    /// 最後の試行の診断（そのまま）
    pub diagnostics: Vec<Diagnostic>,
    /// 適用できたところまでのfix-it適用後のテキスト
    pub fixed_text: String,
    pub attempts: usize,
    pub stop: FixupStop,
}

impl fmt::Display for FixupFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "expression failed to compile")?;
        match &self.stop {
            FixupStop::Unfixable => {}
            FixupStop::AttemptsExhausted => {
                write!(f, " after {} attempts", self.attempts)?;
            }
            FixupStop::FixIt(e) => write!(f, " ({})", e)?,
        }
        for diag in self.diagnostics.iter().filter(|d| d.is_error()) {
            write!(f, "\n{}", diag.render(&self.fixed_text))?;
        }
        Ok(())
    }
}

impl std::error::Error for FixupFailure {}

/// 診断のfix-itを適用しながら再コンパイルするループ
///
/// コンパイラの永続状態（[`SessionState`]）は変更しません。
pub struct FixupLoop<'a> {
    session: CompileSession<'a>,
    state: &'a SessionState,
    symbols: &'a dyn SymbolLookup,
    top_level: bool,
}

impl<'a> FixupLoop<'a> {
    pub fn new(session: CompileSession<'a>, state: &'a SessionState, symbols: &'a dyn SymbolLookup) -> Self {
        Self {
            session,
            state,
            symbols,
            top_level: false,
        }
    }

    pub fn top_level(mut self, top_level: bool) -> Self {
        self.top_level = top_level;
        self
    }

    /// 式をコンパイルし、必要ならfix-itを適用して再試行する
    ///
    /// `max_attempts` はコンパイル回数の上限です（0は1とみなします）。
    pub fn compile_with_fixups(
        &self,
        expr: &Expression,
        max_attempts: usize,
    ) -> Result<FixupSuccess, FixupFailure> {
        let max_attempts = max_attempts.max(1);
        let mut current = expr.clone();
        let mut attempts = 0;

        loop {
            attempts += 1;
            let output = self
                .session
                .compile(&current, self.state, self.symbols, self.top_level);
            debug!(
                "Compile attempt {}: {} diagnostics",
                attempts,
                output.diagnostics.len()
            );

            let failed = output.has_errors();
            if let (false, Some(module)) = (failed, output.module) {
                return Ok(FixupSuccess {
                    module,
                    expression: current,
                    diagnostics: output.diagnostics,
                    attempts,
                    new_includes: output.new_includes,
                });
            }

            let diagnostics = output.diagnostics;
            let fail = |stop: FixupStop, text: &Expression, diagnostics: Vec<Diagnostic>| FixupFailure {
                diagnostics,
                fixed_text: text.text().to_string(),
                attempts,
                stop,
            };

            let fixable = diagnostics
                .iter()
                .filter(|d| d.is_error())
                .all(Diagnostic::has_fixits);
            if !failed || !fixable {
                return Err(fail(FixupStop::Unfixable, &current, diagnostics));
            }
            if attempts >= max_attempts {
                return Err(fail(FixupStop::AttemptsExhausted, &current, diagnostics));
            }

            match self
                .session
                .compiler()
                .apply_fix_its(current.text(), &diagnostics)
            {
                Ok(text) => {
                    info!("Applied fix-its: '{}' -> '{}'", current.text(), text);
                    current = current.with_text(text);
                }
                Err(e) => return Err(fail(FixupStop::FixIt(e), &current, diagnostics)),
            }
        }
    }
}
