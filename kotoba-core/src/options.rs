//! 式評価の設定

use kotoba_expr::{Language, ResultType};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// 式をどこで実行するかの方針
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionPolicy {
    /// 常にターゲット内で実行する
    Always,
    /// ターゲット内では実行しない（解釈実行のみ）
    Never,
    /// トップレベルコード（グローバル変数の定義）をターゲットに挿入する
    TopLevel,
    /// 解釈実行できなければターゲット内で実行する
    #[default]
    IfNecessary,
}

impl ExecutionPolicy {
    pub fn name(self) -> &'static str {
        match self {
            ExecutionPolicy::Always => "always",
            ExecutionPolicy::Never => "never",
            ExecutionPolicy::TopLevel => "top-level",
            ExecutionPolicy::IfNecessary => "if-necessary",
        }
    }

    /// 解釈実行の可否を調べずにターゲットで実行する方針か
    pub fn skips_interpretation(self) -> bool {
        matches!(self, ExecutionPolicy::Always | ExecutionPolicy::TopLevel)
    }
}

impl fmt::Display for ExecutionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ExecutionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "always" => Ok(ExecutionPolicy::Always),
            "never" => Ok(ExecutionPolicy::Never),
            "top-level" | "toplevel" | "top" => Ok(ExecutionPolicy::TopLevel),
            "if-necessary" | "ifnecessary" | "auto" => Ok(ExecutionPolicy::IfNecessary),
            other => Err(format!(
                "unknown execution policy '{}' (expected always, never, top-level or if-necessary)",
                other
            )),
        }
    }
}

/// 1回の式評価の設定
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvalOptions {
    pub policy: ExecutionPolicy,
    /// ターゲット内で実行する場合の待ち時間の上限
    pub timeout: Duration,
    /// fix-itを適用しながら行うコンパイルの回数の上限
    pub max_fixup_attempts: usize,
    pub language: Language,
    pub result_type: ResultType,
    /// 成功したトップレベル宣言を以降の式から参照できるようにするか
    pub keep_persistent: bool,
}

impl Default for EvalOptions {
    fn default() -> Self {
        Self {
            policy: ExecutionPolicy::IfNecessary,
            timeout: Duration::from_secs(5),
            max_fixup_attempts: 3,
            language: Language::default(),
            result_type: ResultType::Default,
            keep_persistent: true,
        }
    }
}

impl EvalOptions {
    pub fn with_policy(mut self, policy: ExecutionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}
