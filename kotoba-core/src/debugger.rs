//! デバッガのメインロジック
//!
//! 1つのデバッグ対象とシンボル情報を保持し、式評価・レジスタとメモリの操作・
//! ブレークポイントまでの実行を提供します。

use crate::coordinator::{RunCoordinator, RunError, StopOutcome};
use crate::evaluator::{EvalContext, Evaluation, Evaluator};
use crate::{EvalError, EvalOptions, Result};
use kotoba_expr::{Completion, NoSymbols, SymbolLookup};
use kotoba_symbols::{ElfImage, GlobalScope, Symbol, SymbolResolver};
use kotoba_target::{Register, RegisterValue, RegisterWidth, RemoteTarget, ThreadHandle};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

/// `continue` がプロセス終了と他スレッドのヒットを確認する間隔
const CONTINUE_POLL: Duration = Duration::from_millis(200);

/// ブレークポイントID
pub type BreakpointId = usize;

/// ユーザーが設定したブレークポイント
///
/// ターゲットに書き込まれるのは `continue` の実行中だけです。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Breakpoint {
    pub id: BreakpointId,
    pub address: u64,
    /// 設定に使ったシンボル名
    pub symbol: Option<String>,
}

/// デバッガ
pub struct Debugger {
    /// デバッグ対象
    target: Option<Box<dyn RemoteTarget>>,
    image: Option<ElfImage>,
    resolver: Option<SymbolResolver>,
    /// 実行時アドレスで解決されたグローバル変数
    scope: Option<GlobalScope>,
    /// PIEのロードバイアス
    bias: u64,
    evaluator: Evaluator,
    options: EvalOptions,
    breakpoints: Vec<Breakpoint>,
    next_breakpoint_id: BreakpointId,
}

impl Default for Debugger {
    fn default() -> Self {
        Self::new()
    }
}

impl Debugger {
    /// 新しいデバッガを作成する
    pub fn new() -> Self {
        Self {
            target: None,
            image: None,
            resolver: None,
            scope: None,
            bias: 0,
            evaluator: Evaluator::new(),
            options: EvalOptions::default(),
            breakpoints: Vec::new(),
            next_breakpoint_id: 1,
        }
    }

    /// 実行可能ファイルを起動してデバッグを開始する
    ///
    /// プロセスはexecve直後に停止状態で開始されます。
    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    pub fn spawn<P: AsRef<Path>>(&mut self, program: P, args: &[String]) -> Result<()> {
        let target = kotoba_target::NativeTarget::spawn(program, args)?;
        info!("Spawned process {}", target.pid());
        self.set_target(Box::new(target))
    }

    /// 既存のプロセスにアタッチする
    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    pub fn attach(&mut self, pid: i32) -> Result<()> {
        let target = kotoba_target::NativeTarget::attach(pid)?;
        info!("Attached to process {}", pid);
        self.set_target(Box::new(target))
    }

    /// デバッグ対象を設定する（任意のバックエンド）
    pub fn set_target(&mut self, target: Box<dyn RemoteTarget>) -> Result<()> {
        self.target = Some(target);
        self.refresh_scope()
    }

    pub fn is_attached(&self) -> bool {
        self.target.is_some()
    }

    fn require_target(&self) -> Result<&dyn RemoteTarget> {
        self.target.as_deref().ok_or(EvalError::NotAttached)
    }

    /// ELFバイナリからシンボル情報を読み込む
    pub fn load_binary<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let image = ElfImage::load(path)?;
        let resolver = SymbolResolver::new(&image);
        self.image = Some(image);
        self.resolver = Some(resolver);
        self.refresh_scope()
    }

    /// ロードバイアスを求め、グローバル変数の表を作り直す
    ///
    /// PIEでロード先が分からない場合はグローバル変数を参照できません。
    fn refresh_scope(&mut self) -> Result<()> {
        let (Some(image), Some(resolver)) = (&self.image, &self.resolver) else {
            return Ok(());
        };
        let modules = match &self.target {
            Some(target) => target.modules()?,
            None => Vec::new(),
        };
        match image.load_bias(&modules) {
            Some(bias) => {
                debug!("Load bias of {:?}: 0x{:x}", image.path(), bias);
                let scope = GlobalScope::new(resolver, bias);
                debug!("{} global variables are visible to expressions", scope.len());
                self.bias = bias;
                self.scope = Some(scope);
            }
            None => {
                warn!("Could not determine the load address of {:?}", image.path());
                self.scope = None;
            }
        }
        Ok(())
    }

    /// シンボル名から実行時アドレスを解決する
    pub fn resolve_symbol(&self, name: &str) -> Option<u64> {
        let address = self.resolver.as_ref()?.resolve(name)?;
        Some(address + self.bias)
    }

    /// 実行時アドレスからシンボルを解決する
    pub fn reverse_resolve(&self, addr: u64) -> Option<&Symbol> {
        self.resolver
            .as_ref()?
            .reverse_resolve(addr.checked_sub(self.bias)?)
    }

    /// パターンにマッチするシンボルを検索する
    pub fn find_symbols(&self, pattern: &str) -> Vec<&Symbol> {
        self.resolver
            .as_ref()
            .map(|r| r.find_symbols(pattern))
            .unwrap_or_default()
    }

    pub fn options(&self) -> &EvalOptions {
        &self.options
    }

    pub fn options_mut(&mut self) -> &mut EvalOptions {
        &mut self.options
    }

    pub fn evaluator(&self) -> &Evaluator {
        &self.evaluator
    }

    /// 式を評価する
    ///
    /// 現在のスレッドのrbpをフレームベースとして使います。
    pub fn evaluate(&mut self, text: &str, options: &EvalOptions) -> Result<Evaluation> {
        let symbols: &dyn SymbolLookup = match &self.scope {
            Some(scope) => scope,
            None => &NoSymbols,
        };
        let context = EvalContext {
            target: self.target.as_deref(),
            thread: None,
            symbols,
            frame_base: None,
        };
        self.evaluator.evaluate(text, &context, options)
    }

    /// ファイルに書かれた式を評価する
    ///
    /// ファイルの内容全体を1つの式として扱います。
    pub fn evaluate_file<P: AsRef<Path>>(
        &mut self,
        path: P,
        options: &EvalOptions,
    ) -> Result<Evaluation> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| EvalError::Io {
            path: path.display().to_string(),
            source,
        })?;
        debug!("Evaluating {} bytes from {}", text.len(), path.display());
        self.evaluate(&text, options)
    }

    /// 入力途中の式の補完候補
    pub fn complete(&self, text: &str, pos: usize) -> Completion {
        let symbols: &dyn SymbolLookup = match &self.scope {
            Some(scope) => scope,
            None => &NoSymbols,
        };
        self.evaluator.complete(text, pos, symbols, &self.options)
    }

    fn current_thread(&self) -> Result<ThreadHandle> {
        Ok(self.require_target()?.current_thread()?)
    }

    /// レジスタを読み取る
    pub fn read_register(&self, name: &str) -> Result<RegisterValue> {
        let target = self.require_target()?;
        let thread = target.current_thread()?;
        Ok(target.get_register(thread, name)?)
    }

    /// レジスタに書き込む（値の幅はレジスタに合わせる）
    pub fn write_register(&self, name: &str, value: u128) -> Result<()> {
        let target = self.require_target()?;
        let register = Register::parse(name)?;
        let value = match register.width() {
            RegisterWidth::General => {
                let value = u64::try_from(value).map_err(|_| {
                    EvalError::InvalidArgument(format!(
                        "value 0x{:x} does not fit in register '{}'",
                        value, register
                    ))
                })?;
                RegisterValue::general(value)
            }
            RegisterWidth::Vector => RegisterValue::vector(value),
        };
        let thread = target.current_thread()?;
        Ok(target.set_register(thread, register.name(), value)?)
    }

    /// プログラムカウンタを取得する
    pub fn get_pc(&self) -> Result<u64> {
        Ok(self.read_register(Register::Rip.name())?.as_u64())
    }

    /// メモリを読み取る（読み取れた分だけを返す）
    pub fn examine(&self, address: u64, len: usize) -> Result<Vec<u8>> {
        Ok(self.require_target()?.read_memory(address, len)?)
    }

    /// ブレークポイントを設定する
    pub fn set_breakpoint(&mut self, address: u64) -> Result<BreakpointId> {
        self.add_breakpoint(address, None)
    }

    /// シンボル名でブレークポイントを設定する
    pub fn set_breakpoint_by_symbol(&mut self, name: &str) -> Result<BreakpointId> {
        let address = self
            .resolve_symbol(name)
            .ok_or_else(|| EvalError::InvalidArgument(format!("Symbol not found: {}", name)))?;
        self.add_breakpoint(address, Some(name.to_string()))
    }

    fn add_breakpoint(&mut self, address: u64, symbol: Option<String>) -> Result<BreakpointId> {
        self.require_target()?;
        let id = self.next_breakpoint_id;
        self.next_breakpoint_id += 1;
        self.breakpoints.push(Breakpoint {
            id,
            address,
            symbol,
        });
        Ok(id)
    }

    /// ブレークポイントを削除する
    pub fn remove_breakpoint(&mut self, id: BreakpointId) -> bool {
        let before = self.breakpoints.len();
        self.breakpoints.retain(|bp| bp.id != id);
        self.breakpoints.len() != before
    }

    pub fn breakpoints(&self) -> &[Breakpoint] {
        &self.breakpoints
    }

    /// 次のブレークポイントかプロセス終了まで実行を継続する
    ///
    /// ブレークポイントは実行中だけターゲットに設定します。現在のpcにあるものは
    /// 再開直後に再び停止しないよう除外します。
    pub fn continue_execution(&mut self) -> Result<StopOutcome> {
        self.run_with_breakpoints(|coordinator, thread, armed| {
            coordinator.resume_until_stop(thread, armed, CONTINUE_POLL)
        })
    }

    /// 待ち時間の上限を指定して実行を継続する
    pub fn continue_with_timeout(&mut self, timeout: Duration) -> Result<StopOutcome> {
        self.run_with_breakpoints(|coordinator, thread, _| {
            coordinator.resume_and_wait(thread, timeout)
        })
    }

    fn run_with_breakpoints(
        &self,
        run: impl FnOnce(&RunCoordinator<'_>, ThreadHandle, &[u64]) -> std::result::Result<StopOutcome, RunError>,
    ) -> Result<StopOutcome> {
        let thread = self.current_thread()?;
        let pc = self.get_pc()?;
        let target = self.require_target()?;

        let mut armed = Vec::new();
        for bp in self.breakpoints.iter().filter(|bp| bp.address != pc) {
            if armed.contains(&bp.address) {
                continue;
            }
            target.add_code_breakpoint(bp.address)?;
            armed.push(bp.address);
        }
        debug!("Continuing thread {} with {} breakpoints", thread, armed.len());

        let outcome = run(&RunCoordinator::new(target), thread, &armed);
        if !matches!(outcome, Ok(StopOutcome::Exited(_))) {
            for address in &armed {
                target.remove_code_breakpoint(*address)?;
            }
        }
        Ok(outcome?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detached_debugger() {
        let mut debugger = Debugger::new();
        assert!(!debugger.is_attached());
        assert!(matches!(
            debugger.read_register("rax"),
            Err(EvalError::NotAttached)
        ));
        assert!(matches!(
            debugger.set_breakpoint(0x1000),
            Err(EvalError::NotAttached)
        ));

        let options = EvalOptions::default();
        let result = debugger.evaluate("6 * 7", &options).unwrap();
        assert_eq!(result.value.to_string(), "(int) 42");
    }

    #[test]
    fn test_detached_injection_is_not_runnable() {
        let mut debugger = Debugger::new();
        let options = EvalOptions::default().with_policy(crate::ExecutionPolicy::Always);
        let err = debugger.evaluate("1", &options).unwrap_err();
        assert_eq!(err.to_string(), crate::errors::ERR_TARGET_NOT_RUNNABLE);
    }

    #[test]
    fn test_evaluate_file() {
        let path = std::env::temp_dir().join(format!("kotoba-source-{}.c", std::process::id()));
        std::fs::write(&path, "(1 << 4)\n  + 2\n").unwrap();

        let mut debugger = Debugger::new();
        let result = debugger.evaluate_file(&path, &EvalOptions::default());
        std::fs::remove_file(&path).unwrap();
        assert_eq!(result.unwrap().value.to_string(), "(int) 18");

        let err = debugger
            .evaluate_file(&path, &EvalOptions::default())
            .unwrap_err();
        assert!(matches!(err, EvalError::Io { .. }));
        assert!(err.to_string().starts_with("failed to read"));
    }

    #[test]
    fn test_complete_includes_declared_names() {
        let mut debugger = Debugger::new();
        let completion = debugger.complete("1 + siz", 7);
        assert_eq!(completion.start, 4);
        assert_eq!(completion.candidates, ["size_t", "sizeof"]);

        // 接続していないのでトップレベル宣言は実行できず、名前も増えない
        let options = EvalOptions::default().with_policy(crate::ExecutionPolicy::TopLevel);
        assert!(debugger.evaluate("long sizzle = 1;", &options).is_err());
        assert_eq!(debugger.complete("siz", 3).candidates, ["size_t", "sizeof"]);
    }
}
