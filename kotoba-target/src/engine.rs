//! デバッガエンジン経由のバックエンド
//!
//! エンジン本体は [`DebugEngine`] トレイトで抽象化します。レジスタはインデックスで、
//! メモリは仮想アドレスで読み書きし、ブレークポイントはエンジンのブレークポイント
//! オブジェクト、メモリ確保はエンジンコマンド（`.dvalloc` / `.dvfree`）で行います。
//!
//! 出力コールバックとイベントコールバックはこのセッションが所有します。
//! [`EngineTarget`] の破棄時に、インストール前のコールバックへ戻します。

use crate::{
    BreakpointRecord, EventGate, ModuleInfo, Register, RegisterValue, RegisterWidth, RemoteTarget,
    Result, TargetError, ThreadHandle,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::{debug, warn};

/// エンジンが扱うレジスタ値の種類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineValueKind {
    Int64,
    Vector128,
}

/// エンジンが扱うレジスタ値
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineValue {
    pub kind: EngineValueKind,
    pub bits: u128,
}

impl EngineValue {
    pub const fn int64(value: u64) -> Self {
        Self {
            kind: EngineValueKind::Int64,
            bits: value as u128,
        }
    }

    pub const fn vector128(bits: u128) -> Self {
        Self {
            kind: EngineValueKind::Vector128,
            bits,
        }
    }
}

impl From<RegisterValue> for EngineValue {
    fn from(value: RegisterValue) -> Self {
        match value.width() {
            RegisterWidth::General => EngineValue::int64(value.as_u64()),
            RegisterWidth::Vector => EngineValue::vector128(value.bits()),
        }
    }
}

impl From<EngineValue> for RegisterValue {
    fn from(value: EngineValue) -> Self {
        match value.kind {
            EngineValueKind::Int64 => RegisterValue::general(value.bits as u64),
            EngineValueKind::Vector128 => RegisterValue::vector(value.bits),
        }
    }
}

/// イベントコールバックがエンジンに返す実行状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventStatus {
    /// 停止したままにする
    Break,
    /// 実行を継続する
    Go,
    /// エンジンの判断に任せる
    NoChange,
}

/// エンジンの出力コールバック
pub trait OutputCallbacks: Send + Sync {
    fn output(&self, text: &str);
}

/// エンジンのイベントコールバック
///
/// エンジンが所有するスレッドから呼び出されます。
pub trait EventCallbacks: Send + Sync {
    /// コードブレークポイントに到達した
    fn breakpoint(&self, address: u64) -> EventStatus;
    /// プロセスが終了した
    fn exit_process(&self, code: i32) -> EventStatus;
}

/// デバッガエンジンのインターフェース
///
/// レジスタ・メモリ・ブレークポイントは、エンジンが現在選択しているスレッドに対して
/// 操作します。
pub trait DebugEngine: Send + Sync + 'static {
    /// 仮想メモリを読み取る（読み取れた分だけ返す）
    fn read_virtual(&self, addr: u64, len: usize) -> Result<Vec<u8>>;
    /// 仮想メモリに書き込み、書き込めたバイト数を返す
    fn write_virtual(&self, addr: u64, data: &[u8]) -> Result<usize>;

    /// レジスタ名からインデックスを引く
    fn register_index(&self, name: &str) -> Option<u32>;
    fn register_value(&self, index: u32) -> Result<EngineValue>;
    fn set_register_value(&self, index: u32, value: EngineValue) -> Result<()>;

    /// 疑似レジスタ（`$tid` など）の名前からインデックスを引く
    fn pseudo_register_index(&self, name: &str) -> Option<u32>;
    fn pseudo_register_value(&self, index: u32) -> Result<EngineValue>;

    /// 操作対象のスレッドを切り替える
    fn set_current_thread(&self, thread_id: u64) -> Result<()>;

    /// コードブレークポイントを追加し、エンジンのブレークポイントIDを返す
    fn add_breakpoint(&self, addr: u64) -> Result<u32>;
    fn remove_breakpoint(&self, id: u32) -> Result<()>;

    /// エンジンコマンドを実行する（出力は出力コールバックに送られる）
    fn execute(&self, command: &str) -> Result<()>;

    fn modules(&self) -> Result<Vec<ModuleInfo>>;

    fn output_callbacks(&self) -> Option<Arc<dyn OutputCallbacks>>;
    fn set_output_callbacks(&self, callbacks: Option<Arc<dyn OutputCallbacks>>);
    fn set_event_callbacks(&self, callbacks: Option<Arc<dyn EventCallbacks>>);
}

/// エンジン出力の取り込み
///
/// 取り込み中でなければ、インストール前の出力コールバックにそのまま転送します。
struct OutputCapture {
    previous: Option<Arc<dyn OutputCallbacks>>,
    capturing: AtomicBool,
    buffer: Mutex<String>,
}

impl OutputCapture {
    fn new(previous: Option<Arc<dyn OutputCallbacks>>) -> Self {
        Self {
            previous,
            capturing: AtomicBool::new(false),
            buffer: Mutex::new(String::new()),
        }
    }

    fn buffer(&self) -> MutexGuard<'_, String> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn begin(&self) {
        self.buffer().clear();
        self.capturing.store(true, Ordering::SeqCst);
    }

    fn finish(&self) -> String {
        self.capturing.store(false, Ordering::SeqCst);
        std::mem::take(&mut *self.buffer())
    }

    /// 以前の出力コールバックへ書き出す
    fn forward(&self, text: &str) {
        if let Some(previous) = &self.previous {
            previous.output(text);
        }
    }
}

impl OutputCallbacks for OutputCapture {
    fn output(&self, text: &str) {
        if self.capturing.load(Ordering::SeqCst) {
            self.buffer().push_str(text);
        } else {
            self.forward(text);
        }
    }
}

/// エンジンのイベントスレッドからゲートへの橋渡し
struct EngineEvents<E: DebugEngine> {
    engine: Weak<E>,
    gate: Arc<EventGate>,
    /// アドレス -> エンジンのブレークポイントID
    breakpoints: Arc<Mutex<HashMap<u64, u32>>>,
    alive: Arc<AtomicBool>,
}

impl<E: DebugEngine> EventCallbacks for EngineEvents<E> {
    fn breakpoint(&self, address: u64) -> EventStatus {
        let Some(engine) = self.engine.upgrade() else {
            return EventStatus::NoChange;
        };
        let thread = match current_thread_of(engine.as_ref()) {
            Ok(thread) => thread,
            Err(e) => {
                warn!(error = %e, "cannot determine the thread of a breakpoint event");
                return EventStatus::NoChange;
            }
        };

        let hit = self.gate.on_breakpoint(thread, address);
        if !hit.armed {
            return EventStatus::NoChange;
        }
        if hit.remaining == 0 {
            let id = self
                .breakpoints
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&address);
            if let Some(id) = id {
                if let Err(e) = engine.remove_breakpoint(id) {
                    warn!(error = %e, "failed to remove engine breakpoint");
                }
            }
        }
        EventStatus::Break
    }

    fn exit_process(&self, code: i32) -> EventStatus {
        self.alive.store(false, Ordering::SeqCst);
        self.gate.notify_exit(code);
        EventStatus::NoChange
    }
}

fn current_thread_of<E: DebugEngine + ?Sized>(engine: &E) -> Result<ThreadHandle> {
    let index = engine
        .pseudo_register_index("$tid")
        .ok_or_else(|| TargetError::engine("$tid", "pseudo-register is not available"))?;
    Ok(ThreadHandle::new(engine.pseudo_register_value(index)?.bits as u64))
}

/// デバッガエンジン経由のバックエンド
pub struct EngineTarget<E: DebugEngine> {
    engine: Arc<E>,
    gate: Arc<EventGate>,
    capture: Arc<OutputCapture>,
    breakpoints: Arc<Mutex<HashMap<u64, u32>>>,
    alive: Arc<AtomicBool>,
    /// 1コマンドずつ出力を取り込むための排他
    command: Mutex<()>,
}

impl<E: DebugEngine> EngineTarget<E> {
    /// エンジンに出力・イベントコールバックをインストールしてセッションを開始する
    pub fn new(engine: Arc<E>) -> Self {
        let gate = Arc::new(EventGate::new());
        let breakpoints = Arc::new(Mutex::new(HashMap::new()));
        let alive = Arc::new(AtomicBool::new(true));

        let capture = Arc::new(OutputCapture::new(engine.output_callbacks()));
        engine.set_output_callbacks(Some(capture.clone() as Arc<dyn OutputCallbacks>));

        let events = EngineEvents {
            engine: Arc::downgrade(&engine),
            gate: Arc::clone(&gate),
            breakpoints: Arc::clone(&breakpoints),
            alive: Arc::clone(&alive),
        };
        engine.set_event_callbacks(Some(Arc::new(events)));

        Self {
            engine,
            gate,
            capture,
            breakpoints,
            alive,
            command: Mutex::new(()),
        }
    }

    /// エンジンへの参照
    pub fn engine(&self) -> &Arc<E> {
        &self.engine
    }

    /// エンジンの出力先（インストール前の出力コールバック）へメッセージを書く
    pub fn log(&self, message: &str) {
        self.capture.forward(message);
        if !message.ends_with('\n') {
            self.capture.forward("\n");
        }
    }

    /// コマンドを実行し、その出力を取り込んで返す
    pub fn execute_captured(&self, command: &str) -> Result<String> {
        let _guard = self.command.lock().unwrap_or_else(PoisonError::into_inner);
        self.log(&format!("> {}", command));

        self.capture.begin();
        let result = self.engine.execute(command);
        let output = self.capture.finish();
        result?;

        debug!(command, output = output.trim_end(), "engine command");
        Ok(output)
    }

    fn select_thread(&self, thread: ThreadHandle) -> Result<()> {
        if current_thread_of(self.engine.as_ref())? != thread {
            self.engine.set_current_thread(thread.raw())?;
        }
        Ok(())
    }

    /// エンジン上のレジスタ名（`eflags` は `efl`）
    fn engine_name(reg: Register) -> &'static str {
        match reg {
            Register::Eflags => "efl",
            other => other.name(),
        }
    }
}

impl<E: DebugEngine> Drop for EngineTarget<E> {
    fn drop(&mut self) {
        self.engine.set_event_callbacks(None);
        self.engine.set_output_callbacks(self.capture.previous.clone());
    }
}

/// `.dvalloc` の出力の最後のトークンからアドレスを取り出す
///
/// 例: "Allocated 1000 bytes starting at 00000000`00a40000"
fn parse_allocation(output: &str) -> Option<u64> {
    let token = output.split_whitespace().last()?;
    let hex: String = token.chars().filter(|c| *c != '`').collect();
    let hex = hex.trim_start_matches("0x");
    u64::from_str_radix(hex, 16).ok().filter(|addr| *addr != 0)
}

impl<E: DebugEngine> RemoteTarget for EngineTarget<E> {
    fn read_memory(&self, addr: u64, len: usize) -> Result<Vec<u8>> {
        match self.engine.read_virtual(addr, len) {
            Ok(data) => Ok(data),
            Err(e) => {
                debug!(addr = format_args!("0x{:x}", addr), error = %e, "engine read failed");
                Ok(Vec::new())
            }
        }
    }

    fn write_memory(&self, addr: u64, data: &[u8]) -> Result<usize> {
        match self.engine.write_virtual(addr, data) {
            Ok(written) => Ok(written),
            Err(e) => {
                debug!(addr = format_args!("0x{:x}", addr), error = %e, "engine write failed");
                Ok(0)
            }
        }
    }

    fn get_register(&self, thread: ThreadHandle, name: &str) -> Result<RegisterValue> {
        let reg = Register::parse(name)?;
        self.select_thread(thread)?;

        let engine_name = Self::engine_name(reg);
        let value = match self.engine.register_index(engine_name) {
            Some(index) => self.engine.register_value(index)?,
            None => match self.engine.pseudo_register_index(engine_name) {
                Some(index) => self.engine.pseudo_register_value(index)?,
                None => return Err(TargetError::UnknownRegister(name.to_string())),
            },
        };

        let value = RegisterValue::from(value);
        reg.check(&value)?;
        Ok(value)
    }

    fn set_register(&self, thread: ThreadHandle, name: &str, value: RegisterValue) -> Result<()> {
        let reg = Register::parse(name)?;
        reg.check(&value)?;
        self.select_thread(thread)?;

        let index = self
            .engine
            .register_index(Self::engine_name(reg))
            .ok_or_else(|| TargetError::UnknownRegister(name.to_string()))?;
        self.engine.set_register_value(index, value.into())
    }

    fn suspend_thread(&self, _thread: ThreadHandle) -> Result<()> {
        // エンジンはブレーク時に全スレッドを停止している
        Ok(())
    }

    fn resume_thread(&self, thread: ThreadHandle) -> Result<()> {
        if !self.is_alive() {
            return Err(TargetError::ProcessExited(self.gate.exit_status().unwrap_or(-1)));
        }
        self.select_thread(thread)?;
        self.execute_captured("g")?;
        Ok(())
    }

    fn add_code_breakpoint(&self, addr: u64) -> Result<BreakpointRecord> {
        let mut breakpoints = self.breakpoints.lock().unwrap_or_else(PoisonError::into_inner);
        if !breakpoints.contains_key(&addr) {
            let id = self.engine.add_breakpoint(addr)?;
            breakpoints.insert(addr, id);
        }
        let record = self.gate.arm_breakpoint(addr);
        debug!(addr = format_args!("0x{:x}", addr), hits = record.hits, "engine breakpoint armed");
        Ok(record)
    }

    fn remove_code_breakpoint(&self, addr: u64) -> Result<()> {
        self.gate.disarm_breakpoint(addr);
        let id = self
            .breakpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&addr);
        if let Some(id) = id {
            self.engine.remove_breakpoint(id)?;
        }
        Ok(())
    }

    fn current_thread(&self) -> Result<ThreadHandle> {
        current_thread_of(self.engine.as_ref())
    }

    fn modules(&self) -> Result<Vec<ModuleInfo>> {
        self.engine.modules()
    }

    fn allocate(&self, size: usize) -> Result<u64> {
        let output = self.execute_captured(&format!(".dvalloc {:x}", size))?;
        let addr = parse_allocation(&output).ok_or_else(|| TargetError::Allocation {
            size,
            reason: format!("unexpected .dvalloc output: {}", output.trim()),
        })?;
        debug!(addr = format_args!("0x{:x}", addr), size, "allocated target memory");
        Ok(addr)
    }

    fn deallocate(&self, addr: u64) -> Result<()> {
        self.execute_captured(&format!(".dvfree 0x{:x} 0", addr))?;
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn gate(&self) -> &EventGate {
        &self.gate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_allocation_output() {
        assert_eq!(
            parse_allocation("Allocated 1000 bytes starting at 00000000`00a40000\n"),
            Some(0xa40000)
        );
        assert_eq!(parse_allocation("Allocated 10 bytes starting at 0x7ff0000"), Some(0x7ff0000));
        assert_eq!(parse_allocation("Couldn't allocate memory"), None);
        assert_eq!(parse_allocation(""), None);
    }

    #[test]
    fn test_engine_value_conversion() {
        let v = RegisterValue::vector(u128::MAX - 1);
        assert_eq!(RegisterValue::from(EngineValue::from(v)), v);
        let g = RegisterValue::general(42);
        assert_eq!(EngineValue::from(g), EngineValue::int64(42));
    }

    struct Recorder(Mutex<String>);

    impl OutputCallbacks for Recorder {
        fn output(&self, text: &str) {
            self.0.lock().unwrap().push_str(text);
        }
    }

    #[test]
    fn test_capture_forwards_only_outside_capture() {
        let recorder = Arc::new(Recorder(Mutex::new(String::new())));
        let capture = OutputCapture::new(Some(recorder.clone() as Arc<dyn OutputCallbacks>));

        capture.output("before\n");
        capture.begin();
        capture.output("captured");
        assert_eq!(capture.finish(), "captured");
        capture.output("after\n");

        assert_eq!(*recorder.0.lock().unwrap(), "before\nafter\n");
    }
}
