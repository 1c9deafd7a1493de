//! テスト用のリモートターゲット
//!
//! メモリとレジスタをプロセス内に持ち、再開されたスレッドは [`cpu::Cpu`] で実行します。

#![allow(dead_code)]

pub mod cpu;

use kotoba_target::{
    BreakpointRecord, EventGate, GateSignal, ModuleInfo, Register, RegisterValue, RemoteTarget,
    TargetError, ThreadHandle,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

pub const MAIN_THREAD: ThreadHandle = ThreadHandle::new(100);
pub const STACK_BASE: u64 = 0x7ff0_0000;
pub const STACK_SIZE: usize = 0x1_0000;
/// 初期のrbp（フレームベース）
pub const FRAME_BASE: u64 = STACK_BASE + 0xc000;
const INITIAL_RSP: u64 = STACK_BASE + 0xb000;
const ALLOCATION_BASE: u64 = 0x6000_0000;
const MAX_STEPS: usize = 100_000;

struct Region {
    base: u64,
    bytes: Vec<u8>,
}

/// 疎なメモリ空間
#[derive(Default)]
pub struct Memory {
    regions: Vec<Region>,
}

impl Memory {
    pub fn map(&mut self, base: u64, size: usize) {
        self.regions.push(Region {
            base,
            bytes: vec![0; size],
        });
    }

    pub fn unmap(&mut self, base: u64) -> bool {
        let before = self.regions.len();
        self.regions.retain(|r| r.base != base);
        self.regions.len() != before
    }

    fn region(&self, addr: u64) -> Option<(usize, usize)> {
        self.regions.iter().enumerate().find_map(|(i, r)| {
            let offset = addr.checked_sub(r.base)? as usize;
            (offset < r.bytes.len()).then_some((i, offset))
        })
    }

    /// 読み取れた分だけを返す
    pub fn read(&self, addr: u64, len: usize) -> Vec<u8> {
        match self.region(addr) {
            Some((i, offset)) => {
                let bytes = &self.regions[i].bytes;
                let end = (offset + len).min(bytes.len());
                bytes[offset..end].to_vec()
            }
            None => Vec::new(),
        }
    }

    /// 書き込めたバイト数を返す
    pub fn write(&mut self, addr: u64, data: &[u8]) -> usize {
        match self.region(addr) {
            Some((i, offset)) => {
                let bytes = &mut self.regions[i].bytes;
                let n = data.len().min(bytes.len() - offset);
                bytes[offset..offset + n].copy_from_slice(&data[..n]);
                n
            }
            None => 0,
        }
    }
}

/// 再開されたスレッドの振る舞い
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Behavior {
    /// エミュレータで実行する
    Execute,
    /// 何も起きない（停止の通知が来ない）
    Hang,
    /// プロセスが終了する
    Exit(i32),
    /// 別の理由で停止する
    Crash(String),
    /// 終了の通知が届かないままプロセスが消える
    Vanish(i32),
}

struct State {
    memory: Memory,
    registers: HashMap<ThreadHandle, HashMap<Register, RegisterValue>>,
    running: HashSet<ThreadHandle>,
    behavior: Behavior,
    alive: bool,
    /// 1回の書き込みで書き込めるバイト数の上限
    write_limit: Option<usize>,
    allocations: Vec<(u64, usize)>,
    freed: Vec<u64>,
    next_allocation: u64,
    modules: Vec<ModuleInfo>,
}

pub struct MockTarget {
    state: Mutex<State>,
    gate: EventGate,
    calls: AtomicUsize,
    suspends: AtomicUsize,
}

impl Default for MockTarget {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTarget {
    /// スタックを持つ停止中のスレッドが1つあるターゲット
    pub fn new() -> Self {
        let mut memory = Memory::default();
        memory.map(STACK_BASE, STACK_SIZE);

        let mut registers: HashMap<Register, RegisterValue> = Register::all()
            .map(|reg| {
                let value = match reg {
                    Register::Xmm(_) => RegisterValue::vector(0),
                    _ => RegisterValue::general(0),
                };
                (reg, value)
            })
            .collect();
        registers.insert(Register::Rsp, RegisterValue::general(INITIAL_RSP));
        registers.insert(Register::Rbp, RegisterValue::general(FRAME_BASE));
        registers.insert(Register::Rip, RegisterValue::general(0x40_1000));
        registers.insert(Register::Rax, RegisterValue::general(0x1111));
        registers.insert(Register::Eflags, RegisterValue::general(0x246));

        Self {
            state: Mutex::new(State {
                memory,
                registers: HashMap::from([(MAIN_THREAD, registers)]),
                running: HashSet::new(),
                behavior: Behavior::Execute,
                alive: true,
                write_limit: None,
                allocations: Vec::new(),
                freed: Vec::new(),
                next_allocation: ALLOCATION_BASE,
                modules: Vec::new(),
            }),
            gate: EventGate::new(),
            calls: AtomicUsize::new(0),
            suspends: AtomicUsize::new(0),
        }
    }

    pub fn with_behavior(self, behavior: Behavior) -> Self {
        self.lock().behavior = behavior;
        self
    }

    pub fn with_write_limit(self, limit: usize) -> Self {
        self.lock().write_limit = Some(limit);
        self
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    fn count(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }

    /// トレイトのメソッドが呼ばれた回数
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// 実行中のスレッドを止めた回数
    pub fn suspends(&self) -> usize {
        self.suspends.load(Ordering::SeqCst)
    }

    pub fn is_running(&self, thread: ThreadHandle) -> bool {
        self.lock().running.contains(&thread)
    }

    pub fn poke(&self, addr: u64, data: &[u8]) {
        let written = self.lock().memory.write(addr, data);
        assert_eq!(written, data.len(), "poke outside of mapped memory");
    }

    pub fn peek(&self, addr: u64, len: usize) -> Vec<u8> {
        self.lock().memory.read(addr, len)
    }

    pub fn map(&self, base: u64, size: usize) {
        self.lock().memory.map(base, size);
    }

    pub fn register(&self, thread: ThreadHandle, reg: Register) -> u64 {
        self.lock().registers[&thread][&reg].as_u64()
    }

    /// 解放されていない確保領域
    pub fn live_allocations(&self) -> Vec<u64> {
        let state = self.lock();
        state
            .allocations
            .iter()
            .map(|(base, _)| *base)
            .filter(|base| !state.freed.contains(base))
            .collect()
    }

    pub fn freed(&self) -> Vec<u64> {
        self.lock().freed.clone()
    }

    fn stopped_registers<'a>(
        state: &'a mut State,
        thread: ThreadHandle,
    ) -> Result<&'a mut HashMap<Register, RegisterValue>, TargetError> {
        if state.running.contains(&thread) {
            return Err(TargetError::ThreadRunning(thread));
        }
        state
            .registers
            .get_mut(&thread)
            .ok_or(TargetError::NoSuchThread(thread))
    }
}

impl RemoteTarget for MockTarget {
    fn read_memory(&self, addr: u64, len: usize) -> Result<Vec<u8>, TargetError> {
        self.count();
        Ok(self.lock().memory.read(addr, len))
    }

    fn write_memory(&self, addr: u64, data: &[u8]) -> Result<usize, TargetError> {
        self.count();
        let mut state = self.lock();
        let len = state.write_limit.map_or(data.len(), |limit| limit.min(data.len()));
        Ok(state.memory.write(addr, &data[..len]))
    }

    fn get_register(&self, thread: ThreadHandle, name: &str) -> Result<RegisterValue, TargetError> {
        self.count();
        let reg = Register::parse(name)?;
        let mut state = self.lock();
        let registers = Self::stopped_registers(&mut state, thread)?;
        Ok(registers[&reg])
    }

    fn set_register(
        &self,
        thread: ThreadHandle,
        name: &str,
        value: RegisterValue,
    ) -> Result<(), TargetError> {
        self.count();
        let reg = Register::parse(name)?;
        reg.check(&value)?;
        let mut state = self.lock();
        Self::stopped_registers(&mut state, thread)?.insert(reg, value);
        Ok(())
    }

    fn suspend_thread(&self, thread: ThreadHandle) -> Result<(), TargetError> {
        self.count();
        let mut state = self.lock();
        if let (false, Behavior::Vanish(code)) = (state.alive, &state.behavior) {
            return Err(TargetError::ProcessExited(*code));
        }
        if !state.registers.contains_key(&thread) {
            return Err(TargetError::NoSuchThread(thread));
        }
        if state.running.remove(&thread) {
            self.suspends.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn resume_thread(&self, thread: ThreadHandle) -> Result<(), TargetError> {
        self.count();
        let mut state = self.lock();
        if !state.alive {
            return Err(TargetError::Detached);
        }
        if !state.registers.contains_key(&thread) {
            return Err(TargetError::NoSuchThread(thread));
        }

        match state.behavior.clone() {
            Behavior::Execute => {
                let State {
                    memory, registers, ..
                } = &mut *state;
                let registers = registers
                    .get_mut(&thread)
                    .ok_or(TargetError::NoSuchThread(thread))?;
                let mut cpu = cpu::Cpu::load(registers);
                let gate = &self.gate;
                let halt = cpu.run(memory, |rip| gate.breakpoint_hits(rip).is_some(), MAX_STEPS);
                cpu.store(registers);
                match halt {
                    cpu::Halt::Breakpoint(address) => {
                        self.gate.on_breakpoint(thread, address);
                    }
                    cpu::Halt::Fault(reason) => {
                        self.gate.notify(thread, GateSignal::Stopped { reason });
                    }
                    cpu::Halt::StepLimit => {
                        state.running.insert(thread);
                    }
                }
            }
            Behavior::Hang => {
                state.running.insert(thread);
            }
            Behavior::Exit(code) => {
                state.alive = false;
                self.gate.notify_exit(code);
            }
            Behavior::Crash(reason) => {
                self.gate.notify(thread, GateSignal::Stopped { reason });
            }
            Behavior::Vanish(_) => {
                state.alive = false;
                state.running.insert(thread);
            }
        }
        Ok(())
    }

    fn add_code_breakpoint(&self, addr: u64) -> Result<BreakpointRecord, TargetError> {
        self.count();
        Ok(self.gate.arm_breakpoint(addr))
    }

    fn remove_code_breakpoint(&self, addr: u64) -> Result<(), TargetError> {
        self.count();
        self.gate.disarm_breakpoint(addr);
        Ok(())
    }

    fn current_thread(&self) -> Result<ThreadHandle, TargetError> {
        self.count();
        Ok(MAIN_THREAD)
    }

    fn modules(&self) -> Result<Vec<ModuleInfo>, TargetError> {
        self.count();
        Ok(self.lock().modules.clone())
    }

    fn allocate(&self, size: usize) -> Result<u64, TargetError> {
        self.count();
        let mut state = self.lock();
        let base = state.next_allocation;
        let pages = (size + 0xfff) & !0xfff;
        state.next_allocation += pages as u64 + 0x1000;
        state.memory.map(base, size);
        state.allocations.push((base, size));
        Ok(base)
    }

    fn deallocate(&self, addr: u64) -> Result<(), TargetError> {
        self.count();
        let mut state = self.lock();
        if !state.memory.unmap(addr) {
            return Err(TargetError::MemoryFault {
                addr,
                reason: "not an allocation".to_string(),
            });
        }
        state.freed.push(addr);
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.count();
        self.lock().alive
    }

    fn gate(&self) -> &EventGate {
        self.count();
        &self.gate
    }
}
