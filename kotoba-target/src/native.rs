//! ptraceによるネイティブバックエンド（Linux x86-64）
//!
//! ptraceの要求はトレーサとなったスレッドからしか発行できないため、全ての操作を
//! 専用のトレーサスレッドで実行します。呼び出し側はジョブをチャネルで送り、結果を待ちます。
//!
//! トレーサスレッドは実行中のスレッドがある間 `waitpid(WNOHANG)` でポーリングし、
//! 停止イベントを [`EventGate`] に通知します。

use crate::breakpoint::SoftwareBreakpoint;
use crate::memory::{modules_from_mappings, Memory};
use crate::{
    BreakpointRecord, EventGate, GateSignal, ModuleInfo, Register, RegisterSnapshot, RegisterValue,
    RemoteTarget, Result, TargetError, ThreadHandle,
};
use nix::errno::Errno;
use nix::libc;
use nix::sys::ptrace;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{execve, fork, ForkResult, Pid};
use std::collections::{HashMap, HashSet};
use std::ffi::CString;
use std::mem::MaybeUninit;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// 実行中スレッドの停止イベントをポーリングする間隔
const POLL_INTERVAL: Duration = Duration::from_millis(2);

/// `syscall; int3`
const SYSCALL_STUB: [u8; 3] = [0x0f, 0x05, 0xcc];

const SYS_MMAP: u64 = 9;
const SYS_MUNMAP: u64 = 11;
const PROT_READ_WRITE_EXEC: u64 = 0x7;
const MAP_PRIVATE_ANONYMOUS: u64 = 0x22;

type Job = Box<dyn FnOnce(&mut Tracer) + Send>;

fn handle_of(tid: Pid) -> ThreadHandle {
    ThreadHandle::new(tid.as_raw() as u64)
}

fn pid_of(thread: ThreadHandle) -> Pid {
    Pid::from_raw(thread.raw() as i32)
}

/// 起動方法
enum Launch {
    Spawn {
        program: CString,
        args: Vec<CString>,
        env: Vec<CString>,
    },
    Attach(Pid),
}

/// ptraceによるネイティブバックエンド
pub struct NativeTarget {
    pid: Pid,
    jobs: Mutex<Option<Sender<Job>>>,
    gate: Arc<EventGate>,
    alive: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl NativeTarget {
    /// 実行可能ファイルを起動してデバッグ対象プロセスを開始する
    ///
    /// プロセスは最初の命令を1ステップ実行した状態で停止して返ります。
    pub fn spawn<P: AsRef<Path>>(program: P, args: &[String]) -> Result<Self> {
        let program_path = program.as_ref().to_str().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "invalid program path")
        })?;
        let program = CString::new(program_path).map_err(std::io::Error::from)?;

        let mut argv = vec![program.clone()];
        for arg in args {
            argv.push(CString::new(arg.as_str()).map_err(std::io::Error::from)?);
        }

        // 環境変数は親プロセスから継承
        let env = std::env::vars()
            .map(|(key, val)| CString::new(format!("{}={}", key, val)))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(std::io::Error::from)?;

        Self::start(Launch::Spawn {
            program,
            args: argv,
            env,
        })
    }

    /// 既存のプロセスの全スレッドにアタッチする
    pub fn attach(pid: i32) -> Result<Self> {
        Self::start(Launch::Attach(Pid::from_raw(pid)))
    }

    fn start(launch: Launch) -> Result<Self> {
        let gate = Arc::new(EventGate::new());
        let alive = Arc::new(AtomicBool::new(false));
        let (job_tx, job_rx) = mpsc::channel::<Job>();
        let (ready_tx, ready_rx) = mpsc::sync_channel::<Result<Pid>>(1);

        let worker = {
            let gate = Arc::clone(&gate);
            let alive = Arc::clone(&alive);
            std::thread::Builder::new()
                .name("kotoba-tracer".to_string())
                .spawn(move || match Tracer::launch(launch, gate, alive) {
                    Ok(tracer) => {
                        let _ = ready_tx.send(Ok(tracer.pid));
                        tracer.run(job_rx);
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                    }
                })?
        };

        let pid = ready_rx.recv().map_err(|_| TargetError::Detached)??;
        info!(pid = pid.as_raw(), "native target ready");

        Ok(Self {
            pid,
            jobs: Mutex::new(Some(job_tx)),
            gate,
            alive,
            worker: Some(worker),
        })
    }

    /// プロセスIDを取得する
    pub fn pid(&self) -> i32 {
        self.pid.as_raw()
    }

    /// トレース中のスレッド一覧
    pub fn threads(&self) -> Result<Vec<ThreadHandle>> {
        self.call(|tracer| {
            let mut threads: Vec<_> = tracer.threads.keys().copied().map(handle_of).collect();
            threads.sort();
            Ok(threads)
        })
    }

    /// トレーサスレッドでジョブを実行し、結果を待つ
    fn call<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut Tracer) -> Result<R> + Send + 'static,
    {
        let (tx, rx) = mpsc::sync_channel(1);
        let job: Job = Box::new(move |tracer| {
            let _ = tx.send(f(tracer));
        });

        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .ok_or(TargetError::Detached)?
            .send(job)
            .map_err(|_| TargetError::Detached)?;

        rx.recv().map_err(|_| TargetError::Detached)?
    }
}

impl Drop for NativeTarget {
    fn drop(&mut self) {
        // 送信側を閉じるとトレーサスレッドは後始末をして終了する
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl RemoteTarget for NativeTarget {
    fn read_memory(&self, addr: u64, len: usize) -> Result<Vec<u8>> {
        self.call(move |tracer| tracer.read_memory(addr, len))
    }

    fn write_memory(&self, addr: u64, data: &[u8]) -> Result<usize> {
        let data = data.to_vec();
        self.call(move |tracer| tracer.write_memory(addr, &data))
    }

    fn get_register(&self, thread: ThreadHandle, name: &str) -> Result<RegisterValue> {
        let reg = Register::parse(name)?;
        self.call(move |tracer| tracer.get_register(pid_of(thread), reg))
    }

    fn set_register(&self, thread: ThreadHandle, name: &str, value: RegisterValue) -> Result<()> {
        let reg = Register::parse(name)?;
        reg.check(&value)?;
        self.call(move |tracer| tracer.set_register(pid_of(thread), reg, value))
    }

    fn suspend_thread(&self, thread: ThreadHandle) -> Result<()> {
        self.call(move |tracer| tracer.suspend(pid_of(thread)))
    }

    fn resume_thread(&self, thread: ThreadHandle) -> Result<()> {
        self.call(move |tracer| tracer.resume(pid_of(thread)))
    }

    fn add_code_breakpoint(&self, addr: u64) -> Result<BreakpointRecord> {
        self.call(move |tracer| tracer.add_breakpoint(addr))
    }

    fn remove_code_breakpoint(&self, addr: u64) -> Result<()> {
        self.call(move |tracer| tracer.remove_breakpoint(addr))
    }

    fn current_thread(&self) -> Result<ThreadHandle> {
        self.call(|tracer| Ok(handle_of(tracer.current)))
    }

    fn modules(&self) -> Result<Vec<ModuleInfo>> {
        self.call(|tracer| Ok(modules_from_mappings(&tracer.memory.mappings()?)))
    }

    fn allocate(&self, size: usize) -> Result<u64> {
        self.call(move |tracer| tracer.allocate(size))
    }

    fn deallocate(&self, addr: u64) -> Result<()> {
        self.call(move |tracer| tracer.deallocate(addr))
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn gate(&self) -> &EventGate {
        &self.gate
    }

    fn save_registers(&self, thread: ThreadHandle) -> Result<RegisterSnapshot> {
        self.call(move |tracer| tracer.save_registers(pid_of(thread)))
    }

    fn restore_registers(&self, thread: ThreadHandle, snapshot: &RegisterSnapshot) -> Result<()> {
        let snapshot = snapshot.clone();
        self.call(move |tracer| tracer.restore_registers(pid_of(thread), &snapshot))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ThreadState {
    Stopped,
    Running,
}

/// トレーサスレッドが所有する状態
struct Tracer {
    pid: Pid,
    memory: Memory,
    gate: Arc<EventGate>,
    alive: Arc<AtomicBool>,
    threads: HashMap<Pid, ThreadState>,
    /// 送信済みでまだ観測していないSIGSTOP（観測時に握りつぶして再開する）
    pending_stops: HashSet<Pid>,
    breakpoints: HashMap<u64, SoftwareBreakpoint>,
    /// 確保したメモリ（アドレス -> サイズ）
    allocations: HashMap<u64, usize>,
    /// 最後に停止したスレッド
    current: Pid,
    spawned: bool,
}

impl Tracer {
    fn launch(launch: Launch, gate: Arc<EventGate>, alive: Arc<AtomicBool>) -> Result<Self> {
        let (pid, tids, spawned) = match launch {
            Launch::Spawn { program, args, env } => (Self::spawn(&program, &args, &env)?, None, true),
            Launch::Attach(pid) => (pid, Some(Self::attach(pid)?), false),
        };

        let threads = tids
            .unwrap_or_else(|| vec![pid])
            .into_iter()
            .map(|tid| (tid, ThreadState::Stopped))
            .collect();
        alive.store(true, Ordering::SeqCst);

        Ok(Self {
            pid,
            memory: Memory::new(pid),
            gate,
            alive,
            threads,
            pending_stops: HashSet::new(),
            breakpoints: HashMap::new(),
            allocations: HashMap::new(),
            current: pid,
            spawned,
        })
    }

    /// forkしてPTRACE_TRACEMEを設定し、execveで実行する
    fn spawn(program: &CString, args: &[CString], env: &[CString]) -> Result<Pid> {
        // SAFETY: 子プロセスではexecveと_exitしか呼ばない
        match unsafe { fork()? } {
            ForkResult::Parent { child } => {
                match waitpid(child, Some(WaitPidFlag::__WALL))? {
                    WaitStatus::Stopped(_, _) => {}
                    WaitStatus::Exited(_, code) => return Err(TargetError::ProcessExited(code)),
                    status => {
                        return Err(TargetError::UnexpectedStop {
                            thread: handle_of(child),
                            status: format!("{:?}", status),
                        })
                    }
                }
                ptrace::setoptions(
                    child,
                    ptrace::Options::PTRACE_O_TRACECLONE | ptrace::Options::PTRACE_O_EXITKILL,
                )?;

                // メモリマッピングを初期化するために1ステップ実行
                ptrace::step(child, None)?;
                match waitpid(child, Some(WaitPidFlag::__WALL))? {
                    WaitStatus::Stopped(_, _) => {
                        debug!(pid = child.as_raw(), "spawned debuggee");
                        Ok(child)
                    }
                    status => Err(TargetError::UnexpectedStop {
                        thread: handle_of(child),
                        status: format!("{:?}", status),
                    }),
                }
            }
            ForkResult::Child => {
                let _ = ptrace::traceme();
                let _ = execve(program, args, env);
                // SAFETY: execveが失敗した子プロセスを直ちに終了する
                unsafe { libc::_exit(127) }
            }
        }
    }

    /// /proc/pid/task の全スレッドにアタッチする
    fn attach(pid: Pid) -> Result<Vec<Pid>> {
        let mut tids = Vec::new();
        for entry in std::fs::read_dir(format!("/proc/{}/task", pid))? {
            let Some(tid) = entry?.file_name().to_str().and_then(|s| s.parse::<i32>().ok()) else {
                continue;
            };
            let tid = Pid::from_raw(tid);
            ptrace::attach(tid)?;
            loop {
                match waitpid(tid, Some(WaitPidFlag::__WALL))? {
                    WaitStatus::Stopped(_, _) => break,
                    WaitStatus::Exited(_, code) if tid == pid => {
                        return Err(TargetError::ProcessExited(code))
                    }
                    _ => continue,
                }
            }
            ptrace::setoptions(tid, ptrace::Options::PTRACE_O_TRACECLONE)?;
            tids.push(tid);
        }
        debug!(pid = pid.as_raw(), threads = tids.len(), "attached");
        Ok(tids)
    }

    fn run(mut self, jobs: Receiver<Job>) {
        loop {
            let job = if self.has_running() {
                match jobs.recv_timeout(POLL_INTERVAL) {
                    Ok(job) => Some(job),
                    Err(RecvTimeoutError::Timeout) => None,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            } else {
                match jobs.recv() {
                    Ok(job) => Some(job),
                    Err(_) => break,
                }
            };

            if let Some(job) = job {
                job(&mut self);
            }
            self.poll_events();
        }
        self.shutdown();
    }

    fn has_running(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
            && self.threads.values().any(|s| *s == ThreadState::Running)
    }

    /// 実行中のスレッドの停止イベントを回収する
    fn poll_events(&mut self) {
        let running: Vec<Pid> = self
            .threads
            .iter()
            .filter(|(_, state)| **state == ThreadState::Running)
            .map(|(tid, _)| *tid)
            .collect();

        for tid in running {
            match waitpid(tid, Some(WaitPidFlag::WNOHANG | WaitPidFlag::__WALL)) {
                Ok(WaitStatus::StillAlive) => {}
                Ok(status) => self.handle_status(status),
                Err(Errno::ECHILD) => self.handle_exit(tid, -1),
                Err(e) => warn!(tid = tid.as_raw(), error = %e, "waitpid failed"),
            }
        }
    }

    fn handle_status(&mut self, status: WaitStatus) {
        trace!(?status, "wait status");
        match status {
            WaitStatus::Stopped(tid, signal) => self.handle_stop(tid, signal),
            WaitStatus::PtraceEvent(tid, _, event)
                if event == ptrace::Event::PTRACE_EVENT_CLONE as i32 =>
            {
                if let Ok(new) = ptrace::getevent(tid) {
                    let new = Pid::from_raw(new as i32);
                    // 新しいスレッドはSIGSTOPで停止した状態から始まる
                    self.threads.insert(new, ThreadState::Running);
                    self.pending_stops.insert(new);
                    debug!(parent = tid.as_raw(), tid = new.as_raw(), "thread created");
                }
                let _ = ptrace::cont(tid, None);
            }
            WaitStatus::PtraceEvent(tid, _, _) | WaitStatus::PtraceSyscall(tid) => {
                let _ = ptrace::cont(tid, None);
            }
            WaitStatus::Exited(tid, code) => self.handle_exit(tid, code),
            WaitStatus::Signaled(tid, signal, _) => self.handle_exit(tid, 128 + signal as i32),
            WaitStatus::Continued(_) | WaitStatus::StillAlive => {}
        }
    }

    fn handle_stop(&mut self, tid: Pid, signal: Signal) {
        if signal == Signal::SIGSTOP && self.pending_stops.remove(&tid) {
            if self.threads.get(&tid) == Some(&ThreadState::Running) {
                let _ = ptrace::cont(tid, None);
                return;
            }
        }

        self.threads.insert(tid, ThreadState::Stopped);
        self.current = tid;

        if signal == Signal::SIGTRAP {
            match self.handle_breakpoint(tid) {
                Ok(true) => return,
                Ok(false) => {}
                Err(e) => warn!(tid = tid.as_raw(), error = %e, "failed to process SIGTRAP"),
            }
        }

        let reason = format!("thread {} stopped by {}", tid, signal);
        debug!(tid = tid.as_raw(), %signal, "thread stopped");
        self.gate.notify(handle_of(tid), GateSignal::Stopped { reason });
    }

    /// INT3による停止であれば、ripを巻き戻してゲートに通知する
    fn handle_breakpoint(&mut self, tid: Pid) -> Result<bool> {
        let mut regs = ptrace::getregs(tid)?;
        let addr = regs.rip.wrapping_sub(1);
        if !self.breakpoints.get(&addr).is_some_and(|bp| bp.is_enabled()) {
            return Ok(false);
        }

        regs.rip = addr;
        ptrace::setregs(tid, regs)?;

        let hit = self.gate.on_breakpoint(handle_of(tid), addr);
        if !hit.armed || hit.remaining == 0 {
            if let Some(mut bp) = self.breakpoints.remove(&addr) {
                bp.disable(&self.memory)?;
            }
        }
        if !hit.armed {
            let reason = format!("thread {} hit a stale breakpoint at 0x{:x}", tid, addr);
            self.gate.notify(handle_of(tid), GateSignal::Stopped { reason });
        }
        Ok(true)
    }

    fn handle_exit(&mut self, tid: Pid, code: i32) {
        self.threads.remove(&tid);
        self.pending_stops.remove(&tid);

        if tid == self.pid {
            self.alive.store(false, Ordering::SeqCst);
            self.threads.clear();
            self.breakpoints.clear();
            self.allocations.clear();
            self.gate.notify_exit(code);
            info!(pid = tid.as_raw(), code, "debuggee exited");
        } else {
            let reason = format!("thread {} exited", tid);
            self.gate.notify(handle_of(tid), GateSignal::Stopped { reason });
        }
    }

    fn ensure_stopped(&self, tid: Pid) -> Result<()> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(TargetError::ProcessExited(self.gate.exit_status().unwrap_or(-1)));
        }
        match self.threads.get(&tid) {
            Some(ThreadState::Stopped) => Ok(()),
            Some(ThreadState::Running) => Err(TargetError::ThreadRunning(handle_of(tid))),
            None => Err(TargetError::NoSuchThread(handle_of(tid))),
        }
    }

    /// 停止中のスレッドを選ぶ（最後に停止したスレッドを優先）
    fn stopped_thread(&self) -> Result<Pid> {
        if self.ensure_stopped(self.current).is_ok() {
            return Ok(self.current);
        }
        self.threads
            .iter()
            .find(|(_, state)| **state == ThreadState::Stopped)
            .map(|(tid, _)| *tid)
            .ok_or(TargetError::ThreadRunning(handle_of(self.current)))
    }

    fn read_memory(&self, addr: u64, len: usize) -> Result<Vec<u8>> {
        let mut data = self.memory.read(addr, len)?;
        for bp in self.breakpoints.values() {
            bp.mask_read(addr, &mut data);
        }
        Ok(data)
    }

    fn write_memory(&mut self, addr: u64, data: &[u8]) -> Result<usize> {
        let written = self.memory.write(addr, data)?;
        for bp in self.breakpoints.values_mut() {
            bp.rearm_after_write(&self.memory, addr, &data[..written])?;
        }
        trace!(addr = format_args!("0x{:x}", addr), written, "memory written");
        Ok(written)
    }

    fn get_register(&self, tid: Pid, reg: Register) -> Result<RegisterValue> {
        self.ensure_stopped(tid)?;
        match reg {
            Register::Xmm(n) => Ok(RegisterValue::vector(xmm(&read_fpregs(tid)?, n))),
            _ => {
                let mut regs = ptrace::getregs(tid)?;
                let slot = general_slot(&mut regs, reg)
                    .ok_or_else(|| TargetError::UnknownRegister(reg.name().to_string()))?;
                Ok(RegisterValue::general(*slot))
            }
        }
    }

    fn set_register(&self, tid: Pid, reg: Register, value: RegisterValue) -> Result<()> {
        self.ensure_stopped(tid)?;
        match reg {
            Register::Xmm(n) => {
                let mut fpregs = read_fpregs(tid)?;
                set_xmm(&mut fpregs, n, value.bits());
                write_fpregs(tid, &fpregs)
            }
            _ => {
                let mut regs = ptrace::getregs(tid)?;
                let slot = general_slot(&mut regs, reg)
                    .ok_or_else(|| TargetError::UnknownRegister(reg.name().to_string()))?;
                *slot = value.as_u64();
                if reg == Register::Rip {
                    // 中断中のシステムコールが再開されてripが巻き戻されるのを防ぐ
                    regs.orig_rax = u64::MAX;
                }
                ptrace::setregs(tid, regs)?;
                Ok(())
            }
        }
    }

    fn save_registers(&self, tid: Pid) -> Result<RegisterSnapshot> {
        self.ensure_stopped(tid)?;
        let mut regs = ptrace::getregs(tid)?;
        let fpregs = read_fpregs(tid)?;

        let mut values = Vec::new();
        for reg in Register::all() {
            let value = match reg {
                Register::Xmm(n) => RegisterValue::vector(xmm(&fpregs, n)),
                _ => match general_slot(&mut regs, reg) {
                    Some(slot) => RegisterValue::general(*slot),
                    None => continue,
                },
            };
            values.push((reg, value));
        }
        Ok(RegisterSnapshot::new(values).with_syscall(regs.orig_rax))
    }

    fn restore_registers(&self, tid: Pid, snapshot: &RegisterSnapshot) -> Result<()> {
        self.ensure_stopped(tid)?;
        let mut regs = ptrace::getregs(tid)?;
        let mut fpregs = read_fpregs(tid)?;

        for (reg, value) in snapshot.values() {
            match reg {
                Register::Xmm(n) => set_xmm(&mut fpregs, *n, value.bits()),
                _ => {
                    if let Some(slot) = general_slot(&mut regs, *reg) {
                        *slot = value.as_u64();
                    }
                }
            }
        }
        if let Some(syscall) = snapshot.syscall() {
            regs.orig_rax = syscall;
        }

        ptrace::setregs(tid, regs)?;
        write_fpregs(tid, &fpregs)
    }

    /// スレッドを停止する（停止済みなら何もしない）
    fn suspend(&mut self, tid: Pid) -> Result<()> {
        match self.threads.get(&tid) {
            None => return Err(TargetError::NoSuchThread(handle_of(tid))),
            Some(ThreadState::Stopped) => return Ok(()),
            Some(ThreadState::Running) => {}
        }

        // SAFETY: tgkillは引数の整数値のみを使用する
        let ret = unsafe {
            libc::syscall(libc::SYS_tgkill, self.pid.as_raw(), tid.as_raw(), libc::SIGSTOP)
        };
        Errno::result(ret)?;

        loop {
            let status = waitpid(tid, Some(WaitPidFlag::__WALL))?;
            match status {
                WaitStatus::Stopped(_, Signal::SIGSTOP) => {
                    self.pending_stops.remove(&tid);
                    self.threads.insert(tid, ThreadState::Stopped);
                    self.current = tid;
                    debug!(tid = tid.as_raw(), "thread suspended");
                    return Ok(());
                }
                WaitStatus::Stopped(_, signal) => {
                    // 先に別の停止が届いた。送ったSIGSTOPは後で握りつぶす
                    self.pending_stops.insert(tid);
                    self.handle_stop(tid, signal);
                    return Ok(());
                }
                WaitStatus::Exited(..) | WaitStatus::Signaled(..) => {
                    self.handle_status(status);
                    return Err(TargetError::ProcessExited(
                        self.gate.exit_status().unwrap_or(-1),
                    ));
                }
                other => self.handle_status(other),
            }
        }
    }

    /// スレッドを再開する（実行中なら何もしない）
    ///
    /// 再開位置に有効なブレークポイントがある場合は、一時的に解除して1命令だけ実行してから
    /// 置き直します。
    fn resume(&mut self, tid: Pid) -> Result<()> {
        match self.threads.get(&tid) {
            None => return Err(TargetError::NoSuchThread(handle_of(tid))),
            Some(ThreadState::Running) => return Ok(()),
            Some(ThreadState::Stopped) => {}
        }

        let rip = ptrace::getregs(tid)?.rip;
        if self.breakpoints.get(&rip).is_some_and(|bp| bp.is_enabled())
            && !self.step_over_breakpoint(tid, rip)?
        {
            return Ok(());
        }

        ptrace::cont(tid, None)?;
        self.threads.insert(tid, ThreadState::Running);
        trace!(tid = tid.as_raw(), "thread resumed");
        Ok(())
    }

    /// ブレークポイントを一時解除して1命令実行する
    ///
    /// ステップ後もスレッドが通常どおり停止していれば `true` を返します。
    fn step_over_breakpoint(&mut self, tid: Pid, addr: u64) -> Result<bool> {
        if let Some(bp) = self.breakpoints.get_mut(&addr) {
            bp.disable(&self.memory)?;
        }

        let outcome = loop {
            ptrace::step(tid, None)?;
            match waitpid(tid, Some(WaitPidFlag::__WALL))? {
                WaitStatus::Stopped(_, Signal::SIGSTOP) if self.pending_stops.remove(&tid) => continue,
                WaitStatus::Stopped(_, Signal::SIGTRAP) => break None,
                status => break Some(status),
            }
        };

        let exited = matches!(outcome, Some(WaitStatus::Exited(..) | WaitStatus::Signaled(..)));
        if !exited {
            if let Some(bp) = self.breakpoints.get_mut(&addr) {
                bp.enable(&self.memory)?;
            }
        }

        match outcome {
            None => Ok(true),
            Some(status) => {
                self.handle_status(status);
                Ok(false)
            }
        }
    }

    fn add_breakpoint(&mut self, addr: u64) -> Result<BreakpointRecord> {
        let bp = self
            .breakpoints
            .entry(addr)
            .or_insert_with(|| SoftwareBreakpoint::new(addr));
        if let Err(e) = bp.enable(&self.memory) {
            self.breakpoints.remove(&addr);
            return Err(e);
        }
        let record = self.gate.arm_breakpoint(addr);
        debug!(addr = format_args!("0x{:x}", addr), hits = record.hits, "breakpoint armed");
        Ok(record)
    }

    fn remove_breakpoint(&mut self, addr: u64) -> Result<()> {
        self.gate.disarm_breakpoint(addr);
        if let Some(mut bp) = self.breakpoints.remove(&addr) {
            bp.disable(&self.memory)?;
        }
        Ok(())
    }

    fn allocate(&mut self, size: usize) -> Result<u64> {
        let tid = self.stopped_thread()?;
        let args = [0, size as u64, PROT_READ_WRITE_EXEC, MAP_PRIVATE_ANONYMOUS, u64::MAX, 0];
        let addr = self.inject_syscall(tid, SYS_MMAP, args)?;

        // -4095..-1 はエラー番号
        if addr > u64::MAX - 4095 {
            return Err(TargetError::Allocation {
                size,
                reason: format!("mmap failed with errno {}", (addr as i64).unsigned_abs()),
            });
        }
        self.allocations.insert(addr, size);
        debug!(addr = format_args!("0x{:x}", addr), size, "allocated target memory");
        Ok(addr)
    }

    fn deallocate(&mut self, addr: u64) -> Result<()> {
        let size = self
            .allocations
            .remove(&addr)
            .ok_or_else(|| TargetError::MemoryFault {
                addr,
                reason: "not allocated by the debugger".to_string(),
            })?;
        let tid = self.stopped_thread()?;
        let ret = self.inject_syscall(tid, SYS_MUNMAP, [addr, size as u64, 0, 0, 0, 0])?;
        if ret != 0 {
            return Err(TargetError::MemoryFault {
                addr,
                reason: format!("munmap failed with errno {}", (ret as i64).unsigned_abs()),
            });
        }
        debug!(addr = format_args!("0x{:x}", addr), size, "released target memory");
        Ok(())
    }

    /// 停止中のスレッドの現在位置に `syscall; int3` を書き込んで実行する
    ///
    /// 実行後は命令バイトとレジスタを元に戻し、raxの値を返します。
    fn inject_syscall(&mut self, tid: Pid, number: u64, args: [u64; 6]) -> Result<u64> {
        let saved = ptrace::getregs(tid)?;
        let pc = saved.rip;

        let original = self.memory.read(pc, SYSCALL_STUB.len())?;
        if original.len() != SYSCALL_STUB.len() {
            return Err(TargetError::MemoryFault {
                addr: pc,
                reason: "cannot read instruction bytes".to_string(),
            });
        }
        self.memory.write_all(pc, &SYSCALL_STUB)?;

        let mut regs = saved;
        regs.rax = number;
        regs.rdi = args[0];
        regs.rsi = args[1];
        regs.rdx = args[2];
        regs.r10 = args[3];
        regs.r8 = args[4];
        regs.r9 = args[5];
        regs.orig_rax = u64::MAX;

        let result = ptrace::setregs(tid, regs)
            .map_err(TargetError::from)
            .and_then(|_| self.run_stub(tid));

        if self.alive.load(Ordering::SeqCst) {
            self.memory.write_all(pc, &original)?;
            ptrace::setregs(tid, saved)?;
        }
        result
    }

    /// スタブのINT3に到達するまで実行し、raxを返す
    fn run_stub(&mut self, tid: Pid) -> Result<u64> {
        loop {
            ptrace::cont(tid, None)?;
            match waitpid(tid, Some(WaitPidFlag::__WALL))? {
                WaitStatus::Stopped(_, Signal::SIGTRAP) => return Ok(ptrace::getregs(tid)?.rax),
                WaitStatus::Stopped(_, Signal::SIGSTOP) if self.pending_stops.remove(&tid) => continue,
                status @ (WaitStatus::Exited(..) | WaitStatus::Signaled(..)) => {
                    self.handle_status(status);
                    return Err(TargetError::ProcessExited(self.gate.exit_status().unwrap_or(-1)));
                }
                status => {
                    return Err(TargetError::UnexpectedStop {
                        thread: handle_of(tid),
                        status: format!("{:?}", status),
                    })
                }
            }
        }
    }

    /// ブレークポイントを外し、起動したプロセスは終了させ、アタッチしたプロセスからはデタッチする
    fn shutdown(mut self) {
        if !self.alive.load(Ordering::SeqCst) {
            return;
        }

        for (_, mut bp) in self.breakpoints.drain() {
            let _ = bp.disable(&self.memory);
        }

        if self.spawned {
            let _ = signal::kill(self.pid, Signal::SIGKILL);
            let _ = waitpid(self.pid, Some(WaitPidFlag::__WALL));
            debug!(pid = self.pid.as_raw(), "debuggee killed");
        } else {
            let tids: Vec<Pid> = self.threads.keys().copied().collect();
            for tid in tids {
                let _ = self.suspend(tid);
                let _ = ptrace::detach(tid, None);
            }
            debug!(pid = self.pid.as_raw(), "detached");
        }
        self.alive.store(false, Ordering::SeqCst);
    }
}

fn general_slot(regs: &mut libc::user_regs_struct, reg: Register) -> Option<&mut u64> {
    let slot = match reg {
        Register::Rax => &mut regs.rax,
        Register::Rbx => &mut regs.rbx,
        Register::Rcx => &mut regs.rcx,
        Register::Rdx => &mut regs.rdx,
        Register::Rdi => &mut regs.rdi,
        Register::Rsi => &mut regs.rsi,
        Register::Rbp => &mut regs.rbp,
        Register::Rsp => &mut regs.rsp,
        Register::R8 => &mut regs.r8,
        Register::R9 => &mut regs.r9,
        Register::R10 => &mut regs.r10,
        Register::R11 => &mut regs.r11,
        Register::R12 => &mut regs.r12,
        Register::R13 => &mut regs.r13,
        Register::R14 => &mut regs.r14,
        Register::R15 => &mut regs.r15,
        Register::Rip => &mut regs.rip,
        Register::Eflags => &mut regs.eflags,
        Register::Xmm(_) => return None,
    };
    Some(slot)
}

fn read_fpregs(tid: Pid) -> Result<libc::user_fpregs_struct> {
    let mut fpregs = MaybeUninit::<libc::user_fpregs_struct>::uninit();
    // SAFETY: 成功時にはカーネルが構造体全体を書き込む
    let ret = unsafe {
        libc::ptrace(
            libc::PTRACE_GETFPREGS,
            tid.as_raw(),
            std::ptr::null_mut::<libc::c_void>(),
            fpregs.as_mut_ptr(),
        )
    };
    Errno::result(ret)?;
    // SAFETY: PTRACE_GETFPREGSが成功している
    Ok(unsafe { fpregs.assume_init() })
}

fn write_fpregs(tid: Pid, fpregs: &libc::user_fpregs_struct) -> Result<()> {
    // SAFETY: カーネルは構造体を読み取るだけ
    let ret = unsafe {
        libc::ptrace(
            libc::PTRACE_SETFPREGS,
            tid.as_raw(),
            std::ptr::null_mut::<libc::c_void>(),
            fpregs as *const libc::user_fpregs_struct,
        )
    };
    Errno::result(ret)?;
    Ok(())
}

/// xmm_space は xmm0〜xmm15 を32ビット単位で4要素ずつ並べたもの
fn xmm(fpregs: &libc::user_fpregs_struct, n: u8) -> u128 {
    let base = n as usize * 4;
    (0..4).fold(0u128, |bits, i| {
        bits | (fpregs.xmm_space[base + i] as u128) << (32 * i)
    })
}

fn set_xmm(fpregs: &mut libc::user_fpregs_struct, n: u8, bits: u128) {
    let base = n as usize * 4;
    for i in 0..4 {
        fpregs.xmm_space[base + i] = (bits >> (32 * i)) as u32;
    }
}
