//! 注入したコードの呼び出しと完了待ち
//!
//! 停止中のスレッドのレジスタを保存し、System V ABIの呼び出しフレームを作って
//! 注入した関数へ制御を移します。戻り先のトランポリンにブレークポイントを置き、
//! イベントゲートでその到達を待ちます。

use kotoba_target::{
    GateSignal, Register, RegisterValue, RemoteTarget, TargetError, ThreadHandle, WaitError,
    ARGUMENT_REGISTERS,
};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// スタックポインタより下でリーフ関数が使ってよい領域
const RED_ZONE: u64 = 128;

/// 呼び出しのエラー（ターゲット操作の失敗）
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Target(#[from] TargetError),

    #[error("the event gate was abandoned while waiting for thread {0}")]
    Abandoned(ThreadHandle),

    #[error("too many call arguments ({0}); at most 6 are passed in registers")]
    TooManyArguments(usize),
}

/// 呼び出し先
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallSite {
    pub entry: u64,
    /// 戻り先（トランポリン）
    pub trampoline: u64,
}

/// 呼び出しの結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallOutcome {
    /// 関数が戻った（raxの値）
    Completed(u64),
    /// 時間内に戻らなかった（スレッドは停止したまま残る）
    Timeout,
    /// プロセスが終了した
    TargetExited(i32),
    /// 関数の実行中にスレッドが別の理由で停止した
    Fault(String),
}

/// スレッドを実行させて停止を待った結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopOutcome {
    Breakpoint(u64),
    Stopped(String),
    Exited(i32),
    Timeout,
}

/// スレッドの実行と停止待ちを調整する
pub struct RunCoordinator<'a> {
    target: &'a dyn RemoteTarget,
}

impl<'a> RunCoordinator<'a> {
    pub fn new(target: &'a dyn RemoteTarget) -> Self {
        Self { target }
    }

    /// 停止中のスレッドで関数を呼び出し、戻るまで待つ
    ///
    /// 完了した場合と、別の理由で停止した場合はレジスタを呼び出し前の状態に戻します。
    /// タイムアウトした場合はスレッドを停止させ、呼び出しの途中のまま残します。
    pub fn call_and_wait(
        &self,
        thread: ThreadHandle,
        call: CallSite,
        args: &[u64],
        timeout: Duration,
    ) -> Result<CallOutcome, RunError> {
        if args.len() > ARGUMENT_REGISTERS.len() {
            return Err(RunError::TooManyArguments(args.len()));
        }
        let target = self.target;

        // 再開より前に待機を登録する
        let waiter = target.gate().push_waiter(thread);
        let saved = target.save_registers(thread)?;

        let result = self
            .setup_frame(thread, call, args)
            .and_then(|_| target.add_code_breakpoint(call.trampoline).map(|_| ()))
            .and_then(|_| target.resume_thread(thread));
        if let Err(e) = result {
            let _ = target.remove_code_breakpoint(call.trampoline);
            if let Err(restore) = target.restore_registers(thread, &saved) {
                warn!("Failed to restore registers of thread {}: {}", thread, restore);
            }
            return Err(e.into());
        }
        debug!(
            "Calling 0x{:x} on thread {} (timeout {:?})",
            call.entry, thread, timeout
        );

        let signal = match waiter.wait(timeout) {
            Ok(signal) => signal,
            Err(WaitError::Timeout(_)) => {
                if let Some(code) = self.suspend(thread)? {
                    info!("Process exited with status {} during the call", code);
                    return Ok(CallOutcome::TargetExited(code));
                }
                // 停止させる直前に到達していた場合
                match waiter.try_signal() {
                    Some(signal) => signal,
                    None => {
                        warn!(
                            "Call to 0x{:x} timed out after {:?}; thread {} left suspended",
                            call.entry, timeout, thread
                        );
                        return Ok(CallOutcome::Timeout);
                    }
                }
            }
            Err(WaitError::Abandoned) => return Err(RunError::Abandoned(thread)),
        };

        let outcome = match signal {
            GateSignal::Exited(code) => {
                info!("Process exited with status {} during the call", code);
                return Ok(CallOutcome::TargetExited(code));
            }
            GateSignal::Breakpoint { address } if address == call.trampoline => {
                let value = target.get_register(thread, Register::Rax.name())?.as_u64();
                debug!("Call returned 0x{:x}", value);
                CallOutcome::Completed(value)
            }
            GateSignal::Breakpoint { address } => {
                CallOutcome::Fault(format!("thread {} hit a breakpoint at 0x{:x}", thread, address))
            }
            GateSignal::Stopped { reason } => CallOutcome::Fault(reason),
        };

        target.remove_code_breakpoint(call.trampoline)?;
        target.restore_registers(thread, &saved)?;
        Ok(outcome)
    }

    /// 呼び出しフレームを作る
    fn setup_frame(
        &self,
        thread: ThreadHandle,
        call: CallSite,
        args: &[u64],
    ) -> Result<(), TargetError> {
        let target = self.target;
        let sp = target.get_register(thread, Register::Rsp.name())?.as_u64();

        // 関数の入口では (rsp + 8) が16バイト境界になる
        let sp = (sp.wrapping_sub(RED_ZONE) & !0xf).wrapping_sub(8);
        let written = target.write_memory(sp, &call.trampoline.to_le_bytes())?;
        if written != 8 {
            return Err(TargetError::MemoryFault {
                addr: sp,
                reason: format!("short write of the return address ({} of 8 bytes)", written),
            });
        }

        for (reg, value) in ARGUMENT_REGISTERS.iter().zip(args) {
            target.set_register(thread, reg.name(), RegisterValue::general(*value))?;
        }
        target.set_register(thread, Register::Rsp.name(), RegisterValue::general(sp))?;
        target.set_register(thread, Register::Rip.name(), RegisterValue::general(call.entry))?;
        Ok(())
    }

    /// スレッドを停止させる
    ///
    /// プロセスが既に終了していた場合は終了コードを返します。
    fn suspend(&self, thread: ThreadHandle) -> Result<Option<i32>, TargetError> {
        match self.target.suspend_thread(thread) {
            Ok(()) => Ok(None),
            Err(TargetError::ProcessExited(code)) => Ok(Some(code)),
            Err(e) => Err(e),
        }
    }

    /// 停止中のスレッドを再開し、次に停止するまで待つ
    pub fn resume_and_wait(
        &self,
        thread: ThreadHandle,
        timeout: Duration,
    ) -> Result<StopOutcome, RunError> {
        let waiter = self.target.gate().push_waiter(thread);
        self.target.resume_thread(thread)?;

        match waiter.wait(timeout) {
            Ok(signal) => Ok(stop_outcome(signal)),
            Err(WaitError::Timeout(_)) => {
                if let Some(code) = self.suspend(thread)? {
                    return Ok(StopOutcome::Exited(code));
                }
                Ok(waiter.try_signal().map_or(StopOutcome::Timeout, stop_outcome))
            }
            Err(WaitError::Abandoned) => Err(RunError::Abandoned(thread)),
        }
    }

    /// 停止中のスレッドを再開し、停止するまで `poll` 間隔で監視しながら待つ
    ///
    /// `watched` のブレークポイントが別のスレッドに消費された場合は、このスレッドを
    /// 停止させてそのアドレスを返します。プロセスの終了も待機の合図とは別に確認します。
    pub fn resume_until_stop(
        &self,
        thread: ThreadHandle,
        watched: &[u64],
        poll: Duration,
    ) -> Result<StopOutcome, RunError> {
        let gate = self.target.gate();
        let armed: Vec<(u64, u32)> = watched
            .iter()
            .filter_map(|&address| gate.breakpoint_hits(address).map(|hits| (address, hits)))
            .collect();

        let waiter = gate.push_waiter(thread);
        self.target.resume_thread(thread)?;

        loop {
            match waiter.wait(poll) {
                Ok(signal) => return Ok(stop_outcome(signal)),
                Err(WaitError::Abandoned) => return Err(RunError::Abandoned(thread)),
                Err(WaitError::Timeout(_)) => {}
            }
            if let Some(code) = gate.exit_status() {
                return Ok(StopOutcome::Exited(code));
            }
            let consumed = armed
                .iter()
                .find(|(address, hits)| gate.breakpoint_hits(*address).unwrap_or(0) < *hits);
            if let Some(&(address, _)) = consumed {
                debug!(
                    "Breakpoint at 0x{:x} was hit by another thread; stopping thread {}",
                    address, thread
                );
                if let Some(code) = self.suspend(thread)? {
                    return Ok(StopOutcome::Exited(code));
                }
                return Ok(waiter
                    .try_signal()
                    .map_or(StopOutcome::Breakpoint(address), stop_outcome));
            }
        }
    }

    /// 停止中のスレッドを指定したアドレスまで実行する
    pub fn run_to(
        &self,
        thread: ThreadHandle,
        address: u64,
        timeout: Duration,
    ) -> Result<StopOutcome, RunError> {
        self.target.add_code_breakpoint(address)?;
        let outcome = self.resume_and_wait(thread, timeout);
        if !matches!(outcome, Ok(StopOutcome::Exited(_))) {
            self.target.remove_code_breakpoint(address)?;
        }
        outcome
    }
}

fn stop_outcome(signal: GateSignal) -> StopOutcome {
    match signal {
        GateSignal::Breakpoint { address } => StopOutcome::Breakpoint(address),
        GateSignal::Stopped { reason } => StopOutcome::Stopped(reason),
        GateSignal::Exited(code) => StopOutcome::Exited(code),
    }
}
