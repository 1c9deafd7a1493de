//! スレッド単位の待機・通知ゲート
//!
//! コントローラスレッドは [`EventGate::push_waiter`] で待機を登録してからスレッドを再開し、
//! [`Waiter::wait`] でブレークポイント到達を待ちます。バックエンドのイベントスレッドは
//! [`EventGate::on_breakpoint`] を呼び出し、そのスレッドの最も新しい待機者だけを解放します。
//!
//! 待機者のスタックとブレークポイントのヒットカウンタは同じロックで保護されます。
//! 各待機者は1スロットのチャネルで、解放の合図はちょうど1回だけ届きます。

use crate::{BreakpointRecord, ThreadHandle};
use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, trace};

/// 待機者に届く合図
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateSignal {
    /// ブレークポイントに到達した
    Breakpoint { address: u64 },
    /// ブレークポイント以外の理由でスレッドが停止した
    Stopped { reason: String },
    /// プロセスが終了した
    Exited(i32),
}

/// 待機のエラー
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitError {
    /// 指定時間内に合図が届かなかった
    Timeout(Duration),
    /// ゲートが破棄された
    Abandoned,
}

/// ブレークポイント到達の処理結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakpointHit {
    /// 記録されたブレークポイントだったか
    pub armed: bool,
    /// 消費後の残りヒット数
    pub remaining: u32,
    /// 待機者を解放したか
    pub released: bool,
}

struct Slot {
    id: u64,
    sender: SyncSender<GateSignal>,
}

#[derive(Default)]
struct GateState {
    /// スレッド -> 待機者のスタック（末尾が最新）
    waiters: HashMap<ThreadHandle, Vec<Slot>>,
    /// アドレス -> 残りヒット数
    breakpoints: HashMap<u64, u32>,
    exit_status: Option<i32>,
    next_id: u64,
}

impl GateState {
    /// スレッドの最新の待機者を取り出して合図を送る
    fn release_top(&mut self, thread: ThreadHandle, signal: GateSignal) -> bool {
        let Some(stack) = self.waiters.get_mut(&thread) else {
            return false;
        };
        let slot = stack.pop();
        if stack.is_empty() {
            self.waiters.remove(&thread);
        }
        match slot {
            Some(slot) => slot.sender.try_send(signal).is_ok(),
            None => false,
        }
    }
}

/// スレッド単位の待機・通知ゲート
#[derive(Default)]
pub struct EventGate {
    state: Mutex<GateState>,
}

impl EventGate {
    /// 新しいゲートを作成する
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// スレッドの待機者を登録する
    ///
    /// スレッドを再開する前に呼び出す必要があります。プロセスが既に終了している場合、
    /// 待機者には直ちに [`GateSignal::Exited`] が届きます。
    pub fn push_waiter(&self, thread: ThreadHandle) -> Waiter<'_> {
        let (sender, receiver) = mpsc::sync_channel(1);
        let mut state = self.lock();
        let id = state.next_id;
        state.next_id += 1;

        if let Some(code) = state.exit_status {
            let _ = sender.try_send(GateSignal::Exited(code));
        } else {
            state.waiters.entry(thread).or_default().push(Slot { id, sender });
        }
        trace!(thread = %thread, id, "waiter pushed");

        Waiter {
            gate: self,
            thread,
            id,
            receiver,
        }
    }

    /// スレッドの最新の待機者に合図を送る
    ///
    /// 待機者を解放した場合は `true` を返します。
    pub fn notify(&self, thread: ThreadHandle, signal: GateSignal) -> bool {
        let released = self.lock().release_top(thread, signal);
        debug!(thread = %thread, released, "gate notified");
        released
    }

    /// ブレークポイントを記録する（既存の場合はヒットカウンタを増やす）
    pub fn arm_breakpoint(&self, address: u64) -> BreakpointRecord {
        let mut state = self.lock();
        let hits = state.breakpoints.entry(address).or_insert(0);
        *hits = hits.saturating_add(1);
        BreakpointRecord {
            address,
            hits: *hits,
        }
    }

    /// ブレークポイントの記録を削除する
    pub fn disarm_breakpoint(&self, address: u64) -> Option<BreakpointRecord> {
        self.lock()
            .breakpoints
            .remove(&address)
            .map(|hits| BreakpointRecord { address, hits })
    }

    /// ブレークポイントの残りヒット数
    pub fn breakpoint_hits(&self, address: u64) -> Option<u32> {
        self.lock().breakpoints.get(&address).copied()
    }

    /// ブレークポイント到達を処理する
    ///
    /// バックエンドのイベントスレッドから呼び出されます。記録されたブレークポイントであれば
    /// ヒットを1つ消費し（0になれば記録を削除）、スレッドの最新の待機者を解放します。
    pub fn on_breakpoint(&self, thread: ThreadHandle, address: u64) -> BreakpointHit {
        let mut state = self.lock();
        let remaining = match state.breakpoints.get_mut(&address) {
            Some(hits) if *hits > 0 => {
                *hits -= 1;
                *hits
            }
            _ => {
                return BreakpointHit {
                    armed: false,
                    remaining: 0,
                    released: false,
                }
            }
        };
        if remaining == 0 {
            state.breakpoints.remove(&address);
        }
        let released = state.release_top(thread, GateSignal::Breakpoint { address });
        debug!(thread = %thread, address = format_args!("0x{:x}", address), remaining, released, "breakpoint hit");

        BreakpointHit {
            armed: true,
            remaining,
            released,
        }
    }

    /// プロセス終了を通知し、全スレッドの待機者を解放する
    pub fn notify_exit(&self, code: i32) {
        let mut state = self.lock();
        state.exit_status = Some(code);
        for (_, stack) in state.waiters.drain() {
            for slot in stack {
                let _ = slot.sender.try_send(GateSignal::Exited(code));
            }
        }
        state.breakpoints.clear();
        debug!(code, "process exit propagated to waiters");
    }

    /// プロセスの終了コード（終了していれば）
    pub fn exit_status(&self) -> Option<i32> {
        self.lock().exit_status
    }

    /// スレッドの待機者の数
    pub fn pending(&self, thread: ThreadHandle) -> usize {
        self.lock().waiters.get(&thread).map_or(0, Vec::len)
    }

    fn remove_slot(&self, thread: ThreadHandle, id: u64) {
        let mut state = self.lock();
        if let Some(stack) = state.waiters.get_mut(&thread) {
            stack.retain(|slot| slot.id != id);
            if stack.is_empty() {
                state.waiters.remove(&thread);
            }
        }
    }
}

/// 登録された待機者
///
/// 破棄時に、まだ解放されていなければゲートから自身を取り除きます。
pub struct Waiter<'a> {
    gate: &'a EventGate,
    thread: ThreadHandle,
    id: u64,
    receiver: Receiver<GateSignal>,
}

impl Waiter<'_> {
    /// 待機対象のスレッド
    pub fn thread(&self) -> ThreadHandle {
        self.thread
    }

    /// 合図が届くまで最大 `timeout` だけ待つ
    pub fn wait(&self, timeout: Duration) -> Result<GateSignal, WaitError> {
        match self.receiver.recv_timeout(timeout) {
            Ok(signal) => Ok(signal),
            Err(RecvTimeoutError::Timeout) => Err(WaitError::Timeout(timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(WaitError::Abandoned),
        }
    }

    /// 既に届いている合図を取り出す（待たない）
    pub fn try_signal(&self) -> Option<GateSignal> {
        self.receiver.try_recv().ok()
    }
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        self.gate.remove_slot(self.thread, self.id);
    }
}
