//! リモートターゲットの共通インターフェース

use crate::{EventGate, Register, RegisterSnapshot, RegisterValue, Result, TargetError, ThreadHandle};

/// ロード済みモジュールの情報
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleInfo {
    /// モジュール名（パス）
    pub name: String,
    /// ロードベースアドレス
    pub base: u64,
    /// 終端アドレス（このアドレスは含まない）
    pub end: u64,
}

impl ModuleInfo {
    /// アドレスがこのモジュールの範囲内にあるか
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr < self.end
    }
}

/// コードブレークポイントの記録
///
/// 同じアドレスに再設定するとヒットカウンタが増え、ヒットごとに1つ消費されます。
/// カウンタが0になった時点で記録は削除されます。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakpointRecord {
    pub address: u64,
    pub hits: u32,
}

/// デバッグ対象への統一インターフェース
///
/// ネイティブ（ptrace）とデバッガエンジンの2つのバックエンドが実装します。
/// 実装はコントローラスレッドとバックエンドのイベントスレッドの両方から参照されるため、
/// `Send + Sync` である必要があります。
pub trait RemoteTarget: Send + Sync {
    /// メモリを読み取る
    ///
    /// 読み取れた分だけを返します。`len` より短い（空の場合もある）結果は部分読み取りです。
    fn read_memory(&self, addr: u64, len: usize) -> Result<Vec<u8>>;

    /// メモリに書き込み、実際に書き込めたバイト数を返す
    fn write_memory(&self, addr: u64, data: &[u8]) -> Result<usize>;

    /// レジスタの生の値を取得する
    fn get_register(&self, thread: ThreadHandle, name: &str) -> Result<RegisterValue>;

    /// レジスタに値を設定する（値の論理幅はレジスタと一致している必要がある）
    fn set_register(&self, thread: ThreadHandle, name: &str, value: RegisterValue) -> Result<()>;

    /// スレッドを停止する（既に停止している場合は何もしない）
    fn suspend_thread(&self, thread: ThreadHandle) -> Result<()>;

    /// スレッドを再開する
    fn resume_thread(&self, thread: ThreadHandle) -> Result<()>;

    /// コードブレークポイントを設定する
    fn add_code_breakpoint(&self, addr: u64) -> Result<BreakpointRecord>;

    /// コードブレークポイントを削除する（存在しない場合は何もしない）
    fn remove_code_breakpoint(&self, addr: u64) -> Result<()>;

    /// 最後にプロセスを停止させたシグナルを受けたスレッド
    fn current_thread(&self) -> Result<ThreadHandle>;

    /// ロード済みモジュールの一覧
    fn modules(&self) -> Result<Vec<ModuleInfo>>;

    /// ターゲット内に実行可能なメモリを確保する
    fn allocate(&self, size: usize) -> Result<u64>;

    /// [`RemoteTarget::allocate`] で確保したメモリを解放する
    fn deallocate(&self, addr: u64) -> Result<()>;

    /// プロセスが生存しているか
    fn is_alive(&self) -> bool;

    /// ブレークポイント通知を受け取るイベントゲート
    fn gate(&self) -> &EventGate;

    /// 8バイトを読み取る（部分読み取りはエラー）
    fn read_u64(&self, addr: u64) -> Result<u64> {
        let bytes = self.read_memory(addr, 8)?;
        let array: [u8; 8] = bytes.as_slice().try_into().map_err(|_| TargetError::MemoryFault {
            addr,
            reason: format!("short read ({} of 8 bytes)", bytes.len()),
        })?;
        Ok(u64::from_le_bytes(array))
    }

    /// アドレスを含むモジュールを探す
    fn module_containing(&self, addr: u64) -> Result<Option<ModuleInfo>> {
        Ok(self.modules()?.into_iter().find(|m| m.contains(addr)))
    }

    /// スレッドの全レジスタを保存する
    fn save_registers(&self, thread: ThreadHandle) -> Result<RegisterSnapshot> {
        let values = Register::all()
            .map(|reg| Ok((reg, self.get_register(thread, reg.name())?)))
            .collect::<Result<Vec<_>>>()?;
        Ok(RegisterSnapshot::new(values))
    }

    /// [`RemoteTarget::save_registers`] で保存したレジスタを書き戻す
    fn restore_registers(&self, thread: ThreadHandle, snapshot: &RegisterSnapshot) -> Result<()> {
        for (reg, value) in snapshot.values() {
            self.set_register(thread, reg.name(), *value)?;
        }
        Ok(())
    }
}
