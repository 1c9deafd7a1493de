//! ソフトウェアブレークポイント（INT3命令）

use crate::memory::Memory;
use crate::Result;

/// INT3命令のオペコード
pub const INT3_OPCODE: u8 = 0xCC;

/// ソフトウェアブレークポイント
///
/// ヒット回数の管理は [`crate::EventGate`] が行い、ここでは命令の書き換えだけを扱います。
pub struct SoftwareBreakpoint {
    address: u64,
    original_byte: u8,
    enabled: bool,
}

impl SoftwareBreakpoint {
    /// ブレークポイントを作成する
    pub fn new(address: u64) -> Self {
        Self {
            address,
            original_byte: 0,
            enabled: false,
        }
    }

    /// ブレークポイントのアドレスを取得する
    pub fn address(&self) -> u64 {
        self.address
    }

    /// ブレークポイントが有効かどうか
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// 元のバイトを取得する
    pub fn original_byte(&self) -> u8 {
        self.original_byte
    }

    /// 範囲 `[addr, addr + len)` にこのブレークポイントが含まれるか
    pub fn within(&self, addr: u64, len: usize) -> bool {
        self.address >= addr && self.address - addr < len as u64
    }

    /// ブレークポイントを設定する
    ///
    /// 指定されたアドレスの命令を0xCC（INT3）で置き換えます。
    pub fn enable(&mut self, memory: &Memory) -> Result<()> {
        if self.enabled {
            return Ok(());
        }

        self.original_byte = memory.read_u8(self.address)?;
        memory.write_u8(self.address, INT3_OPCODE)?;

        self.enabled = true;
        Ok(())
    }

    /// ブレークポイントを解除する
    ///
    /// INT3命令を元のバイトで置き換えます。
    pub fn disable(&mut self, memory: &Memory) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }

        memory.write_u8(self.address, self.original_byte)?;

        self.enabled = false;
        Ok(())
    }

    /// 読み取ったバイト列からINT3を隠し、元のバイトを見せる
    pub fn mask_read(&self, addr: u64, data: &mut [u8]) {
        if self.enabled && self.within(addr, data.len()) {
            data[(self.address - addr) as usize] = self.original_byte;
        }
    }

    /// ブレークポイントを覆う書き込みの後、元のバイトを更新してINT3を置き直す
    pub fn rearm_after_write(&mut self, memory: &Memory, addr: u64, data: &[u8]) -> Result<()> {
        if !self.enabled || !self.within(addr, data.len()) {
            return Ok(());
        }
        self.original_byte = data[(self.address - addr) as usize];
        memory.write_u8(self.address, INT3_OPCODE)
    }
}
