//! 逆アセンブル機能
//!
//! 注入するコードを逆アセンブルして、関数の終端（ret命令）を検出します。

use capstone::prelude::*;
use thiserror::Error;

/// 逆アセンブルのエラー
#[derive(Debug, Error)]
#[error("disassembly failed: {0}")]
pub struct DisasmError(String);

/// 逆アセンブルした1命令
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub address: u64,
    pub size: usize,
    pub mnemonic: String,
    pub operands: String,
}

fn capstone() -> Result<Capstone, DisasmError> {
    Capstone::new()
        .x86()
        .mode(arch::x86::ArchMode::Mode64)
        .syntax(arch::x86::ArchSyntax::Intel)
        .build()
        .map_err(|e| DisasmError(format!("failed to create Capstone: {}", e)))
}

/// バイト列を逆アセンブルする
pub fn disassemble(code: &[u8], base_addr: u64) -> Result<Vec<Instruction>, DisasmError> {
    let cs = capstone()?;
    let insns = cs
        .disasm_all(code, base_addr)
        .map_err(|e| DisasmError(e.to_string()))?;

    Ok(insns
        .as_ref()
        .iter()
        .map(|insn| Instruction {
            address: insn.address(),
            size: insn.bytes().len(),
            mnemonic: insn.mnemonic().unwrap_or("").to_string(),
            operands: insn.op_str().unwrap_or("").to_string(),
        })
        .collect())
}

/// 関数内のret命令のアドレスを検出する
///
/// # Arguments
/// * `code` - 関数のバイト列
/// * `base_addr` - 関数の開始アドレス
///
/// # Returns
/// ret命令の絶対アドレスのリスト
pub fn find_ret_instructions(code: &[u8], base_addr: u64) -> Result<Vec<u64>, DisasmError> {
    Ok(disassemble(code, base_addr)?
        .into_iter()
        .filter(|insn| insn.mnemonic == "ret" || insn.mnemonic == "retq")
        .map(|insn| insn.address)
        .collect())
}
