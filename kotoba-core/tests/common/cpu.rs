//! テスト用の小さなx86-64エミュレータ
//!
//! 命令のデコードはiced-x86に任せ、式の機械語が使う命令だけを実行します。
//! 未知の命令は停止理由として報告します。

use super::Memory;
use iced_x86::{ConditionCode, Decoder, DecoderOptions, Instruction, Mnemonic, OpKind};
use kotoba_target::{Register, RegisterValue};
use std::collections::HashMap;

/// x86-64命令の最大長
const MAX_INSTRUCTION_LEN: usize = 15;

const GPRS: [Register; 16] = [
    Register::Rax,
    Register::Rcx,
    Register::Rdx,
    Register::Rbx,
    Register::Rsp,
    Register::Rbp,
    Register::Rsi,
    Register::Rdi,
    Register::R8,
    Register::R9,
    Register::R10,
    Register::R11,
    Register::R12,
    Register::R13,
    Register::R14,
    Register::R15,
];

const RAX: usize = 0;
const RDX: usize = 2;
const RSP: usize = 4;

/// 実行を止めた理由
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Halt {
    /// 設定されたブレークポイントの位置に来た
    Breakpoint(u64),
    /// フォールトやint3などで停止した
    Fault(String),
    /// 命令数の上限に達した（実行中のまま）
    StepLimit,
}

#[derive(Debug, Default, Clone, Copy)]
struct Flags {
    zf: bool,
    sf: bool,
    of: bool,
    cf: bool,
}

impl Flags {
    fn logic(result: u64) -> Self {
        Self {
            zf: result == 0,
            sf: (result as i64) < 0,
            of: false,
            cf: false,
        }
    }

    fn sub(lhs: u64, rhs: u64) -> Self {
        let (result, of) = (lhs as i64).overflowing_sub(rhs as i64);
        Self {
            zf: result == 0,
            sf: result < 0,
            of,
            cf: lhs < rhs,
        }
    }
}

pub struct Cpu {
    regs: [u64; 16],
    rip: u64,
    flags: Flags,
}

impl Cpu {
    pub fn load(registers: &HashMap<Register, RegisterValue>) -> Self {
        let get = |reg: Register| registers.get(&reg).map_or(0, |v| v.as_u64());
        let mut regs = [0; 16];
        for (slot, reg) in regs.iter_mut().zip(GPRS) {
            *slot = get(reg);
        }
        Self {
            regs,
            rip: get(Register::Rip),
            flags: Flags::default(),
        }
    }

    pub fn store(&self, registers: &mut HashMap<Register, RegisterValue>) {
        for (value, reg) in self.regs.iter().zip(GPRS) {
            registers.insert(reg, RegisterValue::general(*value));
        }
        registers.insert(Register::Rip, RegisterValue::general(self.rip));
    }

    /// 停止するまで実行する
    pub fn run(
        &mut self,
        memory: &mut Memory,
        is_breakpoint: impl Fn(u64) -> bool,
        max_steps: usize,
    ) -> Halt {
        for _ in 0..max_steps {
            if is_breakpoint(self.rip) {
                return Halt::Breakpoint(self.rip);
            }
            if let Err(reason) = self.step(memory) {
                return Halt::Fault(reason);
            }
        }
        Halt::StepLimit
    }

    fn push(&mut self, memory: &mut Memory, value: u64) -> Result<(), String> {
        self.regs[RSP] = self.regs[RSP].wrapping_sub(8);
        write(memory, self.regs[RSP], &value.to_le_bytes())
    }

    fn pop(&mut self, memory: &Memory) -> Result<u64, String> {
        let value = read_u64(memory, self.regs[RSP])?;
        self.regs[RSP] = self.regs[RSP].wrapping_add(8);
        Ok(value)
    }

    fn register(&self, reg: iced_x86::Register) -> u64 {
        if reg == iced_x86::Register::RIP {
            return self.rip;
        }
        let value = self.regs[reg.full_register().number()];
        value & mask(reg.size())
    }

    /// 32ビットへの書き込みは上位をゼロにし、8/16ビットは下位だけを書き換える
    fn set_register(&mut self, reg: iced_x86::Register, value: u64) {
        let slot = &mut self.regs[reg.full_register().number()];
        *slot = match reg.size() {
            8 => value,
            4 => value & mask(4),
            size => (*slot & !mask(size)) | (value & mask(size)),
        };
    }

    fn effective_address(&self, insn: &Instruction) -> u64 {
        if insn.is_ip_rel_memory_operand() {
            return insn.ip_rel_memory_address();
        }
        let mut addr = insn.memory_displacement64();
        if insn.memory_base() != iced_x86::Register::None {
            addr = addr.wrapping_add(self.register(insn.memory_base()));
        }
        if insn.memory_index() != iced_x86::Register::None {
            let index = self.register(insn.memory_index());
            addr = addr.wrapping_add(index.wrapping_mul(insn.memory_index_scale() as u64));
        }
        addr
    }

    /// オペランドのバイト数
    fn operand_size(&self, insn: &Instruction, operand: u32) -> usize {
        match insn.op_kind(operand) {
            OpKind::Register => insn.op_register(operand).size(),
            OpKind::Memory => insn.memory_size().size(),
            _ => 8,
        }
    }

    /// オペランドの値（ゼロ拡張、即値は符号拡張済み）
    fn read(&self, memory: &Memory, insn: &Instruction, operand: u32) -> Result<u64, String> {
        match insn.op_kind(operand) {
            OpKind::Register => Ok(self.register(insn.op_register(operand))),
            OpKind::Memory => {
                let size = insn.memory_size().size();
                let bytes = read(memory, self.effective_address(insn), size)?;
                let mut buf = [0u8; 8];
                buf[..size].copy_from_slice(&bytes);
                Ok(u64::from_le_bytes(buf))
            }
            _ => Ok(insn.immediate(operand)),
        }
    }

    fn write(
        &mut self,
        memory: &mut Memory,
        insn: &Instruction,
        operand: u32,
        value: u64,
    ) -> Result<(), String> {
        match insn.op_kind(operand) {
            OpKind::Register => {
                self.set_register(insn.op_register(operand), value);
                Ok(())
            }
            OpKind::Memory => {
                let size = insn.memory_size().size();
                write(memory, self.effective_address(insn), &value.to_le_bytes()[..size])
            }
            other => Err(format!("cannot write to operand {:?}", other)),
        }
    }

    fn condition(&self, cc: ConditionCode) -> Result<bool, String> {
        let Flags { zf, sf, of, cf } = self.flags;
        Ok(match cc {
            ConditionCode::e => zf,
            ConditionCode::ne => !zf,
            ConditionCode::l => sf != of,
            ConditionCode::ge => sf == of,
            ConditionCode::le => zf || sf != of,
            ConditionCode::g => !zf && sf == of,
            ConditionCode::b => cf,
            ConditionCode::ae => !cf,
            ConditionCode::be => cf || zf,
            ConditionCode::a => !cf && !zf,
            other => return Err(format!("unsupported condition {:?}", other)),
        })
    }

    fn step(&mut self, memory: &mut Memory) -> Result<(), String> {
        let rip = self.rip;
        let code = memory.read(rip, MAX_INSTRUCTION_LEN);
        if code.is_empty() {
            return Err(format!("segmentation fault at 0x{:x}", rip));
        }
        let insn = Decoder::with_ip(64, &code, rip, DecoderOptions::NONE).decode();
        if insn.is_invalid() {
            return Err(format!(
                "illegal instruction at 0x{:x}: {:02x?}",
                rip,
                &code[..code.len().min(4)]
            ));
        }
        let next = insn.next_ip();
        let size = self.operand_size(&insn, 0);
        let wrap = |value: u64| value & mask(size);

        match insn.mnemonic() {
            Mnemonic::Nop => {}
            Mnemonic::Int3 => return Err(format!("trace/breakpoint trap at 0x{:x}", rip)),
            Mnemonic::Ret => {
                self.rip = self.pop(memory)?;
                return Ok(());
            }
            Mnemonic::Jmp => {
                self.rip = insn.near_branch_target();
                return Ok(());
            }
            Mnemonic::Je | Mnemonic::Jne => {
                self.rip = if self.condition(insn.condition_code())? {
                    insn.near_branch_target()
                } else {
                    next
                };
                return Ok(());
            }
            Mnemonic::Push => {
                let value = self.read(memory, &insn, 0)?;
                self.push(memory, value)?;
            }
            Mnemonic::Pop => {
                let value = self.pop(memory)?;
                self.write(memory, &insn, 0, value)?;
            }
            Mnemonic::Mov | Mnemonic::Movzx => {
                let value = self.read(memory, &insn, 1)?;
                self.write(memory, &insn, 0, value)?;
            }
            Mnemonic::Movsx | Mnemonic::Movsxd => {
                let from = self.operand_size(&insn, 1);
                let value = sign_extend(self.read(memory, &insn, 1)?, from);
                self.write(memory, &insn, 0, value)?;
            }
            Mnemonic::Lea => {
                let addr = self.effective_address(&insn);
                self.write(memory, &insn, 0, addr)?;
            }
            Mnemonic::Test => {
                let value = self.read(memory, &insn, 0)? & self.read(memory, &insn, 1)?;
                self.flags = Flags::logic(value);
            }
            Mnemonic::Cmp => {
                let (lhs, rhs) = (self.read(memory, &insn, 0)?, self.read(memory, &insn, 1)?);
                self.flags = Flags::sub(lhs, rhs);
            }
            Mnemonic::Sete
            | Mnemonic::Setne
            | Mnemonic::Setl
            | Mnemonic::Setge
            | Mnemonic::Setle
            | Mnemonic::Setg
            | Mnemonic::Setb
            | Mnemonic::Setae
            | Mnemonic::Setbe
            | Mnemonic::Seta =>             {
                let set = self.condition(insn.condition_code())? as u64;
                self.write(memory, &insn, 0, set)?;
            }
            Mnemonic::Neg | Mnemonic::Not => {
                let value = self.read(memory, &insn, 0)?;
                let result = if insn.mnemonic() == Mnemonic::Neg {
                    value.wrapping_neg()
                } else {
                    !value
                };
                self.write(memory, &insn, 0, wrap(result))?;
            }
            Mnemonic::Add
            | Mnemonic::Sub
            | Mnemonic::Imul
            | Mnemonic::And
            | Mnemonic::Or
            | Mnemonic::Xor
            | Mnemonic::Shl
            | Mnemonic::Shr
            | Mnemonic::Sar => {
                let lhs = self.read(memory, &insn, 0)?;
                let rhs = self.read(memory, &insn, 1)?;
                let shift = (rhs & 63) as u32;
                let result = match insn.mnemonic() {
                    Mnemonic::Add => lhs.wrapping_add(rhs),
                    Mnemonic::Sub => lhs.wrapping_sub(rhs),
                    Mnemonic::Imul => lhs.wrapping_mul(rhs),
                    Mnemonic::And => lhs & rhs,
                    Mnemonic::Or => lhs | rhs,
                    Mnemonic::Xor => lhs ^ rhs,
                    Mnemonic::Shl => lhs.wrapping_shl(shift),
                    Mnemonic::Shr => lhs.wrapping_shr(shift),
                    _ => (sign_extend(lhs, size) as i64).wrapping_shr(shift) as u64,
                };
                self.write(memory, &insn, 0, wrap(result))?;
            }
            Mnemonic::Cqo => {
                self.regs[RDX] = if (self.regs[RAX] as i64) < 0 { u64::MAX } else { 0 };
            }
            Mnemonic::Idiv => {
                let dividend = (((self.regs[RDX] as u128) << 64) | self.regs[RAX] as u128) as i128;
                let divisor = self.read(memory, &insn, 0)? as i64 as i128;
                if divisor == 0 {
                    return Err(format!("integer divide by zero at 0x{:x}", rip));
                }
                let quotient = dividend / divisor;
                if quotient > i64::MAX as i128 || quotient < i64::MIN as i128 {
                    return Err(format!("integer overflow in division at 0x{:x}", rip));
                }
                self.regs[RAX] = quotient as i64 as u64;
                self.regs[RDX] = (dividend % divisor) as i64 as u64;
            }
            Mnemonic::Div => {
                let dividend = ((self.regs[RDX] as u128) << 64) | self.regs[RAX] as u128;
                let divisor = self.read(memory, &insn, 0)? as u128;
                if divisor == 0 {
                    return Err(format!("integer divide by zero at 0x{:x}", rip));
                }
                let quotient = dividend / divisor;
                if quotient > u64::MAX as u128 {
                    return Err(format!("integer overflow in division at 0x{:x}", rip));
                }
                self.regs[RAX] = quotient as u64;
                self.regs[RDX] = (dividend % divisor) as u64;
            }
            other => {
                return Err(format!("unsupported instruction {:?} at 0x{:x}", other, rip));
            }
        }
        self.rip = next;
        Ok(())
    }
}

fn mask(size: usize) -> u64 {
    if size >= 8 {
        u64::MAX
    } else {
        (1u64 << (size * 8)) - 1
    }
}

fn sign_extend(value: u64, size: usize) -> u64 {
    match size {
        1 => value as u8 as i8 as i64 as u64,
        2 => value as u16 as i16 as i64 as u64,
        4 => value as u32 as i32 as i64 as u64,
        _ => value,
    }
}

fn read(memory: &Memory, addr: u64, len: usize) -> Result<Vec<u8>, String> {
    let bytes = memory.read(addr, len);
    if bytes.len() < len {
        return Err(format!("segmentation fault reading 0x{:x}", addr));
    }
    Ok(bytes)
}

fn read_array<const N: usize>(memory: &Memory, addr: u64) -> Result<[u8; N], String> {
    let bytes = read(memory, addr, N)?;
    bytes
        .try_into()
        .map_err(|_| format!("segmentation fault reading 0x{:x}", addr))
}

fn read_u64(memory: &Memory, addr: u64) -> Result<u64, String> {
    read_array(memory, addr).map(u64::from_le_bytes)
}

fn write(memory: &mut Memory, addr: u64, data: &[u8]) -> Result<(), String> {
    if memory.write(addr, data) < data.len() {
        return Err(format!("segmentation fault writing 0x{:x}", addr));
    }
    Ok(())
}
