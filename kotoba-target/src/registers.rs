//! レジスタ名と値の表現
//!
//! x86-64の汎用レジスタ（8バイト）とベクタレジスタ（16バイト、xmm0〜xmm15）を扱います。
//! レジスタ名は大文字小文字を区別せず、`pc`/`sp`/`fp`/`flags` の別名も受け付けます。

use crate::{Result, TargetError};
use std::fmt;

/// レジスタの論理幅
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegisterWidth {
    /// 汎用レジスタ（8バイト）
    General,
    /// ベクタレジスタ（16バイト）
    Vector,
}

impl RegisterWidth {
    /// バイト数を取得する
    pub const fn bytes(self) -> usize {
        match self {
            RegisterWidth::General => 8,
            RegisterWidth::Vector => 16,
        }
    }
}

/// 128ビットのレジスタ値と論理幅
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegisterValue {
    bits: u128,
    width: RegisterWidth,
}

impl RegisterValue {
    /// 汎用レジスタの値を作成する
    pub const fn general(value: u64) -> Self {
        Self {
            bits: value as u128,
            width: RegisterWidth::General,
        }
    }

    /// ベクタレジスタの値を作成する
    pub const fn vector(value: u128) -> Self {
        Self {
            bits: value,
            width: RegisterWidth::Vector,
        }
    }

    /// リトルエンディアンのバイト列から作成する（8バイトまたは16バイト）
    pub fn from_le_bytes(bytes: &[u8]) -> Option<Self> {
        match bytes.len() {
            8 => {
                let array: [u8; 8] = bytes.try_into().ok()?;
                Some(Self::general(u64::from_le_bytes(array)))
            }
            16 => {
                let array: [u8; 16] = bytes.try_into().ok()?;
                Some(Self::vector(u128::from_le_bytes(array)))
            }
            _ => None,
        }
    }

    /// リトルエンディアンのバイト列に変換する（論理幅分）
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.bits.to_le_bytes()[..self.width.bytes()].to_vec()
    }

    /// 128ビットの生の値
    pub const fn bits(&self) -> u128 {
        self.bits
    }

    /// 下位64ビット
    pub const fn as_u64(&self) -> u64 {
        self.bits as u64
    }

    /// 論理幅
    pub const fn width(&self) -> RegisterWidth {
        self.width
    }
}

impl fmt::Debug for RegisterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.width {
            RegisterWidth::General => write!(f, "RegisterValue(0x{:016x})", self.as_u64()),
            RegisterWidth::Vector => write!(f, "RegisterValue(0x{:032x})", self.bits),
        }
    }
}

impl fmt::Display for RegisterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.width {
            RegisterWidth::General => write!(f, "0x{:016x}", self.as_u64()),
            RegisterWidth::Vector => write!(f, "0x{:032x}", self.bits),
        }
    }
}

const XMM_NAMES: [&str; 16] = [
    "xmm0", "xmm1", "xmm2", "xmm3", "xmm4", "xmm5", "xmm6", "xmm7", "xmm8", "xmm9", "xmm10",
    "xmm11", "xmm12", "xmm13", "xmm14", "xmm15",
];

/// x86-64のレジスタ
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Register {
    Rax,
    Rbx,
    Rcx,
    Rdx,
    Rdi,
    Rsi,
    Rbp,
    Rsp,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
    Rip,
    Eflags,
    /// xmm0〜xmm15
    Xmm(u8),
}

/// System V ABIの整数引数レジスタ（順序どおり）
pub const ARGUMENT_REGISTERS: [Register; 6] = [
    Register::Rdi,
    Register::Rsi,
    Register::Rdx,
    Register::Rcx,
    Register::R8,
    Register::R9,
];

impl Register {
    /// 汎用レジスタの一覧
    pub const GENERAL: [Register; 18] = [
        Register::Rax,
        Register::Rbx,
        Register::Rcx,
        Register::Rdx,
        Register::Rdi,
        Register::Rsi,
        Register::Rbp,
        Register::Rsp,
        Register::R8,
        Register::R9,
        Register::R10,
        Register::R11,
        Register::R12,
        Register::R13,
        Register::R14,
        Register::R15,
        Register::Rip,
        Register::Eflags,
    ];

    /// 全レジスタ（汎用 + xmm0〜xmm15）
    pub fn all() -> impl Iterator<Item = Register> {
        Self::GENERAL
            .into_iter()
            .chain((0..XMM_NAMES.len() as u8).map(Register::Xmm))
    }

    /// レジスタ名をパースする
    ///
    /// 大文字小文字は区別しません。未知の名前は [`TargetError::UnknownRegister`] になります。
    pub fn parse(name: &str) -> Result<Self> {
        let lower = name.trim().to_ascii_lowercase();
        let reg = match lower.as_str() {
            "rax" => Register::Rax,
            "rbx" => Register::Rbx,
            "rcx" => Register::Rcx,
            "rdx" => Register::Rdx,
            "rdi" => Register::Rdi,
            "rsi" => Register::Rsi,
            "rbp" | "fp" => Register::Rbp,
            "rsp" | "sp" => Register::Rsp,
            "r8" => Register::R8,
            "r9" => Register::R9,
            "r10" => Register::R10,
            "r11" => Register::R11,
            "r12" => Register::R12,
            "r13" => Register::R13,
            "r14" => Register::R14,
            "r15" => Register::R15,
            "rip" | "pc" => Register::Rip,
            "eflags" | "rflags" | "flags" | "efl" => Register::Eflags,
            other => {
                // ベクタレジスタは名前の接頭辞で判別する
                let index = other
                    .strip_prefix("xmm")
                    .and_then(|n| n.parse::<u8>().ok())
                    .filter(|n| (*n as usize) < XMM_NAMES.len());
                match index {
                    Some(n) if other == XMM_NAMES[n as usize] => Register::Xmm(n),
                    _ => return Err(TargetError::UnknownRegister(name.to_string())),
                }
            }
        };
        Ok(reg)
    }

    /// 正規化されたレジスタ名
    pub fn name(self) -> &'static str {
        match self {
            Register::Rax => "rax",
            Register::Rbx => "rbx",
            Register::Rcx => "rcx",
            Register::Rdx => "rdx",
            Register::Rdi => "rdi",
            Register::Rsi => "rsi",
            Register::Rbp => "rbp",
            Register::Rsp => "rsp",
            Register::R8 => "r8",
            Register::R9 => "r9",
            Register::R10 => "r10",
            Register::R11 => "r11",
            Register::R12 => "r12",
            Register::R13 => "r13",
            Register::R14 => "r14",
            Register::R15 => "r15",
            Register::Rip => "rip",
            Register::Eflags => "eflags",
            Register::Xmm(n) => XMM_NAMES[n as usize % XMM_NAMES.len()],
        }
    }

    /// レジスタの論理幅
    pub fn width(self) -> RegisterWidth {
        match self {
            Register::Xmm(_) => RegisterWidth::Vector,
            _ => RegisterWidth::General,
        }
    }

    /// 値の論理幅がこのレジスタと一致するか確認する
    pub fn check(self, value: &RegisterValue) -> Result<()> {
        if value.width() != self.width() {
            return Err(TargetError::WidthMismatch {
                name: self.name().to_string(),
                expected: self.width().bytes(),
                actual: value.width().bytes(),
            });
        }
        Ok(())
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// スレッドのレジスタ状態の保存値
///
/// 注入した関数呼び出しの前後で、スレッドのレジスタを元に戻すために使用します。
#[derive(Debug, Clone, Default)]
pub struct RegisterSnapshot {
    values: Vec<(Register, RegisterValue)>,
    /// 中断中のシステムコール番号（ネイティブバックエンドのみ）
    syscall: Option<u64>,
}

impl RegisterSnapshot {
    /// レジスタ値の一覧から作成する
    pub fn new(values: Vec<(Register, RegisterValue)>) -> Self {
        Self {
            values,
            syscall: None,
        }
    }

    /// 中断中のシステムコール番号を付加する
    pub fn with_syscall(mut self, syscall: u64) -> Self {
        self.syscall = Some(syscall);
        self
    }

    /// 保存されたレジスタ値
    pub fn values(&self) -> &[(Register, RegisterValue)] {
        &self.values
    }

    /// 指定したレジスタの保存値
    pub fn get(&self, reg: Register) -> Option<RegisterValue> {
        self.values
            .iter()
            .find(|(r, _)| *r == reg)
            .map(|(_, v)| *v)
    }

    /// 中断中のシステムコール番号
    pub fn syscall(&self) -> Option<u64> {
        self.syscall
    }
}
