//! IRインタプリタ
//!
//! ターゲットのメモリやフレームに触れない式だけをデバッガ側で評価します。

use crate::{BinOp, Inst, IrModule, Place, UnOp};
use thiserror::Error;

/// インタプリタの実行エラー
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InterpretError {
    #[error("division by zero")]
    DivisionByZero,

    #[error("arithmetic overflow in division")]
    Overflow,

    #[error("IR stack underflow at instruction {0}")]
    StackUnderflow(usize),

    #[error("instruction {0} needs access to the target")]
    TargetAccess(usize),

    #[error("module has no entry function")]
    NoEntry,

    #[error("jump to invalid instruction {0}")]
    BadJump(usize),
}

pub struct Interpreter;

impl Interpreter {
    /// モジュールをターゲットなしで評価できるか判定する
    ///
    /// 評価できない場合はその理由を返します。
    pub fn can_interpret(module: &IrModule) -> Result<(), String> {
        if module.entry_function().is_none() {
            return Err("the module has no expression function to interpret".to_string());
        }
        if !module.globals.is_empty() {
            return Err("the module defines global variables".to_string());
        }
        for inst in module.instructions() {
            match inst {
                Inst::Load(_) | Inst::Store(_) => {
                    return Err("the expression accesses target memory".to_string())
                }
                Inst::AddressOf(Place::Frame(_)) => {
                    return Err("the expression uses a variable in the current frame".to_string())
                }
                Inst::AddressOf(Place::Global(_)) => {
                    return Err("the expression uses storage allocated in the target".to_string())
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// 式関数を実行して戻り値を返す
    pub fn run(module: &IrModule) -> Result<i64, InterpretError> {
        let (_, function) = module.entry_function().ok_or(InterpretError::NoEntry)?;
        let body = &function.body;
        let mut stack: Vec<i64> = Vec::new();
        let mut pc = 0;

        while pc < body.len() {
            let at = pc;
            let pop = |stack: &mut Vec<i64>| stack.pop().ok_or(InterpretError::StackUnderflow(at));
            pc += 1;
            match body[at] {
                Inst::Push(v) => stack.push(v),
                Inst::AddressOf(Place::Absolute(addr)) => stack.push(addr as i64),
                Inst::AddressOf(_) | Inst::Load(_) | Inst::Store(_) => {
                    return Err(InterpretError::TargetAccess(at))
                }
                Inst::Dup => {
                    let v = *stack.last().ok_or(InterpretError::StackUnderflow(at))?;
                    stack.push(v);
                }
                Inst::Swap => {
                    let b = pop(&mut stack)?;
                    let a = pop(&mut stack)?;
                    stack.push(b);
                    stack.push(a);
                }
                Inst::Pop => {
                    pop(&mut stack)?;
                }
                Inst::Convert(scalar) => {
                    let v = pop(&mut stack)?;
                    stack.push(scalar.convert(v));
                }
                Inst::Unary(op) => {
                    let v = pop(&mut stack)?;
                    stack.push(unary(op, v));
                }
                Inst::Binary(op) => {
                    let rhs = pop(&mut stack)?;
                    let lhs = pop(&mut stack)?;
                    stack.push(binary(op, lhs, rhs)?);
                }
                Inst::JumpIfFalse(target) => {
                    if pop(&mut stack)? == 0 {
                        pc = jump(target, body.len())?;
                    }
                }
                Inst::Jump(target) => pc = jump(target, body.len())?,
                Inst::Return => return pop(&mut stack),
            }
        }
        stack.pop().ok_or(InterpretError::StackUnderflow(body.len()))
    }
}

fn jump(target: usize, len: usize) -> Result<usize, InterpretError> {
    // 末尾（関数の終わり）へのジャンプは許す
    if target > len {
        return Err(InterpretError::BadJump(target));
    }
    Ok(target)
}

fn unary(op: UnOp, v: i64) -> i64 {
    match op {
        UnOp::Neg => v.wrapping_neg(),
        UnOp::Not => !v,
        UnOp::LogicalNot => (v == 0) as i64,
    }
}

/// 64ビット値に二項演算を行う
fn binary(op: BinOp, lhs: i64, rhs: i64) -> Result<i64, InterpretError> {
    let (ul, ur) = (lhs as u64, rhs as u64);
    Ok(match op {
        BinOp::Add => lhs.wrapping_add(rhs),
        BinOp::Sub => lhs.wrapping_sub(rhs),
        BinOp::Mul => lhs.wrapping_mul(rhs),
        BinOp::Div | BinOp::Rem | BinOp::DivU | BinOp::RemU if rhs == 0 => {
            return Err(InterpretError::DivisionByZero)
        }
        BinOp::Div => lhs.checked_div(rhs).ok_or(InterpretError::Overflow)?,
        BinOp::Rem => lhs.checked_rem(rhs).ok_or(InterpretError::Overflow)?,
        BinOp::DivU => (ul / ur) as i64,
        BinOp::RemU => (ul % ur) as i64,
        BinOp::And => lhs & rhs,
        BinOp::Or => lhs | rhs,
        BinOp::Xor => lhs ^ rhs,
        BinOp::Shl => lhs.wrapping_shl((rhs & 63) as u32),
        BinOp::Shr => lhs.wrapping_shr((rhs & 63) as u32),
        BinOp::ShrU => ul.wrapping_shr((rhs & 63) as u32) as i64,
        BinOp::Eq => (lhs == rhs) as i64,
        BinOp::Ne => (lhs != rhs) as i64,
        BinOp::Lt => (lhs < rhs) as i64,
        BinOp::Le => (lhs <= rhs) as i64,
        BinOp::Gt => (lhs > rhs) as i64,
        BinOp::Ge => (lhs >= rhs) as i64,
        BinOp::LtU => (ul < ur) as i64,
        BinOp::LeU => (ul <= ur) as i64,
        BinOp::GtU => (ul > ur) as i64,
        BinOp::GeU => (ul >= ur) as i64,
    })
}
