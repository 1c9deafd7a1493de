//! IRからx86-64機械語への変換
//!
//! IRの値スタックはハードウェアスタックにそのまま対応させます。各関数は `rdi` で
//! 呼び出し元フレームのベースアドレスを受け取り、関数内では `rbx` に保持します。
//! 戻り値は `rax` に置かれます。
//!
//! イメージの構成:
//!
//! ```text
//! +0            トランポリン (nop; int3)
//! +16 ...       関数（16バイト境界）
//! data_offset   グローバル変数（各8バイト）
//! ```

use iced_x86::code_asm::*;
use iced_x86::{BlockEncoderOptions, Code, IcedError, Instruction, Register};
use kotoba_expr::{BinOp, Inst, IrFunction, IrModule, Place, Scalar, UnOp};
use thiserror::Error;

const BITNESS: u32 = 64;
const FUNCTION_ALIGN: usize = 16;
const DATA_ALIGN: usize = 8;
const GLOBAL_SLOT: usize = 8;
const PADDING: u8 = 0xcc;

/// 変換のエラー
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LowerError {
    #[error("function '{function}' jumps to invalid instruction {target}")]
    BadJump { function: String, target: usize },

    #[error("function '{function}' refers to undefined global {index}")]
    BadGlobal { function: String, index: usize },

    #[error("frame offset {0} does not fit in a 32-bit displacement")]
    FrameOffset(i64),

    #[error("failed to encode machine code: {0}")]
    Encode(String),
}

impl From<IcedError> for LowerError {
    fn from(e: IcedError) -> Self {
        LowerError::Encode(e.to_string())
    }
}

/// イメージ内の関数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoweredFunction {
    pub name: String,
    pub offset: usize,
    pub len: usize,
}

/// グローバル変数のアドレスを埋め込む位置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Relocation {
    /// 64ビット即値のイメージ内オフセット
    at: usize,
    global: usize,
}

/// 配置前の機械語イメージ
#[derive(Debug, Clone)]
pub struct LoweredImage {
    code: Vec<u8>,
    functions: Vec<LoweredFunction>,
    trampoline_len: usize,
    data_offset: usize,
    data_len: usize,
    relocations: Vec<Relocation>,
}

impl LoweredImage {
    /// コードとデータを合わせたサイズ
    pub fn size(&self) -> usize {
        self.data_offset + self.data_len
    }

    pub fn code_len(&self) -> usize {
        self.code.len()
    }

    pub fn functions(&self) -> &[LoweredFunction] {
        &self.functions
    }

    pub fn trampoline_offset(&self) -> usize {
        0
    }

    pub fn trampoline_len(&self) -> usize {
        self.trampoline_len
    }

    /// グローバル変数のイメージ内オフセット
    pub fn global_offset(&self, index: usize) -> usize {
        self.data_offset + index * GLOBAL_SLOT
    }

    /// `base` に配置した場合のイメージを作る（データ領域はゼロ初期化）
    pub fn link(&self, base: u64) -> Vec<u8> {
        let mut image = self.code.clone();
        image.resize(self.size(), 0);
        for reloc in &self.relocations {
            let addr = base.wrapping_add(self.global_offset(reloc.global) as u64);
            image[reloc.at..reloc.at + 8].copy_from_slice(&addr.to_le_bytes());
        }
        image
    }
}

/// モジュールを機械語に変換する
///
/// 関数は1つずつ組み立て、16バイト境界に並べます。分岐は関数内で閉じているので
/// 関数ごとの配置に依存しません。
pub fn lower(module: &IrModule) -> Result<LoweredImage, LowerError> {
    let mut image = trampoline()?;
    let trampoline_len = image.len();
    let mut relocations = Vec::new();

    let mut functions = Vec::with_capacity(module.functions.len());
    for function in &module.functions {
        pad(&mut image, FUNCTION_ALIGN);
        let offset = image.len();
        let lowered = FunctionAssembler::new(function, module.globals.len())?.lower()?;
        relocations.extend(lowered.relocations.iter().map(|reloc| Relocation {
            at: offset + reloc.at,
            global: reloc.global,
        }));
        functions.push(LoweredFunction {
            name: function.name.clone(),
            offset,
            len: lowered.code.len(),
        });
        image.extend_from_slice(&lowered.code);
    }
    pad(&mut image, DATA_ALIGN);

    Ok(LoweredImage {
        data_offset: image.len(),
        data_len: module.globals.len() * GLOBAL_SLOT,
        code: image,
        functions,
        trampoline_len,
        relocations,
    })
}

/// 注入した関数の戻り先（`nop; int3`）
///
/// 完了検出用のブレークポイントは先頭の `nop` に設定します。
fn trampoline() -> Result<Vec<u8>, LowerError> {
    let mut a = CodeAssembler::new(BITNESS)?;
    a.nop()?;
    a.int3()?;
    Ok(a.assemble(0)?)
}

fn pad(image: &mut Vec<u8>, align: usize) {
    while image.len() % align != 0 {
        image.push(PADDING);
    }
}

/// 組み立て済みの関数（オフセットは関数の先頭から）
struct AssembledFunction {
    code: Vec<u8>,
    relocations: Vec<Relocation>,
}

/// 1つの関数を組み立てる
///
/// IRの値スタックの2値は `rax`（左）と `rcx`（右）に取り出して演算します。
struct FunctionAssembler<'f> {
    a: CodeAssembler,
    function: &'f IrFunction,
    globals: usize,
    /// IR命令ごとのラベル（末尾の1つは関数の終端）
    labels: Vec<CodeLabel>,
    /// (movabs命令の番号, グローバル変数)
    relocations: Vec<(usize, usize)>,
}

impl<'f> FunctionAssembler<'f> {
    fn new(function: &'f IrFunction, globals: usize) -> Result<Self, LowerError> {
        let mut a = CodeAssembler::new(BITNESS)?;
        let labels = (0..=function.body.len()).map(|_| a.create_label()).collect();
        Ok(Self {
            a,
            function,
            globals,
            labels,
            relocations: Vec::new(),
        })
    }

    fn lower(mut self) -> Result<AssembledFunction, LowerError> {
        self.prologue()?;
        for (index, inst) in self.function.body.iter().enumerate() {
            self.a.set_label(&mut self.labels[index])?;
            self.inst(*inst)?;
        }

        // 末尾に到達した場合はスタックの値を返す
        let end = self.function.body.len();
        self.a.set_label(&mut self.labels[end])?;
        self.a.pop(rax)?;
        self.epilogue()?;

        let options = BlockEncoderOptions::RETURN_NEW_INSTRUCTION_OFFSETS
            | BlockEncoderOptions::RETURN_CONSTANT_OFFSETS;
        let result = self.a.assemble_options(0, options)?;
        let block = result.inner;
        let relocations = self
            .relocations
            .iter()
            .map(|&(index, global)| Relocation {
                at: block.new_instruction_offsets[index] as usize
                    + block.constant_offsets[index].immediate_offset(),
                global,
            })
            .collect();
        Ok(AssembledFunction {
            code: block.code_buffer,
            relocations,
        })
    }

    /// `rdi` のフレームベースを `rbx` に保持する
    fn prologue(&mut self) -> Result<(), IcedError> {
        self.a.push(rbx)?;
        self.a.push(rbp)?;
        self.a.mov(rbp, rsp)?;
        self.a.mov(rbx, rdi)
    }

    fn epilogue(&mut self) -> Result<(), IcedError> {
        self.a.mov(rsp, rbp)?;
        self.a.pop(rbp)?;
        self.a.pop(rbx)?;
        self.a.ret()
    }

    fn label(&self, target: usize) -> Result<CodeLabel, LowerError> {
        self.labels.get(target).copied().ok_or_else(|| LowerError::BadJump {
            function: self.function.name.clone(),
            target,
        })
    }

    fn inst(&mut self, inst: Inst) -> Result<(), LowerError> {
        let a = &mut self.a;
        match inst {
            Inst::Push(value) => match i32::try_from(value) {
                // 64ビットに符号拡張される
                Ok(imm) => a.push(imm)?,
                Err(_) => {
                    a.mov(rax, value)?;
                    a.push(rax)?;
                }
            },
            Inst::AddressOf(place) => {
                self.address_of(place)?;
                self.a.push(rax)?;
            }
            Inst::Load(scalar) => {
                a.pop(rax)?;
                load(a, scalar)?;
                a.push(rax)?;
            }
            Inst::Store(scalar) => {
                a.pop(rcx)?;
                a.pop(rax)?;
                store(a, scalar)?;
                a.push(rcx)?;
            }
            Inst::Dup => a.push(qword_ptr(rsp))?,
            Inst::Swap => {
                a.pop(rcx)?;
                a.pop(rax)?;
                a.push(rcx)?;
                a.push(rax)?;
            }
            Inst::Pop => a.pop(rax)?,
            Inst::Convert(scalar) => {
                a.pop(rax)?;
                convert(a, scalar)?;
                a.push(rax)?;
            }
            Inst::Unary(op) => {
                a.pop(rax)?;
                unary(a, op)?;
                a.push(rax)?;
            }
            Inst::Binary(op) => {
                a.pop(rcx)?;
                a.pop(rax)?;
                binary(a, op)?;
                a.push(rax)?;
            }
            Inst::JumpIfFalse(target) => {
                let label = self.label(target)?;
                let a = &mut self.a;
                a.pop(rax)?;
                a.test(rax, rax)?;
                a.je(label)?;
            }
            Inst::Jump(target) => {
                let label = self.label(target)?;
                self.a.jmp(label)?;
            }
            Inst::Return => {
                a.pop(rax)?;
                self.epilogue()?;
            }
        }
        Ok(())
    }

    /// アドレスを rax に求める
    fn address_of(&mut self, place: Place) -> Result<(), LowerError> {
        match place {
            Place::Frame(offset) => {
                let disp = i32::try_from(offset).map_err(|_| LowerError::FrameOffset(offset))?;
                self.a.lea(rax, qword_ptr(rbx + disp))?;
            }
            Place::Global(index) => {
                if index >= self.globals {
                    return Err(LowerError::BadGlobal {
                        function: self.function.name.clone(),
                        index,
                    });
                }
                // 配置先が決まるまで即値は0（常に64ビット即値の形）
                self.relocations.push((self.a.instructions().len(), index));
                self.a
                    .add_instruction(Instruction::with2(Code::Mov_r64_imm64, Register::RAX, 0u64)?)?;
            }
            Place::Absolute(addr) => self.a.mov(rax, addr)?,
        }
        Ok(())
    }
}

/// [rax] を読み取り、64ビットに拡張して rax に置く
fn load(a: &mut CodeAssembler, scalar: Scalar) -> Result<(), IcedError> {
    match scalar {
        Scalar::Bool | Scalar::U8 => a.movzx(eax, byte_ptr(rax)),
        Scalar::I8 => a.movsx(rax, byte_ptr(rax)),
        Scalar::U16 => a.movzx(eax, word_ptr(rax)),
        Scalar::I16 => a.movsx(rax, word_ptr(rax)),
        Scalar::U32 => a.mov(eax, dword_ptr(rax)),
        Scalar::I32 => a.movsxd(rax, dword_ptr(rax)),
        Scalar::I64 | Scalar::U64 => a.mov(rax, qword_ptr(rax)),
    }
}

/// rcx を [rax] に書き込む
fn store(a: &mut CodeAssembler, scalar: Scalar) -> Result<(), IcedError> {
    match scalar.size() {
        1 => a.mov(byte_ptr(rax), cl),
        2 => a.mov(word_ptr(rax), cx),
        4 => a.mov(dword_ptr(rax), ecx),
        _ => a.mov(qword_ptr(rax), rcx),
    }
}

fn convert(a: &mut CodeAssembler, scalar: Scalar) -> Result<(), IcedError> {
    match scalar {
        Scalar::Bool => {
            a.test(rax, rax)?;
            a.setne(al)?;
            a.movzx(eax, al)
        }
        Scalar::I8 => a.movsx(rax, al),
        Scalar::U8 => a.movzx(eax, al),
        Scalar::I16 => a.movsx(rax, ax),
        Scalar::U16 => a.movzx(eax, ax),
        Scalar::I32 => a.movsxd(rax, eax),
        // 32ビットレジスタへの書き込みは上位をゼロにする
        Scalar::U32 => a.mov(eax, eax),
        Scalar::I64 | Scalar::U64 => Ok(()),
    }
}

fn unary(a: &mut CodeAssembler, op: UnOp) -> Result<(), IcedError> {
    match op {
        UnOp::Neg => a.neg(rax),
        UnOp::Not => a.not(rax),
        UnOp::LogicalNot => {
            a.test(rax, rax)?;
            a.sete(al)?;
            a.movzx(eax, al)
        }
    }
}

/// rax = rax (op) rcx
fn binary(a: &mut CodeAssembler, op: BinOp) -> Result<(), IcedError> {
    match op {
        BinOp::Add => a.add(rax, rcx),
        BinOp::Sub => a.sub(rax, rcx),
        BinOp::Mul => a.imul_2(rax, rcx),
        BinOp::Div | BinOp::Rem => {
            a.cqo()?;
            a.idiv(rcx)?;
            if op == BinOp::Rem {
                a.mov(rax, rdx)?;
            }
            Ok(())
        }
        BinOp::DivU | BinOp::RemU => {
            a.xor(edx, edx)?;
            a.div(rcx)?;
            if op == BinOp::RemU {
                a.mov(rax, rdx)?;
            }
            Ok(())
        }
        BinOp::And => a.and(rax, rcx),
        BinOp::Or => a.or(rax, rcx),
        BinOp::Xor => a.xor(rax, rcx),
        BinOp::Shl => a.shl(rax, cl),
        BinOp::Shr => a.sar(rax, cl),
        BinOp::ShrU => a.shr(rax, cl),
        BinOp::Eq
        | BinOp::Ne
        | BinOp::Lt
        | BinOp::LtU
        | BinOp::Le
        | BinOp::LeU
        | BinOp::Gt
        | BinOp::GtU
        | BinOp::Ge
        | BinOp::GeU => {
            a.cmp(rax, rcx)?;
            match op {
                BinOp::Eq => a.sete(al)?,
                BinOp::Ne => a.setne(al)?,
                BinOp::Lt => a.setl(al)?,
                BinOp::Le => a.setle(al)?,
                BinOp::Gt => a.setg(al)?,
                BinOp::Ge => a.setge(al)?,
                BinOp::LtU => a.setb(al)?,
                BinOp::LeU => a.setbe(al)?,
                BinOp::GtU => a.seta(al)?,
                _ => a.setae(al)?,
            }
            a.movzx(eax, al)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use iced_x86::{Decoder, DecoderOptions, Mnemonic, OpKind};
    use kotoba_expr::{IrGlobal, ValueType};

    fn function(name: &str, body: Vec<Inst>) -> IrFunction {
        IrFunction {
            name: name.to_string(),
            body,
            result: ValueType::INT,
        }
    }

    fn module(body: Vec<Inst>) -> IrModule {
        IrModule {
            functions: vec![function("f", body)],
            globals: vec![],
            entry: None,
        }
    }

    fn decode(image: &LoweredImage, base: u64, index: usize) -> Vec<iced_x86::Instruction> {
        let code = image.link(base);
        let f = &image.functions()[index];
        let ip = base + f.offset as u64;
        Decoder::with_ip(BITNESS, &code[f.offset..f.offset + f.len], ip, DecoderOptions::NONE)
            .into_iter()
            .collect()
    }

    fn mnemonics(insns: &[iced_x86::Instruction]) -> Vec<Mnemonic> {
        insns.iter().map(|i| i.mnemonic()).collect()
    }

    #[test]
    fn test_layout() {
        let module = IrModule {
            functions: vec![
                function("f", vec![Inst::Push(1), Inst::Return]),
                function("g", vec![Inst::Push(2), Inst::Return]),
            ],
            globals: vec![],
            entry: None,
        };
        let image = lower(&module).unwrap();
        assert_eq!(&image.link(0)[..image.trampoline_len()], &[0x90, 0xcc]);
        assert_eq!(image.functions()[0].offset, 16);
        assert_eq!(image.functions()[1].offset % 16, 0);
        assert_eq!(image.size() % 8, 0);

        let names = mnemonics(&decode(&image, 0, 0));
        assert_eq!(
            names,
            [
                Mnemonic::Push,
                Mnemonic::Push,
                Mnemonic::Mov,
                Mnemonic::Mov,
                Mnemonic::Push,
                Mnemonic::Pop,
                Mnemonic::Mov,
                Mnemonic::Pop,
                Mnemonic::Pop,
                Mnemonic::Ret,
                // 末尾の暗黙のreturn
                Mnemonic::Pop,
                Mnemonic::Mov,
                Mnemonic::Pop,
                Mnemonic::Pop,
                Mnemonic::Ret,
            ]
        );
    }

    #[test]
    fn test_large_immediate_uses_movabs() {
        let image = lower(&module(vec![Inst::Push(0x1_0000_0000), Inst::Return])).unwrap();
        let insns = decode(&image, 0, 0);
        let movabs = &insns[4];
        assert_eq!(movabs.code(), Code::Mov_r64_imm64);
        assert_eq!(movabs.immediate64(), 0x1_0000_0000);
        assert_eq!(insns[5].mnemonic(), Mnemonic::Push);
        assert_eq!(insns[5].op0_register(), Register::RAX);
    }

    #[test]
    fn test_global_relocation() {
        let module = IrModule {
            functions: vec![function(
                "init",
                vec![
                    Inst::AddressOf(Place::Global(1)),
                    Inst::Push(7),
                    Inst::Store(Scalar::I32),
                    Inst::Return,
                ],
            )],
            globals: vec![
                IrGlobal {
                    name: "a".into(),
                    ty: ValueType::INT,
                    ctor: None,
                },
                IrGlobal {
                    name: "b".into(),
                    ty: ValueType::INT,
                    ctor: Some(0),
                },
            ],
            entry: None,
        };
        let image = lower(&module).unwrap();
        let base = 0x7f00_0000_0000;
        let code = image.link(base);
        assert_eq!(code.len(), image.size());

        let insns = decode(&image, base, 0);
        assert_eq!(insns[4].code(), Code::Mov_r64_imm64);
        assert_eq!(insns[4].immediate64(), base + image.global_offset(1) as u64);
        // データ領域はゼロ
        assert!(code[image.global_offset(0)..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_jump_targets_are_resolved() {
        let image = lower(&module(vec![
            Inst::Push(0),
            Inst::JumpIfFalse(3),
            Inst::Push(1),
            Inst::Push(2),
            Inst::Return,
        ]))
        .unwrap();
        let insns = decode(&image, 0x1000, 0);
        let je = insns.iter().position(|i| i.mnemonic() == Mnemonic::Je).unwrap();
        assert!(matches!(insns[je].op0_kind(), OpKind::NearBranch64));
        // push 1 を飛び越えて push 2 に着く
        let target = insns[je].near_branch_target();
        let landed = insns.iter().find(|i| i.ip() == target).unwrap();
        assert_eq!(landed.mnemonic(), Mnemonic::Push);
        assert_eq!(landed.immediate(0), 2);
        assert_eq!(insns[je + 1].immediate(0), 1);
    }

    #[test]
    fn test_unsigned_operations_select_unsigned_instructions() {
        let ops = [
            (BinOp::DivU, Mnemonic::Div),
            (BinOp::Div, Mnemonic::Idiv),
            (BinOp::ShrU, Mnemonic::Shr),
            (BinOp::Shr, Mnemonic::Sar),
            (BinOp::LtU, Mnemonic::Setb),
            (BinOp::GeU, Mnemonic::Setae),
            (BinOp::Gt, Mnemonic::Setg),
        ];
        for (op, expected) in ops {
            let image = lower(&module(vec![
                Inst::Push(9),
                Inst::Push(2),
                Inst::Binary(op),
                Inst::Return,
            ]))
            .unwrap();
            let names = mnemonics(&decode(&image, 0, 0));
            assert!(names.contains(&expected), "{op:?}: {names:?}");
        }
    }

    #[test]
    fn test_invalid_references() {
        let bad_jump = module(vec![Inst::Jump(9)]);
        assert!(matches!(
            lower(&bad_jump),
            Err(LowerError::BadJump { target: 9, .. })
        ));

        let bad_global = module(vec![Inst::AddressOf(Place::Global(0))]);
        assert!(matches!(
            lower(&bad_global),
            Err(LowerError::BadGlobal { index: 0, .. })
        ));
    }
}
