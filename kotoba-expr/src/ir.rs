//! 式の中間表現
//!
//! 64ビット値のスタックマシンです。値の符号は演算の種類（[`BinOp`]）で区別します。各命令はスタック上の値（アドレスも含む）を
//! 消費・生成します。ジャンプ先は関数本体内の命令インデックスです。

use std::fmt;

/// 式関数のソース上の名前
pub const EXPR_FUNCTION_NAME: &str = "$__expr";

/// 式関数のマングル名（`void $__expr(void *)`）
pub const EXPR_FUNCTION_MANGLED: &str = "_Z7$__exprPv";

/// グローバル変数の初期化関数の名前
pub fn constructor_name(global: &str) -> String {
    format!("_GLOBAL__sub_I_{}", global)
}

/// スカラー型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scalar {
    Bool,
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
}

impl Scalar {
    /// メモリ上のサイズ（バイト）
    pub fn size(self) -> usize {
        match self {
            Scalar::Bool | Scalar::I8 | Scalar::U8 => 1,
            Scalar::I16 | Scalar::U16 => 2,
            Scalar::I32 | Scalar::U32 => 4,
            Scalar::I64 | Scalar::U64 => 8,
        }
    }

    pub fn is_signed(self) -> bool {
        matches!(self, Scalar::I8 | Scalar::I16 | Scalar::I32 | Scalar::I64)
    }

    /// 64ビット値をこの型に変換し、64ビットに拡張し直す
    pub fn convert(self, value: i64) -> i64 {
        match self {
            Scalar::Bool => (value != 0) as i64,
            Scalar::I8 => value as i8 as i64,
            Scalar::U8 => value as u8 as i64,
            Scalar::I16 => value as i16 as i64,
            Scalar::U16 => value as u16 as i64,
            Scalar::I32 => value as i32 as i64,
            Scalar::U32 => value as u32 as i64,
            Scalar::I64 | Scalar::U64 => value,
        }
    }

    /// リトルエンディアンのバイト列から読み取って64ビットに拡張する
    pub fn from_le_bytes(self, bytes: &[u8]) -> Option<i64> {
        let raw = bytes.get(..self.size())?;
        let mut buf = [0u8; 8];
        buf[..raw.len()].copy_from_slice(raw);
        Some(self.convert(i64::from_le_bytes(buf)))
    }

    /// この型の幅でリトルエンディアンのバイト列にする
    pub fn to_le_bytes(self, value: i64) -> Vec<u8> {
        value.to_le_bytes()[..self.size()].to_vec()
    }

    /// C言語での型名
    pub fn c_name(self) -> &'static str {
        match self {
            Scalar::Bool => "bool",
            Scalar::I8 => "char",
            Scalar::U8 => "unsigned char",
            Scalar::I16 => "short",
            Scalar::U16 => "unsigned short",
            Scalar::I32 => "int",
            Scalar::U32 => "unsigned int",
            Scalar::I64 => "long",
            Scalar::U64 => "unsigned long",
        }
    }
}

/// 値の型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    Scalar(Scalar),
    /// スカラーへのポインタ（`None` は `void *`）
    Pointer(Option<Scalar>),
}

impl ValueType {
    pub const INT: ValueType = ValueType::Scalar(Scalar::I32);

    /// 格納に使うスカラー型（ポインタは64ビット符号なし）
    pub fn storage(self) -> Scalar {
        match self {
            ValueType::Scalar(s) => s,
            ValueType::Pointer(_) => Scalar::U64,
        }
    }

    pub fn is_pointer(self) -> bool {
        matches!(self, ValueType::Pointer(_))
    }

    /// ポインタの指す先（`void *` や非ポインタは `None`）
    pub fn pointee(self) -> Option<Scalar> {
        match self {
            ValueType::Pointer(p) => p,
            ValueType::Scalar(_) => None,
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueType::Scalar(s) => f.write_str(s.c_name()),
            ValueType::Pointer(Some(s)) => write!(f, "{} *", s.c_name()),
            ValueType::Pointer(None) => f.write_str("void *"),
        }
    }
}

/// アドレスを取る対象
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Place {
    /// 呼び出し元フレームのベースからのオフセット
    Frame(i64),
    /// モジュール内グローバル変数のインデックス
    Global(usize),
    /// 絶対アドレス
    Absolute(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Neg,
    Not,
    LogicalNot,
}

/// 二項演算
///
/// `U` で終わるものは64ビット値を符号なしとして扱います。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    DivU,
    Rem,
    RemU,
    And,
    Or,
    Xor,
    Shl,
    /// 算術右シフト
    Shr,
    /// 論理右シフト
    ShrU,
    Eq,
    Ne,
    Lt,
    LtU,
    Le,
    LeU,
    Gt,
    GtU,
    Ge,
    GeU,
}

impl BinOp {
    /// 符号なしの被演算子に対する演算に置き換える
    pub fn unsigned(self) -> BinOp {
        match self {
            BinOp::Div => BinOp::DivU,
            BinOp::Rem => BinOp::RemU,
            BinOp::Shr => BinOp::ShrU,
            BinOp::Lt => BinOp::LtU,
            BinOp::Le => BinOp::LeU,
            BinOp::Gt => BinOp::GtU,
            BinOp::Ge => BinOp::GeU,
            other => other,
        }
    }

    /// 比較演算か
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinOp::Eq
                | BinOp::Ne
                | BinOp::Lt
                | BinOp::LtU
                | BinOp::Le
                | BinOp::LeU
                | BinOp::Gt
                | BinOp::GtU
                | BinOp::Ge
                | BinOp::GeU
        )
    }
}

/// IR命令
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inst {
    Push(i64),
    AddressOf(Place),
    /// アドレスを取り出し、その位置の値を積む
    Load(Scalar),
    /// 値、アドレスの順に取り出して格納し、値を積み直す
    Store(Scalar),
    Dup,
    Swap,
    Pop,
    Convert(Scalar),
    Unary(UnOp),
    Binary(BinOp),
    /// 値を取り出し、0ならジャンプする
    JumpIfFalse(usize),
    Jump(usize),
    /// 値を取り出して関数から戻る
    Return,
}

/// IR関数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IrFunction {
    /// マングル名
    pub name: String,
    pub body: Vec<Inst>,
    pub result: ValueType,
}

/// IRグローバル変数（8バイト境界に置かれる）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IrGlobal {
    pub name: String,
    pub ty: ValueType,
    /// 初期化関数のインデックス（なければゼロ初期化）
    pub ctor: Option<usize>,
}

/// コンパイル済みモジュール
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IrModule {
    pub functions: Vec<IrFunction>,
    pub globals: Vec<IrGlobal>,
    /// 式関数のソース上の名前（トップレベルコードでは `None`）
    pub entry: Option<String>,
}

impl IrModule {
    /// 名前の一部が一致する関数を探す
    pub fn find_function(&self, fragment: &str) -> Option<(usize, &IrFunction)> {
        self.functions
            .iter()
            .enumerate()
            .find(|(_, f)| f.name.contains(fragment))
    }

    /// 式関数を探す
    pub fn entry_function(&self) -> Option<(usize, &IrFunction)> {
        self.find_function(self.entry.as_deref()?)
    }

    pub fn instructions(&self) -> impl Iterator<Item = &Inst> {
        self.functions.iter().flat_map(|f| f.body.iter())
    }
}

impl fmt::Display for IrModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, global) in self.globals.iter().enumerate() {
            writeln!(f, "@{} {}: {}", i, global.name, global.ty)?;
        }
        for function in &self.functions {
            writeln!(f, "fn {} -> {}", function.name, function.result)?;
            for (i, inst) in function.body.iter().enumerate() {
                writeln!(f, "  {:3}: {:?}", i, inst)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_convert_truncates_and_extends() {
        assert_eq!(Scalar::I8.convert(0x1ff), -1);
        assert_eq!(Scalar::U8.convert(-1), 0xff);
        assert_eq!(Scalar::U32.convert(-1), 0xffff_ffff);
        assert_eq!(Scalar::Bool.convert(42), 1);
    }

    #[test]
    fn test_from_le_bytes() {
        assert_eq!(Scalar::I16.from_le_bytes(&[0xfe, 0xff, 0x12]), Some(-2));
        assert_eq!(Scalar::U64.from_le_bytes(&[1, 2]), None);
    }

    #[test]
    fn test_entry_lookup_by_fragment() {
        let module = IrModule {
            functions: vec![IrFunction {
                name: EXPR_FUNCTION_MANGLED.to_string(),
                body: vec![Inst::Push(1), Inst::Return],
                result: ValueType::INT,
            }],
            globals: vec![],
            entry: Some(EXPR_FUNCTION_NAME.to_string()),
        };
        assert_eq!(module.entry_function().map(|(i, _)| i), Some(0));
        assert_eq!(ValueType::Pointer(Some(Scalar::I32)).to_string(), "int *");
    }
}
