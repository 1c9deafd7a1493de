//! 組み込みのC系整数式フロントエンド
//!
//! 演算子順位法（Pratt parser）で式を解析し、IRを直接生成します。
//! 算術は64ビット符号付きで行い、キャスト・読み込み・格納の位置で型の幅に変換します。
//!
//! 診断はclangに倣い、機械的に直せる誤りにはfix-itを付けます。
//!
//! - 閉じ括弧の欠落: 直前の字句の直後に `)` を挿入
//! - 未宣言の識別子: 編集距離の近い候補への置換
//! - トップレベル宣言の `;` 欠落: 宣言子の直後に `;` を挿入

use crate::ir::{constructor_name, EXPR_FUNCTION_MANGLED, EXPR_FUNCTION_NAME};
use crate::lexer::{tokenize, Token, TokenKind};
use crate::{
    BinOp, CompileOptions, CompileOutput, Compiler, Completion, Diagnostic, FixIt, Inst, IrFunction,
    IrGlobal, IrModule, Language, Place, ResultType, Scalar, SymbolLookup, UnOp, ValueType,
    VariableLocation,
};

/// 組み込みのC系式コンパイラ
#[derive(Debug, Clone, Copy, Default)]
pub struct CFamilyCompiler;

impl Compiler for CFamilyCompiler {
    fn compile(&self, text: &str, options: &CompileOptions, symbols: &dyn SymbolLookup) -> CompileOutput {
        let (tokens, mut diagnostics) = tokenize(text);
        let mut parser = Parser::new(tokens, options.language, symbols);

        let module = if options.top_level {
            parser.top_level();
            IrModule {
                functions: std::mem::take(&mut parser.functions),
                globals: std::mem::take(&mut parser.globals),
                entry: None,
            }
        } else {
            let function = parser.expression_function(options.result_type);
            IrModule {
                functions: vec![function],
                globals: Vec::new(),
                entry: Some(EXPR_FUNCTION_NAME.to_string()),
            }
        };

        diagnostics.extend(parser.diagnostics);
        let failed = diagnostics.iter().any(Diagnostic::is_error);
        CompileOutput {
            module: (!failed).then_some(module),
            diagnostics,
        }
    }

    /// 識別子をシンボル表の名前、C系のキーワードと型名で補完する
    fn complete(
        &self,
        text: &str,
        pos: usize,
        options: &CompileOptions,
        symbols: &dyn SymbolLookup,
    ) -> Completion {
        let names = symbols
            .candidates()
            .into_iter()
            .chain(language_keywords(options.language).map(str::to_string));
        Completion::identifier(text, pos, names)
    }
}

/// 評価結果の位置
#[derive(Debug, Clone, Copy)]
enum Operand {
    /// 値がスタックにある
    RValue(ValueType),
    /// アドレスがスタックにある
    LValue(ValueType),
}

impl Operand {
    fn ty(self) -> ValueType {
        match self {
            Operand::RValue(ty) | Operand::LValue(ty) => ty,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Infix {
    Comma,
    Assign,
    Compound(BinOp),
    Conditional,
    LogicalOr,
    LogicalAnd,
    Binary(BinOp),
}

fn infix(token: &Token) -> Option<(u8, Infix)> {
    let TokenKind::Punct(p) = token.kind else {
        return None;
    };
    Some(match p {
        "," => (1, Infix::Comma),
        "=" => (2, Infix::Assign),
        "+=" => (2, Infix::Compound(BinOp::Add)),
        "-=" => (2, Infix::Compound(BinOp::Sub)),
        "*=" => (2, Infix::Compound(BinOp::Mul)),
        "/=" => (2, Infix::Compound(BinOp::Div)),
        "%=" => (2, Infix::Compound(BinOp::Rem)),
        "<<=" => (2, Infix::Compound(BinOp::Shl)),
        ">>=" => (2, Infix::Compound(BinOp::Shr)),
        "&=" => (2, Infix::Compound(BinOp::And)),
        "|=" => (2, Infix::Compound(BinOp::Or)),
        "^=" => (2, Infix::Compound(BinOp::Xor)),
        "?" => (3, Infix::Conditional),
        "||" => (4, Infix::LogicalOr),
        "&&" => (5, Infix::LogicalAnd),
        "|" => (6, Infix::Binary(BinOp::Or)),
        "^" => (7, Infix::Binary(BinOp::Xor)),
        "&" => (8, Infix::Binary(BinOp::And)),
        "==" => (9, Infix::Binary(BinOp::Eq)),
        "!=" => (9, Infix::Binary(BinOp::Ne)),
        "<" => (10, Infix::Binary(BinOp::Lt)),
        "<=" => (10, Infix::Binary(BinOp::Le)),
        ">" => (10, Infix::Binary(BinOp::Gt)),
        ">=" => (10, Infix::Binary(BinOp::Ge)),
        "<<" => (11, Infix::Binary(BinOp::Shl)),
        ">>" => (11, Infix::Binary(BinOp::Shr)),
        "+" => (12, Infix::Binary(BinOp::Add)),
        "-" => (12, Infix::Binary(BinOp::Sub)),
        "*" => (13, Infix::Binary(BinOp::Mul)),
        "/" => (13, Infix::Binary(BinOp::Div)),
        "%" => (13, Infix::Binary(BinOp::Rem)),
        _ => return None,
    })
}

fn typedef_scalar(name: &str) -> Option<Scalar> {
    Some(match name {
        "int8_t" => Scalar::I8,
        "uint8_t" => Scalar::U8,
        "int16_t" => Scalar::I16,
        "uint16_t" => Scalar::U16,
        "int32_t" => Scalar::I32,
        "uint32_t" => Scalar::U32,
        "int64_t" | "ssize_t" | "intptr_t" | "ptrdiff_t" => Scalar::I64,
        "uint64_t" | "size_t" | "uintptr_t" => Scalar::U64,
        _ => return None,
    })
}

const TYPE_KEYWORDS: [&str; 9] = [
    "void", "char", "short", "int", "long", "signed", "unsigned", "const", "volatile",
];
const TYPEDEF_NAMES: [&str; 13] = [
    "int8_t", "uint8_t", "int16_t", "uint16_t", "int32_t", "uint32_t", "int64_t", "ssize_t",
    "intptr_t", "ptrdiff_t", "uint64_t", "size_t", "uintptr_t",
];
const BOOL_KEYWORDS: [&str; 3] = ["bool", "_Bool", "BOOL"];
const VALUE_KEYWORDS: [&str; 6] = ["true", "false", "nullptr", "nil", "YES", "NO"];

fn bool_keyword(language: Language, name: &str) -> bool {
    match name {
        "bool" => matches!(language, Language::Cpp | Language::ObjCpp),
        "_Bool" => matches!(language, Language::C | Language::ObjC),
        "BOOL" => matches!(language, Language::ObjC | Language::ObjCpp),
        _ => false,
    }
}

/// 言語が定義する値のキーワード
fn keyword_value(language: Language, name: &str) -> Option<(i64, ValueType)> {
    let cpp = matches!(language, Language::Cpp | Language::ObjCpp);
    let objc = matches!(language, Language::ObjC | Language::ObjCpp);
    match name {
        "true" if cpp => Some((1, ValueType::Scalar(Scalar::Bool))),
        "false" if cpp => Some((0, ValueType::Scalar(Scalar::Bool))),
        "nullptr" if cpp => Some((0, ValueType::Pointer(None))),
        "nil" if objc => Some((0, ValueType::Pointer(None))),
        "YES" if objc => Some((1, ValueType::Scalar(Scalar::I8))),
        "NO" if objc => Some((0, ValueType::Scalar(Scalar::I8))),
        _ => None,
    }
}

/// 言語で使えるキーワードと型名
fn language_keywords(language: Language) -> impl Iterator<Item = &'static str> {
    TYPE_KEYWORDS
        .into_iter()
        .chain(["sizeof"])
        .chain(TYPEDEF_NAMES)
        .chain(BOOL_KEYWORDS.into_iter().filter(move |k| bool_keyword(language, k)))
        .chain(VALUE_KEYWORDS.into_iter().filter(move |k| keyword_value(language, k).is_some()))
}

/// 整数の型昇格
fn promote(s: Scalar) -> Scalar {
    match s {
        Scalar::Bool | Scalar::I8 | Scalar::U8 | Scalar::I16 | Scalar::U16 => Scalar::I32,
        other => other,
    }
}

/// 通常の算術変換
fn common(a: Scalar, b: Scalar) -> Scalar {
    let (a, b) = (promote(a), promote(b));
    if a == b {
        a
    } else if a.size() != b.size() {
        if a.size() > b.size() {
            a
        } else {
            b
        }
    } else if a.is_signed() {
        b
    } else {
        a
    }
}

/// 編集距離（レーベンシュタイン距離）
fn edit_distance(a: &str, b: &str) -> usize {
    let b: Vec<char> = b.chars().collect();
    let mut row: Vec<usize> = (0..=b.len()).collect();
    for (i, ca) in a.chars().enumerate() {
        let mut diagonal = row[0];
        row[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let above = row[j + 1];
            row[j + 1] = if ca == *cb {
                diagonal
            } else {
                1 + diagonal.min(above).min(row[j])
            };
            diagonal = above;
        }
    }
    row[b.len()]
}

struct Parser<'s> {
    tokens: Vec<Token>,
    pos: usize,
    language: Language,
    symbols: &'s dyn SymbolLookup,
    diagnostics: Vec<Diagnostic>,
    code: Vec<Inst>,
    /// トップレベル宣言で定義されたグローバル変数
    globals: Vec<IrGlobal>,
    /// グローバル変数の初期化関数
    functions: Vec<IrFunction>,
}

impl<'s> Parser<'s> {
    fn new(tokens: Vec<Token>, language: Language, symbols: &'s dyn SymbolLookup) -> Self {
        Self {
            tokens,
            pos: 0,
            language,
            symbols,
            diagnostics: Vec::new(),
            code: Vec::new(),
            globals: Vec::new(),
            functions: Vec::new(),
        }
    }

    // ---- 字句の操作 ----

    fn peek(&self) -> &Token {
        // 末尾は必ずEof
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_at(&self, n: usize) -> &Token {
        &self.tokens[(self.pos + n).min(self.tokens.len() - 1)]
    }

    fn bump(&mut self) -> Token {
        let token = self.peek().clone();
        if token.kind != TokenKind::Eof {
            self.pos += 1;
        }
        token
    }

    fn at_eof(&self) -> bool {
        self.peek().kind == TokenKind::Eof
    }

    fn at_punct(&self, p: &str) -> bool {
        self.peek().is_punct(p)
    }

    fn eat_punct(&mut self, p: &str) -> bool {
        if self.at_punct(p) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    /// 直前の字句の終端
    fn prev_end(&self) -> usize {
        self.pos
            .checked_sub(1)
            .and_then(|i| self.tokens.get(i))
            .map_or(0, |t| t.end)
    }

    /// `close` を読む。なければ挿入のfix-itを付けたエラーと、対応する開き記号へのnoteを報告する
    fn expect_closing(&mut self, close: &'static str, open: &Token) {
        if self.eat_punct(close) {
            return;
        }
        let at = self.peek().start;
        let insert_at = self.prev_end();
        self.diagnostics.push(
            Diagnostic::error(format!("expected '{}'", close), at)
                .with_fixit(FixIt::insert(insert_at, close)),
        );
        let open_text = match open.kind {
            TokenKind::Punct(p) => p,
            _ => "(",
        };
        self.diagnostics.push(Diagnostic::note(
            format!("to match this '{}'", open_text),
            open.start,
        ));
    }

    /// `;` まで（`;` を含む）読み飛ばす。少なくとも1字句は進む
    fn skip_past_semicolon(&mut self) {
        loop {
            let token = self.bump();
            if token.kind == TokenKind::Eof || token.is_punct(";") {
                break;
            }
        }
    }

    // ---- 命令の生成 ----

    fn emit(&mut self, inst: Inst) -> usize {
        self.code.push(inst);
        self.code.len() - 1
    }

    fn here(&self) -> usize {
        self.code.len()
    }

    fn patch(&mut self, at: usize, target: usize) {
        match &mut self.code[at] {
            Inst::JumpIfFalse(t) | Inst::Jump(t) => *t = target,
            _ => {}
        }
    }

    fn rvalue(&mut self, operand: Operand) -> ValueType {
        if let Operand::LValue(ty) = operand {
            self.emit(Inst::Load(ty.storage()));
        }
        operand.ty()
    }

    /// 64ビット未満の型なら幅を合わせる
    fn convert_to(&mut self, ty: ValueType) {
        let storage = ty.storage();
        if storage.size() < 8 {
            self.emit(Inst::Convert(storage));
        }
    }

    fn bool_type(&self) -> ValueType {
        match self.language {
            Language::Cpp | Language::ObjCpp => ValueType::Scalar(Scalar::Bool),
            Language::C | Language::ObjC => ValueType::INT,
        }
    }

    fn error(&mut self, message: impl Into<String>, offset: usize) {
        self.diagnostics.push(Diagnostic::error(message, offset));
    }

    // ---- 型名 ----

    fn is_bool_keyword(&self, name: &str) -> bool {
        bool_keyword(self.language, name)
    }

    fn is_type_name(&self, token: &Token) -> bool {
        let TokenKind::Ident(name) = &token.kind else {
            return false;
        };
        matches!(
            name.as_str(),
            "void" | "char" | "short" | "int" | "long" | "signed" | "unsigned" | "const" | "volatile"
        ) || typedef_scalar(name).is_some()
            || self.is_bool_keyword(name)
    }

    /// 型名を読む。`void` は `None`
    fn parse_type(&mut self) -> Option<ValueType> {
        let start = self.peek().start;
        let (mut unsigned, mut char_, mut short, mut void) = (false, false, false, false);
        let mut long = 0;
        let mut named = None;

        while self.is_type_name(self.peek()) {
            let TokenKind::Ident(name) = self.bump().kind else {
                break;
            };
            match name.as_str() {
                "unsigned" => unsigned = true,
                "char" => char_ = true,
                "short" => short = true,
                "long" => long += 1,
                "void" => void = true,
                "signed" | "int" | "const" | "volatile" => {}
                "BOOL" => named = Some(Scalar::I8),
                other => named = typedef_scalar(other).or(Some(Scalar::Bool)),
            }
        }

        let scalar = if void {
            None
        } else if let Some(s) = named {
            Some(s)
        } else if char_ {
            Some(if unsigned { Scalar::U8 } else { Scalar::I8 })
        } else if short {
            Some(if unsigned { Scalar::U16 } else { Scalar::I16 })
        } else if long > 0 {
            Some(if unsigned { Scalar::U64 } else { Scalar::I64 })
        } else {
            Some(if unsigned { Scalar::U32 } else { Scalar::I32 })
        };

        let mut depth = 0;
        while self.eat_punct("*") {
            depth += 1;
        }
        if depth > 1 {
            self.error("pointers to pointers are not supported in expressions", start);
        }
        match (scalar, depth) {
            (s, d) if d > 0 => Some(ValueType::Pointer(s)),
            (Some(s), _) => Some(ValueType::Scalar(s)),
            (None, _) => None,
        }
    }

    // ---- 名前の解決 ----

    /// 言語が定義する値のキーワード
    fn keyword_value(&self, name: &str) -> Option<(i64, ValueType)> {
        keyword_value(self.language, name)
    }

    fn resolve(&mut self, name: &str) -> Option<Operand> {
        if let Some((value, ty)) = self.keyword_value(name) {
            self.emit(Inst::Push(value));
            return Some(Operand::RValue(ty));
        }
        if let Some(index) = self.globals.iter().position(|g| g.name == name) {
            let ty = self.globals[index].ty;
            self.emit(Inst::AddressOf(Place::Global(index)));
            return Some(Operand::LValue(ty));
        }
        let info = self.symbols.lookup(name)?;
        let place = match info.location {
            VariableLocation::Global(addr) => Place::Absolute(addr),
            VariableLocation::Frame(offset) => Place::Frame(offset),
        };
        self.emit(Inst::AddressOf(place));
        Some(Operand::LValue(info.ty))
    }

    /// 未宣言の識別子。近い名前があれば置換のfix-itを付けて、その名前で続行する
    fn undeclared(&mut self, name: &str, token: &Token) -> Operand {
        let limit = ((name.len() + 2) / 3).min(2);
        let mut candidates = self.symbols.candidates();
        candidates.extend(self.globals.iter().map(|g| g.name.clone()));
        candidates.extend(
            VALUE_KEYWORDS
                .iter()
                .filter(|k| self.keyword_value(k).is_some())
                .map(|k| k.to_string()),
        );
        let best = candidates
            .into_iter()
            .filter(|c| c != name)
            .map(|c| (edit_distance(name, &c), c))
            .filter(|(d, _)| *d <= limit)
            .min();

        match best {
            Some((_, suggestion)) => {
                self.diagnostics.push(
                    Diagnostic::error(
                        format!(
                            "use of undeclared identifier '{}'; did you mean '{}'?",
                            name, suggestion
                        ),
                        token.start,
                    )
                    .with_fixit(FixIt::replace(token.start, token.end, suggestion.clone())),
                );
                if let Some(operand) = self.resolve(&suggestion) {
                    return operand;
                }
            }
            None => self.error(format!("use of undeclared identifier '{}'", name), token.start),
        }
        self.emit(Inst::Push(0));
        Operand::RValue(ValueType::INT)
    }

    // ---- 式 ----

    fn expr(&mut self) -> Operand {
        self.binary(1)
    }

    fn binary(&mut self, min_prec: u8) -> Operand {
        let mut lhs = self.unary();
        loop {
            let token = self.peek().clone();
            let Some((prec, op)) = infix(&token) else {
                break;
            };
            if prec < min_prec {
                break;
            }
            self.bump();
            lhs = match op {
                Infix::Comma => {
                    self.rvalue(lhs);
                    self.emit(Inst::Pop);
                    self.binary(prec + 1)
                }
                Infix::Assign => self.assign(lhs, None, &token),
                Infix::Compound(op) => self.assign(lhs, Some(op), &token),
                Infix::Conditional => self.conditional(lhs, &token),
                Infix::LogicalAnd => self.logical_and(lhs, prec),
                Infix::LogicalOr => self.logical_or(lhs, prec),
                Infix::Binary(op) => {
                    let lty = self.rvalue(lhs);
                    let rhs = self.binary(prec + 1);
                    let rty = self.rvalue(rhs);
                    Operand::RValue(self.arith(op, lty, rty, &token))
                }
            };
        }
        lhs
    }

    fn assign(&mut self, lhs: Operand, op: Option<BinOp>, token: &Token) -> Operand {
        let Operand::LValue(ty) = lhs else {
            self.error("expression is not assignable", token.start);
            let rhs = self.binary(2);
            self.rvalue(rhs);
            return Operand::RValue(lhs.ty());
        };
        if let Some(op) = op {
            self.emit(Inst::Dup);
            self.emit(Inst::Load(ty.storage()));
            let rhs = self.binary(2);
            let rty = self.rvalue(rhs);
            self.arith(op, ty, rty, token);
        } else {
            let rhs = self.binary(2);
            let rty = self.rvalue(rhs);
            if ty.is_pointer() != rty.is_pointer() && self.code.last() != Some(&Inst::Push(0)) {
                self.diagnostics.push(Diagnostic::warning(
                    format!("incompatible conversion assigning to '{}' from '{}'", ty, rty),
                    token.start,
                ));
            }
        }
        self.convert_to(ty);
        self.emit(Inst::Store(ty.storage()));
        Operand::RValue(ty)
    }

    fn conditional(&mut self, cond: Operand, question: &Token) -> Operand {
        self.rvalue(cond);
        let to_else = self.emit(Inst::JumpIfFalse(usize::MAX));
        let then = self.expr();
        let then_ty = self.rvalue(then);
        let to_end = self.emit(Inst::Jump(usize::MAX));

        let else_start = self.here();
        self.patch(to_else, else_start);
        if !self.eat_punct(":") {
            let at = self.peek().start;
            self.error("expected ':'", at);
            self.diagnostics
                .push(Diagnostic::note("to match this '?'", question.start));
        }
        let otherwise = self.binary(3);
        let else_ty = self.rvalue(otherwise);
        let end = self.here();
        self.patch(to_end, end);

        Operand::RValue(match (then_ty, else_ty) {
            (ValueType::Pointer(_), _) => then_ty,
            (_, ValueType::Pointer(_)) => else_ty,
            (ValueType::Scalar(a), ValueType::Scalar(b)) => {
                let ty = ValueType::Scalar(common(a, b));
                self.convert_to(ty);
                ty
            }
        })
    }

    fn logical_and(&mut self, lhs: Operand, prec: u8) -> Operand {
        self.rvalue(lhs);
        let lhs_false = self.emit(Inst::JumpIfFalse(usize::MAX));
        let rhs = self.binary(prec + 1);
        self.rvalue(rhs);
        let rhs_false = self.emit(Inst::JumpIfFalse(usize::MAX));
        self.emit(Inst::Push(1));
        let to_end = self.emit(Inst::Jump(usize::MAX));
        let false_label = self.emit(Inst::Push(0));
        self.patch(lhs_false, false_label);
        self.patch(rhs_false, false_label);
        let end = self.here();
        self.patch(to_end, end);
        Operand::RValue(self.bool_type())
    }

    fn logical_or(&mut self, lhs: Operand, prec: u8) -> Operand {
        self.rvalue(lhs);
        self.emit(Inst::Unary(UnOp::LogicalNot));
        let lhs_true = self.emit(Inst::JumpIfFalse(usize::MAX));
        let rhs = self.binary(prec + 1);
        self.rvalue(rhs);
        self.emit(Inst::Unary(UnOp::LogicalNot));
        let rhs_true = self.emit(Inst::JumpIfFalse(usize::MAX));
        self.emit(Inst::Push(0));
        let to_end = self.emit(Inst::Jump(usize::MAX));
        let true_label = self.emit(Inst::Push(1));
        self.patch(lhs_true, true_label);
        self.patch(rhs_true, true_label);
        let end = self.here();
        self.patch(to_end, end);
        Operand::RValue(self.bool_type())
    }

    /// 2つのU32被演算子のうち符号付きの側を変換する
    fn coerce_unsigned(&mut self, lhs: Scalar, rhs: Scalar) {
        if common(lhs, rhs) != Scalar::U32 {
            return;
        }
        if promote(lhs) != Scalar::U32 {
            self.emit(Inst::Swap);
            self.emit(Inst::Convert(Scalar::U32));
            self.emit(Inst::Swap);
        }
        if promote(rhs) != Scalar::U32 {
            self.emit(Inst::Convert(Scalar::U32));
        }
    }

    /// スタック上の2値に二項演算を適用し、結果の型を返す
    fn arith(&mut self, op: BinOp, lty: ValueType, rty: ValueType, token: &Token) -> ValueType {
        use ValueType::{Pointer, Scalar as S};

        let invalid = |parser: &mut Self| {
            parser.error(
                format!("invalid operands to binary expression ('{}' and '{}')", lty, rty),
                token.start,
            );
            ValueType::INT
        };

        match op {
            BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
                let unsigned = match (lty, rty) {
                    (S(a), S(b)) => {
                        self.coerce_unsigned(a, b);
                        !common(a, b).is_signed()
                    }
                    _ => true,
                };
                self.emit(Inst::Binary(if unsigned { op.unsigned() } else { op }));
                return self.bool_type();
            }
            BinOp::Add | BinOp::Sub => match (lty, rty) {
                (Pointer(p), S(_)) => {
                    self.scale(p);
                    self.emit(Inst::Binary(op));
                    return lty;
                }
                (S(_), Pointer(p)) if op == BinOp::Add => {
                    self.emit(Inst::Swap);
                    self.scale(p);
                    self.emit(Inst::Binary(op));
                    return rty;
                }
                (Pointer(a), Pointer(b)) if op == BinOp::Sub && a == b => {
                    self.emit(Inst::Binary(BinOp::Sub));
                    let size = a.map_or(1, Scalar::size);
                    if size > 1 {
                        self.emit(Inst::Push(size as i64));
                        self.emit(Inst::Binary(BinOp::Div));
                    }
                    return S(Scalar::I64);
                }
                (S(_), S(_)) => {}
                _ => return invalid(self),
            },
            _ => {
                if lty.is_pointer() || rty.is_pointer() {
                    return invalid(self);
                }
            }
        }

        let (S(a), S(b)) = (lty, rty) else {
            return invalid(self);
        };
        if matches!(op, BinOp::Div | BinOp::Rem) && self.code.last() == Some(&Inst::Push(0)) {
            let what = if op == BinOp::Div { "division" } else { "remainder" };
            self.diagnostics.push(Diagnostic::warning(
                format!("{} by zero is undefined", what),
                token.start,
            ));
        }
        let result = if matches!(op, BinOp::Shl | BinOp::Shr) {
            promote(a)
        } else {
            self.coerce_unsigned(a, b);
            common(a, b)
        };
        let op = if result.is_signed() { op } else { op.unsigned() };
        self.emit(Inst::Binary(op));
        let ty = S(result);
        self.convert_to(ty);
        ty
    }

    /// スタック最上段の整数をポインタの要素サイズ倍にする
    fn scale(&mut self, pointee: Option<Scalar>) {
        let size = pointee.map_or(1, Scalar::size);
        if size > 1 {
            self.emit(Inst::Push(size as i64));
            self.emit(Inst::Binary(BinOp::Mul));
        }
    }

    /// 前置・後置のインクリメント／デクリメント
    fn increment(&mut self, operand: Operand, op: BinOp, postfix: bool, token: &Token) -> Operand {
        let Operand::LValue(ty) = operand else {
            self.error("expression is not assignable", token.start);
            return Operand::RValue(operand.ty());
        };
        let step = ty.pointee().map_or(1, Scalar::size) as i64;
        self.emit(Inst::Dup);
        self.emit(Inst::Load(ty.storage()));
        self.emit(Inst::Push(step));
        self.emit(Inst::Binary(op));
        self.convert_to(ty);
        self.emit(Inst::Store(ty.storage()));
        if postfix {
            // 格納した値から元の値を復元する
            let undo = if op == BinOp::Add { BinOp::Sub } else { BinOp::Add };
            self.emit(Inst::Push(step));
            self.emit(Inst::Binary(undo));
            self.convert_to(ty);
        }
        Operand::RValue(ty)
    }

    fn unary(&mut self) -> Operand {
        let token = self.peek().clone();
        let TokenKind::Punct(p) = token.kind else {
            if matches!(&token.kind, TokenKind::Ident(name) if name == "sizeof") {
                self.bump();
                return self.size_of();
            }
            return self.postfix();
        };

        match p {
            "(" if self.is_type_name(self.peek_at(1)) => {
                self.bump();
                let target = self.parse_type();
                self.expect_closing(")", &token);
                let operand = self.unary();
                self.rvalue(operand);
                match target {
                    Some(ty) => {
                        if let ValueType::Scalar(s) = ty {
                            self.emit(Inst::Convert(s));
                        }
                        Operand::RValue(ty)
                    }
                    None => {
                        self.error("casts to 'void' are not supported in expressions", token.start);
                        Operand::RValue(ValueType::INT)
                    }
                }
            }
            "-" | "~" | "+" | "!" => {
                self.bump();
                let operand = self.unary();
                let ty = self.rvalue(operand);
                if p == "!" {
                    self.emit(Inst::Unary(UnOp::LogicalNot));
                    return Operand::RValue(self.bool_type());
                }
                let ValueType::Scalar(s) = ty else {
                    self.error(
                        format!("invalid argument type '{}' to unary expression", ty),
                        token.start,
                    );
                    return Operand::RValue(ty);
                };
                let result = ValueType::Scalar(promote(s));
                match p {
                    "-" => {
                        self.emit(Inst::Unary(UnOp::Neg));
                    }
                    "~" => {
                        self.emit(Inst::Unary(UnOp::Not));
                    }
                    _ => {}
                }
                self.convert_to(result);
                Operand::RValue(result)
            }
            "*" => {
                self.bump();
                let operand = self.unary();
                let ty = self.rvalue(operand);
                match ty {
                    ValueType::Pointer(Some(s)) => Operand::LValue(ValueType::Scalar(s)),
                    ValueType::Pointer(None) => {
                        self.error("indirection of 'void *' is not allowed", token.start);
                        Operand::RValue(ValueType::INT)
                    }
                    ValueType::Scalar(_) => {
                        self.error(
                            format!("indirection requires pointer operand ('{}' invalid)", ty),
                            token.start,
                        );
                        Operand::RValue(ty)
                    }
                }
            }
            "&" => {
                self.bump();
                match self.unary() {
                    Operand::LValue(ValueType::Scalar(s)) => {
                        Operand::RValue(ValueType::Pointer(Some(s)))
                    }
                    Operand::LValue(ty) => {
                        self.error(
                            format!("cannot take the address of '{}': pointers to pointers are not supported", ty),
                            token.start,
                        );
                        Operand::RValue(ty)
                    }
                    Operand::RValue(ty) => {
                        self.error(
                            format!("cannot take the address of an rvalue of type '{}'", ty),
                            token.start,
                        );
                        Operand::RValue(ty)
                    }
                }
            }
            "++" | "--" => {
                self.bump();
                let operand = self.unary();
                let op = if p == "++" { BinOp::Add } else { BinOp::Sub };
                self.increment(operand, op, false, &token)
            }
            _ => self.postfix(),
        }
    }

    fn size_of(&mut self) -> Operand {
        let ty = if self.at_punct("(") && self.is_type_name(self.peek_at(1)) {
            let open = self.bump();
            let ty = self.parse_type();
            self.expect_closing(")", &open);
            ty
        } else {
            // 被演算子は評価しない
            let mark = self.here();
            let operand = self.unary();
            self.code.truncate(mark);
            Some(operand.ty())
        };
        let size = ty.map_or(1, |t| t.storage().size());
        self.emit(Inst::Push(size as i64));
        Operand::RValue(ValueType::Scalar(Scalar::U64))
    }

    fn postfix(&mut self) -> Operand {
        let mut operand = self.primary();
        loop {
            let token = self.peek().clone();
            let TokenKind::Punct(p) = token.kind else {
                break;
            };
            operand = match p {
                "[" => {
                    self.bump();
                    let base = self.rvalue(operand);
                    let index = self.expr();
                    let index_ty = self.rvalue(index);
                    self.expect_closing("]", &token);
                    match (base, index_ty) {
                        (ValueType::Pointer(Some(s)), ValueType::Scalar(_)) => {
                            self.scale(Some(s));
                            self.emit(Inst::Binary(BinOp::Add));
                            Operand::LValue(ValueType::Scalar(s))
                        }
                        _ => {
                            self.error("subscripted value is not a pointer to a scalar", token.start);
                            Operand::RValue(ValueType::INT)
                        }
                    }
                }
                "++" | "--" => {
                    self.bump();
                    let op = if p == "++" { BinOp::Add } else { BinOp::Sub };
                    self.increment(operand, op, true, &token)
                }
                "(" => {
                    self.error("function calls are not supported in expressions", token.start);
                    self.skip_balanced();
                    Operand::RValue(ValueType::INT)
                }
                "." | "->" => {
                    self.bump();
                    if matches!(self.peek().kind, TokenKind::Ident(_)) {
                        self.bump();
                    }
                    self.error("member access is not supported in expressions", token.start);
                    Operand::RValue(ValueType::INT)
                }
                _ => break,
            };
        }
        operand
    }

    /// 対応する `)` まで読み飛ばす（現在位置は `(`）
    fn skip_balanced(&mut self) {
        let mut depth = 0usize;
        loop {
            let token = self.bump();
            if token.is_punct("(") {
                depth += 1;
            } else if token.is_punct(")") {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    break;
                }
            } else if token.kind == TokenKind::Eof {
                break;
            }
        }
    }

    fn primary(&mut self) -> Operand {
        let token = self.peek().clone();
        match &token.kind {
            TokenKind::Int {
                value,
                unsigned,
                long,
                decimal,
            } => {
                self.bump();
                let scalar = literal_type(*value, *unsigned, *long, *decimal);
                self.emit(Inst::Push(*value as i64));
                Operand::RValue(ValueType::Scalar(scalar))
            }
            TokenKind::Char(value) => {
                self.bump();
                self.emit(Inst::Push(*value));
                let scalar = match self.language {
                    Language::C | Language::ObjC => Scalar::I32,
                    Language::Cpp | Language::ObjCpp => Scalar::I8,
                };
                Operand::RValue(ValueType::Scalar(scalar))
            }
            TokenKind::Ident(name) if self.is_type_name(&token) => {
                self.bump();
                self.error(
                    format!("unexpected type name '{}': expected expression", name),
                    token.start,
                );
                self.emit(Inst::Push(0));
                Operand::RValue(ValueType::INT)
            }
            TokenKind::Ident(name) => {
                self.bump();
                match self.resolve(name) {
                    Some(operand) => operand,
                    None => self.undeclared(name, &token),
                }
            }
            TokenKind::Punct("(") => {
                self.bump();
                let inner = self.expr();
                self.expect_closing(")", &token);
                inner
            }
            _ => {
                self.error("expected expression", token.start);
                self.emit(Inst::Push(0));
                Operand::RValue(ValueType::INT)
            }
        }
    }

    // ---- 翻訳単位 ----

    /// 式関数を生成する（`;` 区切りの式は最後の値を返す）
    fn expression_function(&mut self, result_type: ResultType) -> IrFunction {
        let mut ty = ValueType::INT;
        if self.at_eof() {
            let at = self.peek().start;
            self.error("expected expression", at);
        } else {
            loop {
                let operand = self.expr();
                ty = self.rvalue(operand);
                if self.eat_punct(";") && !self.at_eof() {
                    self.emit(Inst::Pop);
                    continue;
                }
                if !self.at_eof() {
                    let token = self.peek().clone();
                    self.error("extraneous tokens at end of expression", token.start);
                }
                break;
            }
        }

        let result = match result_type {
            ResultType::Default => ty,
            ResultType::Integer => ValueType::Scalar(Scalar::I64),
            ResultType::Unsigned => ValueType::Scalar(Scalar::U64),
            ResultType::Bool => {
                self.emit(Inst::Convert(Scalar::Bool));
                ValueType::Scalar(Scalar::Bool)
            }
            ResultType::Address => ValueType::Pointer(ty.pointee()),
        };
        self.emit(Inst::Return);
        IrFunction {
            name: EXPR_FUNCTION_MANGLED.to_string(),
            body: std::mem::take(&mut self.code),
            result,
        }
    }

    /// トップレベル宣言の並び
    fn top_level(&mut self) {
        while !self.at_eof() {
            if self.eat_punct(";") {
                continue;
            }
            let start = self.peek().clone();
            if !self.is_type_name(&start) {
                match &start.kind {
                    TokenKind::Ident(name) => {
                        self.error(format!("unknown type name '{}'", name), start.start)
                    }
                    _ => self.error("expected top-level declaration", start.start),
                }
                self.skip_past_semicolon();
                continue;
            }
            self.declaration();
        }
    }

    fn declaration(&mut self) {
        let ty = self.parse_type();
        let name_token = self.peek().clone();
        let TokenKind::Ident(name) = name_token.kind.clone() else {
            self.error("expected identifier in declaration", name_token.start);
            self.skip_past_semicolon();
            return;
        };
        self.bump();

        let ty = match ty {
            Some(ty) => ty,
            None => {
                self.error(
                    format!("variable '{}' has incomplete type 'void'", name),
                    name_token.start,
                );
                ValueType::INT
            }
        };
        let redefined = self.globals.iter().any(|g| g.name == name)
            || self.symbols.lookup(&name).is_some()
            || self.keyword_value(&name).is_some();
        if redefined {
            self.error(format!("redefinition of '{}'", name), name_token.start);
        }

        let index = self.globals.len();
        self.globals.push(IrGlobal {
            name: name.clone(),
            ty,
            ctor: None,
        });

        if self.eat_punct("=") {
            self.code.clear();
            self.emit(Inst::AddressOf(Place::Global(index)));
            let init = self.binary(2);
            self.rvalue(init);
            self.convert_to(ty);
            self.emit(Inst::Store(ty.storage()));
            self.emit(Inst::Pop);
            self.emit(Inst::Push(0));
            self.emit(Inst::Return);
            self.functions.push(IrFunction {
                name: constructor_name(&name),
                body: std::mem::take(&mut self.code),
                result: ValueType::INT,
            });
            self.globals[index].ctor = Some(self.functions.len() - 1);
        }

        if !self.eat_punct(";") {
            let at = self.peek().start;
            let insert_at = self.prev_end();
            self.diagnostics.push(
                Diagnostic::error("expected ';' after top level declarator", at)
                    .with_fixit(FixIt::insert(insert_at, ";")),
            );
            // 次の宣言が始まっていなければ ';' まで捨てる
            if !self.at_eof() && !self.is_type_name(self.peek()) {
                self.skip_past_semicolon();
            }
        }
    }
}

/// 整数リテラルの型
fn literal_type(value: u64, unsigned: bool, long: bool, decimal: bool) -> Scalar {
    let fits_i32 = value <= i32::MAX as u64;
    let fits_u32 = value <= u32::MAX as u64;
    let fits_i64 = value <= i64::MAX as u64;
    match (unsigned, long) {
        (true, false) if fits_u32 => Scalar::U32,
        (true, _) => Scalar::U64,
        (false, false) if fits_i32 => Scalar::I32,
        (false, false) if fits_u32 && !decimal => Scalar::U32,
        (false, _) if fits_i64 => Scalar::I64,
        (false, _) => Scalar::U64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Interpreter, NoSymbols, Severity, VariableInfo};

    struct Locals(Vec<VariableInfo>);

    impl SymbolLookup for Locals {
        fn lookup(&self, name: &str) -> Option<VariableInfo> {
            self.0.iter().find(|v| v.name == name).cloned()
        }

        fn candidates(&self) -> Vec<String> {
            self.0.iter().map(|v| v.name.clone()).collect()
        }
    }

    fn locals() -> Locals {
        Locals(vec![
            VariableInfo {
                name: "count".to_string(),
                location: VariableLocation::Frame(-20),
                ty: ValueType::INT,
            },
            VariableInfo {
                name: "table".to_string(),
                location: VariableLocation::Global(0x4000),
                ty: ValueType::Pointer(Some(Scalar::I16)),
            },
        ])
    }

    fn compile_with(text: &str, options: CompileOptions, symbols: &dyn SymbolLookup) -> CompileOutput {
        CFamilyCompiler.compile(text, &options, symbols)
    }

    fn compile(text: &str) -> CompileOutput {
        compile_with(text, CompileOptions::default(), &NoSymbols)
    }

    fn eval(text: &str) -> i64 {
        let output = compile(text);
        let module = output
            .module
            .unwrap_or_else(|| panic!("{} failed: {:?}", text, output.diagnostics));
        Interpreter::run(&module).unwrap()
    }

    fn errors(output: &CompileOutput) -> Vec<&Diagnostic> {
        output.diagnostics.iter().filter(|d| d.is_error()).collect()
    }

    #[test]
    fn test_arithmetic_and_precedence() {
        assert_eq!(eval("2+3"), 5);
        assert_eq!(eval("2 + 3 * 4"), 14);
        assert_eq!(eval("(2 + 3) * 4"), 20);
        assert_eq!(eval("1 << 4 | 1"), 17);
        assert_eq!(eval("-7 / 2"), -3);
        assert_eq!(eval("-7 % 3"), -1);
        assert_eq!(eval("~0"), -1);
        assert_eq!(eval("10 - 2 - 3"), 5);
    }

    #[test]
    fn test_logical_and_conditional() {
        assert_eq!(eval("1 && 0"), 0);
        assert_eq!(eval("0 || 5"), 1);
        assert_eq!(eval("3 > 2 ? 10 : 20"), 10);
        assert_eq!(eval("0 ? 1 : 0 ? 2 : 3"), 3);
        assert_eq!(eval("!5"), 0);
        assert_eq!(eval("(1, 2, 3)"), 3);
    }

    #[test]
    fn test_casts_and_widths() {
        assert_eq!(eval("(char)300"), 44);
        assert_eq!(eval("(unsigned char)-1"), 255);
        assert_eq!(eval("2147483647 + 1"), i32::MIN as i64);
        assert_eq!(eval("4294967295u + 1"), 0);
        assert_eq!(eval("-1 < 0u"), 0);
        assert_eq!(eval("sizeof(long)"), 8);
        assert_eq!(eval("sizeof(short *)"), 8);
        assert_eq!(eval("sizeof 'a'"), 1);
    }

    #[test]
    fn test_unsigned_long_arithmetic() {
        assert_eq!(eval("(unsigned long)-1 / 2") as u64, u64::MAX / 2);
        assert_eq!(eval("(unsigned long)-1 % 10"), 5);
        assert_eq!(eval("(unsigned long)-1 > 1"), 1);
        assert_eq!(eval("-1L > 1"), 0);
        assert_eq!(eval("(unsigned long)-1 >> 60"), 15);
        assert_eq!(eval("-16L >> 2"), -4);
        assert_eq!(eval("(unsigned long)-1 <= 0"), 0);
    }

    #[test]
    fn test_completion_of_symbols_and_keywords() {
        let options = CompileOptions::default();
        let completion = CFamilyCompiler.complete("1 + co", 6, &options, &locals());
        assert_eq!(completion.start, 4);
        assert_eq!(completion.candidates, ["const", "count"]);

        let completion = CFamilyCompiler.complete("(uns", 4, &options, &locals());
        assert_eq!(completion.start, 1);
        assert_eq!(completion.candidates, ["unsigned"]);

        // カーソルより後ろは見ない
        let completion = CFamilyCompiler.complete("tab + 1", 3, &options, &locals());
        assert_eq!(completion.candidates, ["table"]);

        let completion = CFamilyCompiler.complete("12", 2, &options, &locals());
        assert!(completion.candidates.is_empty());
    }

    #[test]
    fn test_completion_follows_language() {
        let c = CompileOptions {
            language: Language::C,
            ..CompileOptions::default()
        };
        let completion = CFamilyCompiler.complete("_B", 2, &c, &NoSymbols);
        assert_eq!(completion.candidates, ["_Bool"]);
        let completion = CFamilyCompiler.complete("nu", 2, &c, &NoSymbols);
        assert!(completion.candidates.is_empty());

        let cpp = CompileOptions::default();
        let completion = CFamilyCompiler.complete("nu", 2, &cpp, &NoSymbols);
        assert_eq!(completion.candidates, ["nullptr"]);
    }

    #[test]
    fn test_language_keywords() {
        assert_eq!(eval("true + true"), 2);
        let objc = CompileOptions {
            language: Language::ObjC,
            ..CompileOptions::default()
        };
        let output = compile_with("YES == 1", objc, &NoSymbols);
        assert_eq!(Interpreter::run(&output.module.unwrap()), Ok(1));

        let c = CompileOptions {
            language: Language::C,
            ..CompileOptions::default()
        };
        let output = compile_with("nullptr", c, &NoSymbols);
        assert!(output.module.is_none());
    }

    #[test]
    fn test_missing_paren_fixit() {
        let output = compile("(1 + 2");
        let errs = errors(&output);
        assert_eq!(errs.len(), 1);
        assert_eq!(errs[0].message, "expected ')'");
        assert_eq!(errs[0].fixits, vec![FixIt::insert(6, ")")]);
        // noteは別の診断として続く（畳み込みはセッションが行う）
        let note = &output.diagnostics[1];
        assert_eq!(note.severity, Severity::Note);
        assert_eq!(note.offset, Some(0));
    }

    #[test]
    fn test_missing_paren_before_trailing_whitespace() {
        let output = compile("(1 + (2 * 3)   ");
        let errs = errors(&output);
        assert_eq!(errs[0].fixits, vec![FixIt::insert(12, ")")]);
    }

    #[test]
    fn test_typo_correction() {
        let symbols = locals();
        let output = compile_with("cuont + 1", CompileOptions::default(), &symbols);
        let errs = errors(&output);
        assert_eq!(errs.len(), 1);
        assert_eq!(
            errs[0].message,
            "use of undeclared identifier 'cuont'; did you mean 'count'?"
        );
        assert_eq!(errs[0].fixits, vec![FixIt::replace(0, 5, "count")]);

        let output = compile_with("zebra + 1", CompileOptions::default(), &symbols);
        let errs = errors(&output);
        assert_eq!(errs[0].message, "use of undeclared identifier 'zebra'");
        assert!(errs[0].fixits.is_empty());
    }

    #[test]
    fn test_variables_lower_to_loads() {
        let symbols = locals();
        let output = compile_with("count * 2", CompileOptions::default(), &symbols);
        let module = output.module.unwrap();
        let body = &module.functions[0].body;
        assert_eq!(body[0], Inst::AddressOf(Place::Frame(-20)));
        assert_eq!(body[1], Inst::Load(Scalar::I32));
        assert!(Interpreter::can_interpret(&module).is_err());

        // ポインタの添字は要素サイズでスケールされる
        let output = compile_with("table[3]", CompileOptions::default(), &symbols);
        let body = output.module.unwrap().functions.remove(0).body;
        assert_eq!(
            body,
            vec![
                Inst::AddressOf(Place::Absolute(0x4000)),
                Inst::Load(Scalar::U64),
                Inst::Push(3),
                Inst::Push(2),
                Inst::Binary(BinOp::Mul),
                Inst::Binary(BinOp::Add),
                Inst::Load(Scalar::I16),
                Inst::Return,
            ]
        );
    }

    #[test]
    fn test_assignment_requires_lvalue() {
        let output = compile("1 = 2");
        assert_eq!(errors(&output)[0].message, "expression is not assignable");

        let symbols = locals();
        let output = compile_with("count += 5", CompileOptions::default(), &symbols);
        let body = output.module.unwrap().functions.remove(0).body;
        assert_eq!(body[1], Inst::Dup);
        assert_eq!(body[body.len() - 2], Inst::Store(Scalar::I32));
    }

    #[test]
    fn test_division_by_constant_zero_warns() {
        let output = compile("1 / 0");
        assert!(output.module.is_some());
        assert_eq!(output.diagnostics[0].severity, Severity::Warning);
        assert_eq!(output.diagnostics[0].message, "division by zero is undefined");
    }

    #[test]
    fn test_result_type_override() {
        let options = CompileOptions {
            result_type: ResultType::Bool,
            ..CompileOptions::default()
        };
        let module = compile_with("42", options, &NoSymbols).module.unwrap();
        assert_eq!(module.functions[0].result, ValueType::Scalar(Scalar::Bool));
        assert_eq!(Interpreter::run(&module), Ok(1));
    }

    #[test]
    fn test_unsupported_constructs_have_no_fixits() {
        for text in ["f(1)", "a.b", "\"str\"", "", "1 2"] {
            let output = compile(text);
            let errs = errors(&output);
            assert!(!errs.is_empty(), "{}", text);
            assert!(errs.iter().all(|d| d.fixits.is_empty()), "{}", text);
        }
    }

    #[test]
    fn test_top_level_declarations() {
        let options = CompileOptions {
            top_level: true,
            ..CompileOptions::default()
        };
        let output = compile_with("int x = 5; long y; unsigned *p = &x;", options, &NoSymbols);
        assert!(errors(&output).is_empty(), "{:?}", output.diagnostics);
        let module = output.module.unwrap();
        assert_eq!(module.entry, None);
        assert_eq!(module.globals.len(), 3);
        assert_eq!(module.globals[0].ctor, Some(0));
        assert_eq!(module.globals[1].ctor, None);
        assert_eq!(module.functions[0].name, "_GLOBAL__sub_I_x");
        assert_eq!(module.functions[1].body[0], Inst::AddressOf(Place::Global(2)));
    }

    #[test]
    fn test_top_level_missing_semicolon() {
        let options = CompileOptions {
            top_level: true,
            ..CompileOptions::default()
        };
        let output = compile_with("int x = 5 int y = 6;", options, &NoSymbols);
        let errs = errors(&output);
        assert_eq!(errs.len(), 1);
        assert_eq!(errs[0].message, "expected ';' after top level declarator");
        assert_eq!(errs[0].fixits, vec![FixIt::insert(9, ";")]);
    }

    #[test]
    fn test_top_level_redefinition() {
        let options = CompileOptions {
            top_level: true,
            ..CompileOptions::default()
        };
        let symbols = locals();
        let output = compile_with("int count = 1;", options, &symbols);
        assert_eq!(errors(&output)[0].message, "redefinition of 'count'");

        let output = compile_with("int a; int a;", options, &NoSymbols);
        assert_eq!(errors(&output)[0].message, "redefinition of 'a'");
        assert!(errors(&output)[0].fixits.is_empty());
    }

    #[test]
    fn test_edit_distance() {
        assert_eq!(edit_distance("cuont", "count"), 2);
        assert_eq!(edit_distance("", "abc"), 3);
        assert_eq!(edit_distance("kitten", "sitting"), 3);
    }
}
