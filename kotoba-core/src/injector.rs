//! コンパイル済みモジュールのターゲットへの注入
//!
//! モジュールをx86-64機械語に変換し、ターゲット内に確保したメモリへ書き込みます。
//! 書き込んだイメージの先頭には、注入した関数からの戻り先となるトランポリンがあります。

use crate::codegen::{self, LowerError};
use crate::disasm::{self, DisasmError};
use crate::ExecutionPolicy;
use kotoba_expr::ir::EXPR_FUNCTION_NAME;
use kotoba_expr::{IrModule, ValueType};
use kotoba_target::{RemoteTarget, TargetError};
use thiserror::Error;
use tracing::{debug, enabled, trace, warn, Level};

/// 注入のエラー
#[derive(Debug, Error)]
pub enum InjectError {
    #[error("could not find the entry function '{0}' in the compiled module")]
    EntryNotFound(String),

    #[error("only {written} of {expected} bytes of code could be written at 0x{address:x}")]
    InjectionIncomplete {
        address: u64,
        written: usize,
        expected: usize,
    },

    #[error(transparent)]
    Lower(#[from] LowerError),

    #[error(transparent)]
    Disassembly(#[from] DisasmError),

    #[error("function '{0}' has no return instruction")]
    NoReturn(String),

    #[error(transparent)]
    Target(#[from] TargetError),
}

/// ターゲット内に置かれたグローバル変数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InjectedGlobal {
    pub name: String,
    pub address: u64,
    pub ty: ValueType,
}

/// ターゲットに書き込まれ、呼び出し可能になったコード
#[derive(Debug, Clone)]
pub struct PreparedCode {
    /// 確保したメモリの先頭
    pub base: u64,
    pub size: usize,
    /// 式関数の開始アドレス（トップレベルコードでは `None`）
    pub entry: Option<u64>,
    /// 式関数のret命令の直後
    pub entry_end: Option<u64>,
    /// 戻り先のトランポリン
    pub trampoline: u64,
    /// 初期化関数のアドレス（グローバル変数の順）
    pub constructors: Vec<u64>,
    pub globals: Vec<InjectedGlobal>,
}

impl PreparedCode {
    /// ターゲットのメモリを解放する
    pub fn release(&self, target: &dyn RemoteTarget) -> Result<(), TargetError> {
        debug!("Releasing injected code at 0x{:x}", self.base);
        target.deallocate(self.base)
    }
}

/// モジュールをターゲットに注入する
///
/// モジュールは消費されます。`TopLevel` 以外では式関数が必要です。
pub fn prepare(
    module: IrModule,
    target: &dyn RemoteTarget,
    policy: ExecutionPolicy,
) -> Result<PreparedCode, InjectError> {
    let entry_index = if policy == ExecutionPolicy::TopLevel {
        None
    } else {
        let fragment = module.entry.as_deref().unwrap_or(EXPR_FUNCTION_NAME);
        let (index, function) = module
            .find_function(fragment)
            .ok_or_else(|| InjectError::EntryNotFound(fragment.to_string()))?;
        debug!("Entry function: {}", function.name);
        Some(index)
    };

    let image = codegen::lower(&module)?;
    let size = image.size();
    let base = target.allocate(size)?;
    debug!("Allocated {} bytes for injected code at 0x{:x}", size, base);

    let bytes = image.link(base);
    let written = match target.write_memory(base, &bytes) {
        Ok(written) => written,
        Err(e) => {
            free(target, base);
            return Err(e.into());
        }
    };
    debug!("Wrote {} of {} bytes at 0x{:x}", written, bytes.len(), base);
    if written < bytes.len() {
        free(target, base);
        return Err(InjectError::InjectionIncomplete {
            address: base,
            written,
            expected: bytes.len(),
        });
    }

    let (entry, entry_end) = match entry_index {
        Some(index) => {
            let function = &image.functions()[index];
            let code = &bytes[function.offset..function.offset + function.len];
            let address = base + function.offset as u64;
            if enabled!(Level::TRACE) {
                for insn in disasm::disassemble(code, address)? {
                    trace!("0x{:x}: {} {}", insn.address, insn.mnemonic, insn.operands);
                }
            }
            let last_ret = disasm::find_ret_instructions(code, address)?
                .into_iter()
                .max()
                .ok_or_else(|| InjectError::NoReturn(function.name.clone()))?;
            (Some(address), Some(last_ret + 1))
        }
        None => (None, None),
    };

    let constructors = module
        .globals
        .iter()
        .filter_map(|g| g.ctor)
        .filter_map(|index| image.functions().get(index))
        .map(|f| base + f.offset as u64)
        .collect();

    let globals = module
        .globals
        .iter()
        .enumerate()
        .map(|(i, g)| InjectedGlobal {
            name: g.name.clone(),
            address: base + image.global_offset(i) as u64,
            ty: g.ty,
        })
        .collect();

    Ok(PreparedCode {
        base,
        size,
        entry,
        entry_end,
        trampoline: base + image.trampoline_offset() as u64,
        constructors,
        globals,
    })
}

fn free(target: &dyn RemoteTarget, base: u64) {
    if let Err(e) = target.deallocate(base) {
        warn!("Failed to free injected code at 0x{:x}: {}", base, e);
    }
}
