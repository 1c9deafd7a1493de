//! 注入のテスト

mod common;

use common::MockTarget;
use kotoba_core::disasm;
use kotoba_core::injector::{self, InjectError};
use kotoba_core::ExecutionPolicy;
use kotoba_expr::{
    CFamilyCompiler, CompileOptions, Compiler, Inst, IrFunction, IrModule, NoSymbols, ValueType,
};

fn compile(text: &str, top_level: bool) -> IrModule {
    let options = CompileOptions {
        top_level,
        ..Default::default()
    };
    CFamilyCompiler
        .compile(text, &options, &NoSymbols)
        .module
        .expect("expression compiles")
}

#[test]
fn test_prepare_writes_linked_image() {
    let target = MockTarget::new();
    let code = injector::prepare(compile("40 + 2", false), &target, ExecutionPolicy::Always).unwrap();

    assert_eq!(target.live_allocations(), vec![code.base]);
    assert_eq!(code.trampoline, code.base);
    let trampoline = disasm::disassemble(&target.peek(code.trampoline, 2), code.trampoline).unwrap();
    let names: Vec<_> = trampoline.iter().map(|i| i.mnemonic.as_str()).collect();
    assert_eq!(names, ["nop", "int3"]);

    let entry = code.entry.unwrap();
    let entry_end = code.entry_end.unwrap();
    assert!(entry > code.base && entry_end > entry);
    assert!(entry_end <= code.base + code.size as u64);
    // 関数はret命令で終わる
    assert_eq!(target.peek(entry_end - 1, 1), vec![0xc3]);
    assert!(code.constructors.is_empty());
}

#[test]
fn test_missing_entry_is_reported_before_allocation() {
    let target = MockTarget::new();
    let module = IrModule {
        functions: vec![IrFunction {
            name: "_Z5otherv".to_string(),
            body: vec![Inst::Push(1), Inst::Return],
            result: ValueType::INT,
        }],
        globals: vec![],
        entry: Some("$__expr".to_string()),
    };

    let err = injector::prepare(module, &target, ExecutionPolicy::IfNecessary).unwrap_err();
    assert!(matches!(err, InjectError::EntryNotFound(ref name) if name == "$__expr"));
    assert!(target.live_allocations().is_empty());
}

#[test]
fn test_short_write_frees_allocation() {
    let target = MockTarget::new().with_write_limit(8);
    let err = injector::prepare(compile("1 + 2", false), &target, ExecutionPolicy::Always)
        .unwrap_err();

    match err {
        InjectError::InjectionIncomplete {
            address,
            written,
            expected,
        } => {
            assert_eq!(written, 8);
            assert!(expected > 8);
            assert_eq!(target.freed(), vec![address]);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(target.live_allocations().is_empty());
}

#[test]
fn test_top_level_resolves_constructors() {
    let target = MockTarget::new();
    let module = compile("int first = 1; long second; short third = 3;", true);
    let code = injector::prepare(module, &target, ExecutionPolicy::TopLevel).unwrap();

    assert_eq!(code.entry, None);
    assert_eq!(code.constructors.len(), 2);
    let names: Vec<_> = code.globals.iter().map(|g| g.name.as_str()).collect();
    assert_eq!(names, ["first", "second", "third"]);

    // グローバル変数は8バイト境界に並ぶ
    assert_eq!(code.globals[0].address % 8, 0);
    assert_eq!(code.globals[1].address, code.globals[0].address + 8);
    assert!(code.globals[2].address + 8 <= code.base + code.size as u64);
    assert!(code.constructors.iter().all(|c| *c < code.globals[0].address));
}
