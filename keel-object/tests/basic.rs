//! End-to-end tests: build IR through the frontend, compile, write objects,
//! and check the emitted bytes and object structures.

use keel_codegen::ir::types;
use keel_codegen::ir::{ArithBehavior, NodeKind, NodeProps, Signature};
use keel_codegen::Target;
use keel_frontend::FunctionBuilder;
use keel_module::{FuncId, Linkage, Module};
use std::str::FromStr;

fn linux_module() -> Module {
    let triple = target_lexicon::Triple::from_str("x86_64-unknown-linux-gnu").unwrap();
    Module::new(Target::for_triple(&triple).unwrap())
}

fn windows_module() -> Module {
    let triple = target_lexicon::Triple::from_str("x86_64-pc-windows-msvc").unwrap();
    Module::new(Target::for_triple(&triple).unwrap())
}

fn code_of(module: &Module, func: FuncId) -> Vec<u8> {
    module.functions[func]
        .compiled
        .as_ref()
        .expect("function not compiled")
        .bytes
        .clone()
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

const PROLOGUE: [u8; 4] = [0x55, 0x48, 0x89, 0xe5];

#[test]
fn empty_function_is_an_aligned_stub() {
    let mut module = linux_module();
    let func = module
        .declare_function("empty", Signature::default(), Linkage::Public)
        .unwrap();
    let mut b = FunctionBuilder::new(&mut module, func);
    b.create_return(&[]);
    module.define_all_functions().unwrap();

    let code = code_of(&module, func);
    assert_eq!(code.len(), 16);
    // push rbp; mov rbp, rsp; pop rbp; ret; then nop padding.
    assert_eq!(&code[..6], &[0x55, 0x48, 0x89, 0xe5, 0x5d, 0xc3]);
}

#[test]
fn identity_i32() {
    let mut module = linux_module();
    let func = module
        .declare_function(
            "ident",
            Signature::new(vec![types::I32], vec![types::I32]),
            Linkage::Public,
        )
        .unwrap();
    let mut b = FunctionBuilder::new(&mut module, func);
    let x = b.param(0);
    b.create_return(&[x]);
    module.define_all_functions().unwrap();

    let code = code_of(&module, func);
    assert_eq!(code.len() % 16, 0);
    assert_eq!(&code[..4], &PROLOGUE);
    // mov eax, edi on System V.
    assert!(contains(&code, &[0x89, 0xf8]), "missing mov eax, edi: {code:02x?}");
}

#[test]
fn add_constant_uses_lea() {
    let mut module = linux_module();
    let func = module
        .declare_function(
            "add7",
            Signature::new(vec![types::I64], vec![types::I64]),
            Linkage::Public,
        )
        .unwrap();
    let mut b = FunctionBuilder::new(&mut module, func);
    let x = b.param(0);
    let seven = b.create_signed_integer(7, 64);
    let sum = b.create_add(x, seven, ArithBehavior::None);
    b.create_return(&[sum]);
    module.define_all_functions().unwrap();

    let code = code_of(&module, func);
    // lea r, [rdi + 7]: 48 8D /r with mod=01 disp8.
    let lea_disp7 = code.windows(4).any(|w| {
        w[0] == 0x48 && w[1] == 0x8d && (w[2] & 0xc7) == 0x47 && w[3] == 7
    });
    assert!(lea_disp7, "expected lea r, [rdi+7] in {code:02x?}");
    // The selector must not fall back to add.
    assert!(!contains(&code, &[0x48, 0x81]), "unexpected add imm32");
    assert!(
        !code.windows(2).any(|w| w[0] == 0x48 && (w[1] == 0x01 || w[1] == 0x03)),
        "unexpected add r, r"
    );
}

#[test]
fn branch_on_compare_fuses_test() {
    let mut module = linux_module();
    let func = module
        .declare_function(
            "sel",
            Signature::new(vec![types::I32], vec![types::I32]),
            Linkage::Public,
        )
        .unwrap();
    let mut b = FunctionBuilder::new(&mut module, func);
    let x = b.param(0);
    let zero = b.create_signed_integer(0, 32);
    let is_zero = b.create_cmp_eq(x, zero);

    let then_region = b.create_region();
    let else_region = b.create_region();
    b.create_conditional_branch(is_zero, then_region, else_region);

    b.switch_to_region(then_region);
    let one = b.create_signed_integer(1, 32);
    b.create_return(&[one]);

    b.switch_to_region(else_region);
    let two = b.create_signed_integer(2, 32);
    b.create_return(&[two]);

    module.define_all_functions().unwrap();
    let code = code_of(&module, func);

    // The compare against zero fuses into test edi, edi.
    assert!(contains(&code, &[0x85, 0xff]), "missing test edi, edi: {code:02x?}");
    // No setcc was materialized; the compare feeds the jcc directly.
    assert!(!contains(&code, &[0x0f, 0x94]), "unexpected sete");
    // Some conditional jump is present (0F 80..8F rel32).
    assert!(
        code.windows(2)
            .any(|w| w[0] == 0x0f && (0x80..=0x8f).contains(&w[1])),
        "missing jcc in {code:02x?}"
    );
}

#[test]
fn local_store_load() {
    let mut module = linux_module();
    let func = module
        .declare_function(
            "slot",
            Signature::new(vec![], vec![types::I32]),
            Linkage::Public,
        )
        .unwrap();
    let mut b = FunctionBuilder::new(&mut module, func);
    let slot = b.create_local(4, 4);
    let five = b.create_signed_integer(5, 32);
    b.create_store(slot, five, 4, false);
    let loaded = b.create_load(slot, types::I32, 4, false);
    b.create_return(&[loaded]);
    module.define_all_functions().unwrap();

    let compiled = module.functions[func].compiled.as_ref().unwrap();
    // The 4-byte local rounds the frame up to one 16-byte unit.
    assert_eq!(compiled.stack_usage, 16);

    let code = &compiled.bytes;
    // sub rsp, 16
    assert!(contains(code, &[0x48, 0x83, 0xec, 0x10]), "missing sub rsp in {code:02x?}");
    // mov dword ptr [rbp-4], 5
    assert!(
        contains(code, &[0xc7, 0x45, 0xfc, 0x05, 0x00, 0x00, 0x00]),
        "missing store in {code:02x?}"
    );
    // mov eax, dword ptr [rbp-4]
    assert!(contains(code, &[0x8b, 0x45, 0xfc]), "missing load in {code:02x?}");
}

#[test]
fn loop_with_phi_takes_back_edge() {
    let mut module = linux_module();
    let func = module
        .declare_function(
            "count",
            Signature::new(vec![types::I32], vec![types::I32]),
            Linkage::Public,
        )
        .unwrap();
    let mut b = FunctionBuilder::new(&mut module, func);
    let n = b.param(0);
    let zero = b.create_signed_integer(0, 32);

    let header = b.create_region();
    let body = b.create_region();
    let done = b.create_region();

    // The counter phi merges the initial zero and the incremented value.
    let phi = {
        let func = b.func_mut();
        let phi = func.create_node(NodeKind::Phi, types::I32, &[header], NodeProps::None);
        func.add_input_late(phi, zero);
        phi
    };

    b.create_branch(header);

    b.switch_to_region(header);
    let again = b.create_cmp_ne(phi, n);
    b.create_conditional_branch(again, body, done);

    b.switch_to_region(body);
    let one = b.create_signed_integer(1, 32);
    let next = b.create_add(phi, one, ArithBehavior::None);
    b.func_mut().add_input_late(phi, next);
    b.create_branch(header);

    b.switch_to_region(done);
    b.create_return(&[phi]);

    module.define_all_functions().unwrap();
    let code = code_of(&module, func);

    // A conditional forward jump plus the unconditional back edge.
    assert!(
        code.windows(2)
            .any(|w| w[0] == 0x0f && (0x80..=0x8f).contains(&w[1])),
        "missing jcc in {code:02x?}"
    );
    assert!(contains(&code, &[0xe9]), "missing back-edge jmp in {code:02x?}");
}

#[test]
fn win64_overflow_parameters_come_from_the_home_area() {
    let mut module = windows_module();
    let func = module
        .declare_function(
            "fifth",
            Signature::new(vec![types::I64; 5], vec![types::I64]),
            Linkage::Public,
        )
        .unwrap();
    let mut b = FunctionBuilder::new(&mut module, func);
    let p4 = b.param(4);
    b.create_return(&[p4]);
    module.define_all_functions().unwrap();

    let code = code_of(&module, func);
    // mov r, [rbp + 0x30]: the fifth argument sits past the 32-byte shadow
    // space and the saved rbp/return address.
    let from_home = code.windows(3).any(|w| {
        w[0] == 0x8b && (w[1] & 0xc7) == 0x45 && w[2] == 0x30
    });
    assert!(from_home, "missing home-slot load in {code:02x?}");
}

#[test]
fn sysv_overflow_parameters_are_packed() {
    let mut module = linux_module();
    let func = module
        .declare_function(
            "seventh",
            Signature::new(vec![types::I64; 7], vec![types::I64]),
            Linkage::Public,
        )
        .unwrap();
    let mut b = FunctionBuilder::new(&mut module, func);
    let p6 = b.param(6);
    b.create_return(&[p6]);
    module.define_all_functions().unwrap();

    let code = code_of(&module, func);
    // The seventh argument is the first stack argument: [rbp + 16].
    let from_stack = code.windows(3).any(|w| {
        w[0] == 0x8b && (w[1] & 0xc7) == 0x45 && w[2] == 0x10
    });
    assert!(from_stack, "missing stack-argument load in {code:02x?}");
}

#[test]
fn call_external_generates_relocations() {
    let mut module = linux_module();
    let puts = module.declare_external("puts").unwrap();
    let rodata = module.rodata_section();
    let hi = module
        .declare_global("hi_str", Linkage::Private, rodata, 3, 1)
        .unwrap();
    module.define_global_bytes(hi, 0, b"hi\0".to_vec());

    let func = module
        .declare_function("say_hi", Signature::default(), Linkage::Public)
        .unwrap();
    let hi_sym = module.globals[hi].symbol;
    let mut b = FunctionBuilder::new(&mut module, func);
    let addr = b.create_symbol_address(hi_sym);
    b.create_call_external(
        puts,
        Signature::new(vec![types::PTR], vec![types::I32]),
        &[addr],
    );
    b.create_return(&[]);
    module.define_all_functions().unwrap();

    let compiled = module.functions[func].compiled.as_ref().unwrap();
    // One patch for the string address, one for the callee.
    assert_eq!(compiled.patches.len(), 2);
    // lea rdi, [rip + hi_str] ahead of call puts.
    assert!(
        contains(&compiled.bytes, &[0x48, 0x8d, 0x3d]),
        "missing rip-relative lea in {:02x?}",
        compiled.bytes
    );
    assert!(contains(&compiled.bytes, &[0xe8]), "missing call");

    let object = keel_object::write_object(&module).unwrap();
    // Both names survive into the string table.
    assert!(contains(&object, b"puts\0"));
    assert!(contains(&object, b"hi_str\0"));
    assert!(contains(&object, b".rela.text\0"));
}

#[test]
fn internal_calls_resolve_without_relocations() {
    let mut module = linux_module();
    let callee = module
        .declare_function("callee", Signature::default(), Linkage::Private)
        .unwrap();
    let caller = module
        .declare_function("caller", Signature::default(), Linkage::Public)
        .unwrap();

    let mut b = FunctionBuilder::new(&mut module, callee);
    b.create_return(&[]);
    let mut b = FunctionBuilder::new(&mut module, caller);
    b.create_call(callee, &[]);
    b.create_return(&[]);
    module.define_all_functions().unwrap();

    let object = keel_object::write_object(&module).unwrap();

    // The caller patch resolves in place: no .rela.text section appears.
    assert!(!contains(&object, b".rela.text\0"));

    // The resolved rel32 really lands on the callee: decode the call in the
    // caller's code region of the object.
    let caller_decl = &module.functions[caller];
    let callee_decl = &module.functions[callee];
    let text_offset = 64u32; // ELF header is 64 bytes; .text is laid out first
    let caller_code = &object[(text_offset + caller_decl.code_offset) as usize..]
        [..caller_decl.compiled.as_ref().unwrap().bytes.len()];
    let call_at = caller_code
        .iter()
        .position(|&b| b == 0xe8)
        .expect("call not found");
    let rel = i32::from_le_bytes(
        caller_code[call_at + 1..call_at + 5].try_into().unwrap(),
    );
    let next = caller_decl.code_offset as i64 + call_at as i64 + 5;
    assert_eq!(next + i64::from(rel), i64::from(callee_decl.code_offset));
}

#[test]
fn deterministic_compilation() {
    let build = || {
        let mut module = linux_module();
        let func = module
            .declare_function(
                "f",
                Signature::new(vec![types::I64, types::I64], vec![types::I64]),
                Linkage::Public,
            )
            .unwrap();
        let mut b = FunctionBuilder::new(&mut module, func);
        let x = b.param(0);
        let y = b.param(1);
        let sum = b.create_add(x, y, ArithBehavior::None);
        let prod = b.create_mul(sum, y, ArithBehavior::None);
        b.create_return(&[prod]);
        module.define_all_functions().unwrap();
        keel_object::write_object(&module).unwrap()
    };
    // Identical input modules produce byte-identical objects.
    assert_eq!(build(), build());
}

#[test]
fn coff_object_has_pdata_for_each_function() {
    let mut module = windows_module();
    let func = module
        .declare_function(
            "ident",
            Signature::new(vec![types::I32], vec![types::I32]),
            Linkage::Public,
        )
        .unwrap();
    let mut b = FunctionBuilder::new(&mut module, func);
    let x = b.param(0);
    b.create_return(&[x]);
    module.define_all_functions().unwrap();

    let object = keel_object::write_object(&module).unwrap();

    // COFF header: machine, section count.
    assert_eq!(u16::from_le_bytes([object[0], object[1]]), 0x8664);
    let nsections = u16::from_le_bytes([object[2], object[3]]) as usize;
    // Four base sections plus .pdata and .xdata.
    assert_eq!(nsections, 6);

    // Walk the section headers for .pdata and check the function range.
    let compiled = module.functions[func].compiled.as_ref().unwrap();
    let mut found = false;
    for i in 0..nsections {
        let hdr = &object[20 + i * 40..20 + (i + 1) * 40];
        if &hdr[..8] == b".pdata\0\0" {
            let size = u32::from_le_bytes(hdr[16..20].try_into().unwrap());
            let pos = u32::from_le_bytes(hdr[20..24].try_into().unwrap()) as usize;
            assert_eq!(size, 12, "one pdata record per function");
            let start = u32::from_le_bytes(object[pos..pos + 4].try_into().unwrap());
            let end = u32::from_le_bytes(object[pos + 4..pos + 8].try_into().unwrap());
            assert_eq!(start, 0);
            assert_eq!(end, compiled.bytes.len() as u32);
            found = true;
        }
    }
    assert!(found, ".pdata section missing");

    // The fixed timestamp keeps objects reproducible.
    assert_eq!(
        u32::from_le_bytes(object[4..8].try_into().unwrap()),
        1_056_582_000
    );
}
