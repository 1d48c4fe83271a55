use crate::error::Result;
use crate::evaluator::Environment;
use crate::expr::VersionedRegister;
use crate::il::Program;
use crate::memory::MemoryImage;

#[cfg(test)]
use crate::arch::X86;
#[cfg(test)]
use crate::error::Error;
#[cfg(test)]
use crate::evaluator::{default_symbolic_stack_reads, evaluate_final_register_state};
#[cfg(test)]
use crate::expr::Assignment;
#[cfg(test)]
use crate::slicer::{
    execution_order, referenced_registers, slice_all_memory_writes, slice_from_address,
    slice_from_register_name,
};

#[cfg(test)]
fn no_memory(_: u64, _: usize) -> Option<i64> {
    None
}

/// Lift a single function `f` at `0x1000`, whose body is `body`.
pub fn single_function_program(body: &str) -> Result<Program> {
    crate::lifter::lift_from(&format!(
        "PROGRAM\nname test\narch x86\n\nFUNCTIONS\n00001000 f\n{}",
        body
    ))
}

pub fn end_to_end_program() -> Result<Program> {
    single_function_program(
        "
    00001000 eax#1 = add.4(eax#0, 0x10:4)
    00001003 ebx#1 = xor.4(eax#1, 0x3:4)
    00001006 ecx#1 = 0x7:4
",
    )
}

pub fn partial_write_program() -> Result<Program> {
    single_function_program(
        "
    00001000 ebx#1.bl = xor.1(ebx#0.bl, eax#0.al)
",
    )
}

pub fn diamond_program() -> Result<Program> {
    single_function_program(
        "
    00001000 eax#1 = add.4(esi#0, 0x1:4)
    00001003 ebx#1 = xor.4(eax#1, 0x2:4)
    00001006 ecx#1 = add.4(eax#1, 0x3:4)
    00001009 edx#1 = sub.4(ebx#1, ecx#1)
",
    )
}

pub fn vm_enter_program() -> Result<Program> {
    crate::lifter::lift_from(include_str!("../tests/vm-enter.listing"))
}

/// Memory backing [`vm_enter_program`]: the first opcode at `0x406000`, and the handler table at
/// `0x405000`.
pub fn vm_enter_memory() -> MemoryImage {
    let mut bytes = vec![0u8; 0x7000];
    bytes[0x6000] = 0x9d;
    bytes[0x531c..0x5320].copy_from_slice(&0x1337u32.to_le_bytes());
    let mut image = MemoryImage::new();
    image.add_segment(0x400000, bytes);
    image
}

pub fn environment(inits: &[(&str, usize, u64)]) -> Environment {
    let mut env = Environment::new();
    for &(name, version, value) in inits {
        env.bind_register(VersionedRegister::new(name, version), value);
    }
    env
}

#[cfg(test)]
fn dests(slice: &[Assignment]) -> Vec<String> {
    slice
        .iter()
        .map(|a| match a.defined_register() {
            Some(r) => r.to_string(),
            None => "<store>".to_string(),
        })
        .collect()
}

#[cfg(test)]
fn eval_one(program: &Program, target: &str, env: &Environment) -> Result<u64> {
    let res = evaluate_final_register_state(
        &program.functions[0],
        &[target],
        env,
        &no_memory,
        &default_symbolic_stack_reads(),
    )?;
    Ok(res[target])
}

#[test]
fn end_to_end() {
    let prog = end_to_end_program().unwrap();
    let f = &prog.functions[0];

    let slice = slice_from_register_name(f, "ebx").unwrap();
    assert_eq!(dests(&slice), ["ebx#1", "eax#1"]);
    assert_eq!(dests(&execution_order(&slice)), ["eax#1", "ebx#1"]);

    let env = environment(&[("eax", 0, 5)]);
    assert_eq!(eval_one(&prog, "ebx", &env).unwrap(), 0x16);
}

#[test]
fn slicing_is_idempotent() {
    let prog = diamond_program().unwrap();
    let f = &prog.functions[0];
    let a = slice_from_register_name(f, "edx").unwrap();
    let b = slice_from_register_name(f, "edx").unwrap();
    assert_eq!(a, b);
    assert_eq!(a, slice_from_address(&prog, 0x1009).unwrap());
}

#[test]
fn slices_are_closed_and_topologically_ordered() {
    let prog = diamond_program().unwrap();
    let f = &prog.functions[0];
    let slice = slice_from_register_name(f, "edx").unwrap();

    // Each destination exactly once, shared dependency included
    let mut d = dests(&slice);
    assert_eq!(d.len(), 4);
    d.sort();
    d.dedup();
    assert_eq!(d, ["eax#1", "ebx#1", "ecx#1", "edx#1"]);

    // Every dependency defined in the function is in the slice, after its user
    for (i, a) in slice.iter().enumerate() {
        for r in referenced_registers(a, &X86) {
            if f.define_site_of(&r.to_ssa()).is_some() {
                let j = slice
                    .iter()
                    .position(|b| b.defined_register() == Some(&r))
                    .unwrap();
                assert!(j > i, "{} must come after {}", slice[j], a);
            }
        }
    }

    let env = environment(&[("esi", 0, 0x10)]);
    // (0x11 ^ 2) - (0x11 + 3)
    assert_eq!(eval_one(&prog, "edx", &env).unwrap(), 0xffff_ffff);
}

#[test]
fn partial_write_masking() {
    let prog = partial_write_program().unwrap();
    let slice = slice_from_register_name(&prog.functions[0], "ebx").unwrap();
    assert_eq!(
        crate::render::render_assignments(&slice, &X86).unwrap(),
        ["ebx_1 = ((0xffffff00 & ebx_0) | (0xff & ((0xff & ebx_0) ^ (0xff & eax_0))))"]
    );

    let env = environment(&[("ebx", 0, 0x1234_5678), ("eax", 0, 0xaa)]);
    assert_eq!(eval_one(&prog, "ebx", &env).unwrap(), 0x1234_56d2);
}

#[test]
fn high_byte_writes() {
    let prog = single_function_program(
        "
    00001000 eax#1 = 0x1234ff78:4
    00001005 eax#2.ah = add.1(eax#1.ah, 0x1:1)
    00001008 ecx#1 = zx.4(eax#2.ah)
",
    )
    .unwrap();
    let f = &prog.functions[0];

    let slice = slice_from_register_name(f, "eax").unwrap();
    assert_eq!(dests(&slice), ["eax#2", "eax#1"]);
    assert_eq!(
        crate::render::render_assignment(&slice[0], &X86).unwrap(),
        "eax_2 = ((0xffff00ff & eax_1) | (0xff00 & ((((0xff00 & eax_1) >> 8) + 0x1) << 8)))"
    );

    let env = Environment::new();
    assert_eq!(eval_one(&prog, "eax", &env).unwrap(), 0x1234_0078);
    assert_eq!(eval_one(&prog, "ecx", &env).unwrap(), 0);
}

#[test]
fn missing_registers_are_empty_slices() {
    let prog = end_to_end_program().unwrap();
    let f = &prog.functions[0];
    // Never mentioned
    assert!(slice_from_register_name(f, "edx").unwrap().is_empty());
    // Only ever read
    let prog = diamond_program().unwrap();
    assert!(slice_from_register_name(&prog.functions[0], "esi")
        .unwrap()
        .is_empty());

    // Evaluation of such registers falls back to the initial environment
    let env = environment(&[("esi", 0, 0x42)]);
    assert_eq!(eval_one(&prog, "esi", &env).unwrap(), 0x42);
    assert!(matches!(
        eval_one(&prog, "edi", &env),
        Err(Error::UnboundRegister(r)) if r == VersionedRegister::new("edi", 0)
    ));
}

#[test]
fn address_lookups() {
    let prog = end_to_end_program().unwrap();
    assert!(matches!(
        slice_from_address(&prog, 0x2000),
        Err(Error::NoFunctionContaining(0x2000))
    ));
    assert_eq!(
        dests(&slice_from_address(&prog, 0x1003).unwrap()),
        ["ebx#1", "eax#1"]
    );
}

#[test]
fn store_slices() {
    let prog = single_function_program(
        "
    00001000 esi#1 = add.4(esi#0, 0x8:4)
    00001003 eax#1 = load.4(esi#1)
    00001005 store.4(add.4(esi#1, 0x4:4), not.4(eax#1))
    00001008 ecx#1 = 0x1:4
",
    )
    .unwrap();
    let slice = slice_from_address(&prog, 0x1005).unwrap();
    assert_eq!(dests(&slice), ["<store>", "eax#1", "esi#1"]);
    assert_eq!(
        crate::render::render_assignment(&slice[0], &X86).unwrap(),
        "[(esi_1 + 0x4)] = not(eax_1, 4)"
    );
    assert_eq!(slice[0].to_string(), "[Add(esi#1, 0x4)] = Not(eax#1, 4)");
}

#[test]
fn cyclic_define_sites_are_fatal() {
    let prog = single_function_program(
        "
    00001000 eax#1 = add.4(ebx#1, 0x1:4)
    00001003 ebx#1 = eax#1
",
    )
    .unwrap();
    assert!(matches!(
        slice_from_register_name(&prog.functions[0], "ebx"),
        Err(Error::CyclicDependency { .. })
    ));
}

#[test]
fn unsupported_operators_abort_the_slice() {
    let prog = single_function_program(
        "
    00001000 eax#1 = mul.4(eax#0, 0x3:4)
    00001003 ebx#1 = add.4(eax#1, 0x1:4)
",
    )
    .unwrap();
    let f = &prog.functions[0];
    assert!(matches!(
        slice_from_register_name(f, "ebx"),
        Err(Error::UnsupportedOperand { kind: "mul", .. })
    ));
}

#[test]
fn flag_bits_fail_loudly() {
    let prog = single_function_program(
        "
    00001000 eax#1 = zx.4(flagbit.1(c#2, 0))
",
    )
    .unwrap();
    let slice = slice_from_register_name(&prog.functions[0], "eax").unwrap();
    assert_eq!(
        crate::render::render_assignments(&slice, &X86).unwrap(),
        ["eax_1 = zx(flag_bit(c#2, 0), 4)"]
    );
    assert!(matches!(
        eval_one(&prog, "eax", &Environment::new()),
        Err(Error::UnsupportedNode { kind: "FlagBit", .. })
    ));
}

#[test]
fn symbolic_stack_reads() {
    let prog = single_function_program(
        "
    00001000 eax#1 = load.4(add.4(esp#0, 0x28:4))
    00001004 ecx#1 = load.4(add.4(esp#0, 0x2c:4))
    00001008 edx#1 = load.4(sub.4(esp#0, 0x4:4))
",
    )
    .unwrap();
    let mut env = environment(&[("esp", 0, 0xffff_0000)]);
    env.bind_named("key", 0xcafe_babe);
    assert_eq!(eval_one(&prog, "eax", &env).unwrap(), 0xcafe_babe);
    assert!(matches!(
        eval_one(&prog, "ecx", &env),
        Err(Error::UnhandledStackAccess { .. })
    ));
    assert!(matches!(
        eval_one(&prog, "edx", &env),
        Err(Error::UnhandledStackAccess { .. })
    ));
}

#[test]
fn oracle_reads_are_wrapped() {
    let prog = single_function_program(
        "
    00001000 eax#1 = load.4(add.4(esi#0, 0x4:4))
    00001004 ecx#1 = sx.4(load.1(esi#0))
",
    )
    .unwrap();
    let env = environment(&[("esi", 0, 0x2000)]);
    let oracle = |address: u64, _size: usize| -> Option<i64> {
        match address {
            0x2000 => Some(-128),
            0x2004 => Some(-1),
            _ => None,
        }
    };
    let res = evaluate_final_register_state(
        &prog.functions[0],
        &["eax", "ecx"],
        &env,
        &oracle,
        &default_symbolic_stack_reads(),
    )
    .unwrap();
    assert_eq!(res["eax"], 0xffff_ffff);
    assert_eq!(res["ecx"], 0xffff_ff80);
}

#[test]
fn operand_order_is_preserved_end_to_end() {
    let prog = single_function_program(
        "
    00001000 eax#1 = sub.4(ecx#0, edx#0)
    00001002 ebx#1 = lsr.4(eax#1, ecx#0)
    00001004 esi#1 = ror.4(ebx#1, 0x4:1)
",
    )
    .unwrap();
    let env = environment(&[("ecx", 0, 2), ("edx", 0, 0x102)]);
    // (2 - 0x102) = 0xffffff00; >> 2 = 0x3fffffc0; ror 4 = 0x03fffffc
    assert_eq!(eval_one(&prog, "eax", &env).unwrap(), 0xffff_ff00);
    assert_eq!(eval_one(&prog, "ebx", &env).unwrap(), 0x3fff_ffc0);
    assert_eq!(eval_one(&prog, "esi", &env).unwrap(), 0x03ff_fffc);
}

#[test]
fn deeply_nested_expressions() {
    use crate::il::{Operand, OperandOp, SSARegister};
    const DEPTH: u64 = 3000;

    let mut operand = Operand::Reg {
        src: SSARegister::new("eax", 0),
        size: 4,
    };
    for _ in 0..DEPTH {
        operand = Operand::Op {
            op: OperandOp::Add,
            size: 4,
            operands: vec![operand, Operand::Const { value: 1, size: 4 }],
        };
    }
    let expr = crate::builder::build_expression(&operand, &X86).unwrap();
    assert_eq!(expr.registers().len(), 1);

    let env = environment(&[("eax", 0, 10)]);
    let mut evaluator = crate::evaluator::Evaluator::new(&X86, env, &no_memory);
    assert_eq!(evaluator.evaluate(&expr).unwrap(), 10 + DEPTH);

    let text = crate::render::render_expression(&expr, &X86).unwrap();
    assert!(text.starts_with("((((("));
    assert!(text.ends_with("+ 0x1)"));
}

#[test]
fn long_definition_chains() {
    let body: String = (1..=2000)
        .map(|i| format!("    {:08x} eax#{} = add.4(eax#{}, 0x1:4)\n", 0x1000 + i, i, i - 1))
        .collect();
    let prog = single_function_program(&body).unwrap();
    let slice = slice_from_register_name(&prog.functions[0], "eax").unwrap();
    assert_eq!(slice.len(), 2000);
    let env = environment(&[("eax", 0, 0xffff_fff0)]);
    assert_eq!(eval_one(&prog, "eax", &env).unwrap(), 2000 - 0x10);
}

#[test]
fn memory_write_scan() {
    let prog = vm_enter_program().unwrap();
    let f = prog.function_named("vm_entry").unwrap();
    let writes = slice_all_memory_writes(f).unwrap();
    assert_eq!(writes.len(), 8);
    assert_eq!(dests(&writes[0]), ["<store>", "esp#1"]);
    assert_eq!(
        crate::render::render_assignments(&writes[7][..1], &X86).unwrap(),
        ["[esp_8] = 0x0"]
    );
    assert_eq!(writes[7].len(), 9);

    let prog = end_to_end_program().unwrap();
    assert!(slice_all_memory_writes(&prog.functions[0])
        .unwrap()
        .is_empty());
}

#[test]
fn vm_entry_state() {
    let prog = vm_enter_program().unwrap();
    let f = prog.function_named("vm_entry").unwrap();
    let state =
        crate::vm_entry::evaluate_vm_entry(f, 0x7f5a_9c41, &vm_enter_memory()).unwrap();
    assert_eq!(state.vip(), Some(0x0040_6001));
    assert_eq!(state.vsp(), Some(0xfffe_ffe0));
    assert_eq!(state.context(), Some(0xfffe_ff20));
    assert_eq!(state.handler(), Some(0x0040_1337));
    assert_eq!(state.rolling_key(), Some(0x5a1a_3a9d));

    // A different key decrypts to an unmapped virtual instruction pointer
    assert!(matches!(
        crate::vm_entry::evaluate_vm_entry(f, 0, &vm_enter_memory()),
        Err(Error::MemoryRead { .. })
    ));
}

#[test]
fn slice_graph() {
    let prog = diamond_program().unwrap();
    let slice = slice_from_register_name(&prog.functions[0], "edx").unwrap();
    let dot = crate::graph::generate_slice_dot(&slice, &X86).unwrap();
    assert!(dot.starts_with("digraph Slice {"));
    // edx#1, ecx#1, ebx#1, eax#1; the last reads the input esi#0
    assert!(dot.contains("a0 -> a1"));
    assert!(dot.contains("a0 -> a2"));
    assert!(dot.contains("a2 -> a3"));
    assert!(dot.contains("a3 -> in0"));
    assert!(dot.contains("in0"));
    assert!(dot.contains("esi#0"));
}

#[test]
fn oversized_operands_are_rejected_when_lifting() {
    for body in [
        "    00001000 eax#1 = lsl.16(eax#0, 0x40:16)\n",
        "    00001000 eax#1 = 0x1:4000000000000000000\n",
        "    00001000 store.3(esi#0, eax#0)\n",
    ] {
        assert!(
            matches!(single_function_program(body), Err(Error::Parse { line: 7, .. })),
            "{}",
            body
        );
    }
}
