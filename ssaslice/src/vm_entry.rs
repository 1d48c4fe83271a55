//! Recovery of the register state a VM dispatcher sets up on entry, for a given runtime key.

use crate::error::Result;
use crate::evaluator::{
    default_symbolic_stack_reads, evaluate_final_register_state, Environment, MemoryOracle,
};
use crate::expr::VersionedRegister;
use crate::il::Function;
use crate::log::*;

use std::collections::BTreeMap;

/// Stack pointer value assumed on entry to the dispatcher.
pub const INITIAL_STACK_POINTER: u64 = 0xFFFF_0000;

/// The registers through which the dispatcher hands state over to its handlers.
pub const VM_REGISTERS: [&str; 5] = ["edi", "esp", "ebp", "ebx", "esi"];

/// Final values of the dispatcher registers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VmEntryState {
    pub registers: BTreeMap<String, u64>,
}

impl VmEntryState {
    fn get(&self, reg: &str) -> Option<u64> {
        self.registers.get(reg).copied()
    }

    /// The virtual instruction pointer (`esi`)
    pub fn vip(&self) -> Option<u64> {
        self.get("esi")
    }

    /// The virtual stack pointer (`ebp`)
    pub fn vsp(&self) -> Option<u64> {
        self.get("ebp")
    }

    /// The VM context, i.e., the virtual register file (`esp`)
    pub fn context(&self) -> Option<u64> {
        self.get("esp")
    }

    /// Address of the first handler (`edi`)
    pub fn handler(&self) -> Option<u64> {
        self.get("edi")
    }

    /// The rolling decryption key (`ebx`)
    pub fn rolling_key(&self) -> Option<u64> {
        self.get("ebx")
    }
}

impl std::fmt::Display for VmEntryState {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        for (role, reg) in [
            ("vip", "esi"),
            ("vsp", "ebp"),
            ("context", "esp"),
            ("handler", "edi"),
            ("rolling key", "ebx"),
        ] {
            if let Some(v) = self.registers.get(reg) {
                writeln!(f, "{:>12} ({}) = {:#010x}", role, reg, v)?;
            }
        }
        Ok(())
    }
}

/// Evaluate the dispatcher `function` for runtime `key`, with memory served by `oracle`.
pub fn evaluate_vm_entry(
    function: &Function,
    key: u64,
    oracle: &dyn MemoryOracle,
) -> Result<VmEntryState> {
    let mut env = Environment::new();
    env.bind_named("key", key);
    env.bind_register(
        VersionedRegister::new(function.arch.stack_pointer, 0),
        INITIAL_STACK_POINTER,
    );
    info!("Evaluating VM entry"; "function" => &function.name, "key" => format!("{:#x}", key));
    let registers = evaluate_final_register_state(
        function,
        &VM_REGISTERS,
        &env,
        oracle,
        &default_symbolic_stack_reads(),
    )?;
    Ok(VmEntryState { registers })
}
