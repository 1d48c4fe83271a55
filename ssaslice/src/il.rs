//! The SSA intermediate language the analyses consume.
//!
//! This is a low-level, register-based IL in SSA form: every write to a register produces a fresh
//! version of it. Operands are trees (an instruction such as `eax#2 = add.4(eax#1, 0x10:4)` carries
//! its whole source expression), and each register version has exactly one defining instruction
//! within a function, which is what makes the define-site lookups below total functions.

use crate::arch::Architecture;
use crate::containers::unordered::UnorderedMap;
use crate::error::{Error, Result};
use itertools::Itertools;

/// A single SSA version of a register.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct SSARegister {
    pub reg: String,
    pub version: usize,
}

impl SSARegister {
    pub fn new(reg: impl Into<String>, version: usize) -> Self {
        Self {
            reg: reg.into(),
            version,
        }
    }
}

impl std::fmt::Display for SSARegister {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}#{}", self.reg, self.version)
    }
}

/// A single SSA version of a flag.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct SSAFlag {
    pub flag: String,
    pub version: usize,
}

impl std::fmt::Display for SSAFlag {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}#{}", self.flag, self.version)
    }
}

/// Operators that appear inside operand trees.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub enum OperandOp {
    /// Wrapping sum
    Add,
    /// Wrapping difference
    Sub,
    And,
    Or,
    Xor,
    /// Logical shift left
    Lsl,
    /// Logical shift right
    Lsr,
    /// Arithmetic shift right
    Asr,
    /// Rotate left within the operand size
    Rol,
    /// Rotate right within the operand size
    Ror,
    Mul,
    DivU,
    DivS,
    ModU,
    ModS,
    /// Zero extend to the operand size
    Zx,
    /// Sign extend to the operand size
    Sx,
    /// Bitwise complement
    Not,
    /// Two's complement negation
    Neg,
    /// Truncate to the operand size
    LowPart,
    /// Read `size` bytes of memory at the address given by the sole operand
    Load,
    CmpE,
    CmpNe,
    CmpUlt,
    BoolToInt,
}

impl OperandOp {
    pub fn mnemonic(self) -> &'static str {
        match self {
            OperandOp::Add => "add",
            OperandOp::Sub => "sub",
            OperandOp::And => "and",
            OperandOp::Or => "or",
            OperandOp::Xor => "xor",
            OperandOp::Lsl => "lsl",
            OperandOp::Lsr => "lsr",
            OperandOp::Asr => "asr",
            OperandOp::Rol => "rol",
            OperandOp::Ror => "ror",
            OperandOp::Mul => "mul",
            OperandOp::DivU => "divu",
            OperandOp::DivS => "divs",
            OperandOp::ModU => "modu",
            OperandOp::ModS => "mods",
            OperandOp::Zx => "zx",
            OperandOp::Sx => "sx",
            OperandOp::Not => "not",
            OperandOp::Neg => "neg",
            OperandOp::LowPart => "low_part",
            OperandOp::Load => "load",
            OperandOp::CmpE => "cmp_e",
            OperandOp::CmpNe => "cmp_ne",
            OperandOp::CmpUlt => "cmp_ult",
            OperandOp::BoolToInt => "bool_to_int",
        }
    }

    pub fn from_mnemonic(m: &str) -> Option<Self> {
        use OperandOp::*;
        [
            Add, Sub, And, Or, Xor, Lsl, Lsr, Asr, Rol, Ror, Mul, DivU, DivS, ModU, ModS, Zx, Sx,
            Not, Neg, LowPart, Load, CmpE, CmpNe, CmpUlt, BoolToInt,
        ]
        .into_iter()
        .find(|op| op.mnemonic() == m)
    }
}

/// An operand tree.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Operand {
    /// Immediate value of `size` bytes
    Const { value: u64, size: usize },
    /// A whole SSA register
    Reg { src: SSARegister, size: usize },
    /// A sub-register `sub` of the (versioned) full register `full_reg`
    RegPartial {
        full_reg: SSARegister,
        sub: String,
        size: usize,
    },
    /// An operator applied to `operands`, producing a value of `size` bytes
    Op {
        op: OperandOp,
        size: usize,
        operands: Vec<Operand>,
    },
    /// Bit `bit` of `flag`
    FlagBit {
        flag: SSAFlag,
        bit: usize,
        size: usize,
    },
    /// A whole flag
    Flag { flag: SSAFlag },
    /// The lifter did not know what the machine instruction computes
    Unimplemented,
    /// The value is architecturally undefined
    Undefined,
}

impl Operand {
    /// A short name for the kind of this operand, used for diagnostics
    pub fn kind(&self) -> &'static str {
        match self {
            Operand::Const { .. } => "const",
            Operand::Reg { .. } => "reg",
            Operand::RegPartial { .. } => "reg_partial",
            Operand::Op { op, .. } => op.mnemonic(),
            Operand::FlagBit { .. } => "flagbit",
            Operand::Flag { .. } => "flag",
            Operand::Unimplemented => "unimpl",
            Operand::Undefined => "undef",
        }
    }

    /// Every SSA register mentioned in this operand tree (partial references report their full
    /// register).
    pub fn registers(&self) -> Vec<&SSARegister> {
        let mut res = vec![];
        let mut todo = vec![self];
        while let Some(o) = todo.pop() {
            match o {
                Operand::Reg { src, .. } => res.push(src),
                Operand::RegPartial { full_reg, .. } => res.push(full_reg),
                Operand::Op { operands, .. } => todo.extend(operands.iter()),
                Operand::Const { .. }
                | Operand::FlagBit { .. }
                | Operand::Flag { .. }
                | Operand::Unimplemented
                | Operand::Undefined => {}
            }
        }
        res
    }
}

impl std::fmt::Display for Operand {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Operand::Const { value, size } => write!(f, "{:#x}:{}", value, size),
            Operand::Reg { src, .. } => write!(f, "{}", src),
            Operand::RegPartial { full_reg, sub, .. } => write!(f, "{}.{}", full_reg, sub),
            Operand::Op { op, size, operands } => write!(
                f,
                "{}.{}({})",
                op.mnemonic(),
                size,
                operands.iter().join(", ")
            ),
            Operand::FlagBit { flag, bit, size } => write!(f, "flagbit.{}({}, {})", size, flag, bit),
            Operand::Flag { flag } => write!(f, "flag({})", flag),
            Operand::Unimplemented => write!(f, "unimpl"),
            Operand::Undefined => write!(f, "undef"),
        }
    }
}

/// What an IL instruction does.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum InstructionKind {
    /// `dest = src`
    SetReg { dest: SSARegister, src: Operand },
    /// Write `src` into sub-register `dest`, producing version `full_reg` of the full register.
    /// The remaining bits of the full register are those of its previous version.
    SetRegPartial {
        full_reg: SSARegister,
        dest: String,
        src: Operand,
    },
    /// Write `size` bytes of `src` to memory at `dest`
    Store {
        size: usize,
        dest: Operand,
        src: Operand,
    },
    /// An architecture-specific intrinsic, eg: `bswap`
    Intrinsic {
        outputs: Vec<SSARegister>,
        intrinsic: String,
        params: Vec<Operand>,
    },
    Phi {
        dest: SSARegister,
        sources: Vec<SSARegister>,
    },
    /// Direct branch to a machine address
    Goto { target: u64 },
    /// Indirect branch
    Jump { dest: Operand },
    Call { dest: Operand },
    Ret { dest: Operand },
    Nop,
}

impl InstructionKind {
    pub fn name(&self) -> &'static str {
        match self {
            InstructionKind::SetReg { .. } => "set_reg",
            InstructionKind::SetRegPartial { .. } => "set_reg_partial",
            InstructionKind::Store { .. } => "store",
            InstructionKind::Intrinsic { .. } => "intrinsic",
            InstructionKind::Phi { .. } => "phi",
            InstructionKind::Goto { .. } => "goto",
            InstructionKind::Jump { .. } => "jump",
            InstructionKind::Call { .. } => "call",
            InstructionKind::Ret { .. } => "ret",
            InstructionKind::Nop => "nop",
        }
    }

    /// The SSA registers written by this instruction
    pub fn defined_registers(&self) -> Vec<&SSARegister> {
        match self {
            InstructionKind::SetReg { dest, .. } => vec![dest],
            InstructionKind::SetRegPartial { full_reg, .. } => vec![full_reg],
            InstructionKind::Intrinsic { outputs, .. } => outputs.iter().collect(),
            InstructionKind::Phi { dest, .. } => vec![dest],
            InstructionKind::Store { .. }
            | InstructionKind::Goto { .. }
            | InstructionKind::Jump { .. }
            | InstructionKind::Call { .. }
            | InstructionKind::Ret { .. }
            | InstructionKind::Nop => vec![],
        }
    }

    /// The SSA registers read by this instruction
    pub fn used_registers(&self) -> Vec<&SSARegister> {
        match self {
            InstructionKind::SetReg { src, .. } | InstructionKind::SetRegPartial { src, .. } => {
                src.registers()
            }
            InstructionKind::Store { dest, src, .. } => {
                let mut r = dest.registers();
                r.extend(src.registers());
                r
            }
            InstructionKind::Intrinsic { params, .. } => {
                params.iter().flat_map(Operand::registers).collect()
            }
            InstructionKind::Phi { sources, .. } => sources.iter().collect(),
            InstructionKind::Jump { dest }
            | InstructionKind::Call { dest }
            | InstructionKind::Ret { dest } => dest.registers(),
            InstructionKind::Goto { .. } | InstructionKind::Nop => vec![],
        }
    }
}

impl std::fmt::Display for InstructionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            InstructionKind::SetReg { dest, src } => write!(f, "{} = {}", dest, src),
            InstructionKind::SetRegPartial {
                full_reg,
                dest,
                src,
            } => write!(f, "{}.{} = {}", full_reg, dest, src),
            InstructionKind::Store { size, dest, src } => {
                write!(f, "store.{}({}, {})", size, dest, src)
            }
            InstructionKind::Intrinsic {
                outputs,
                intrinsic,
                params,
            } => write!(
                f,
                "{} = intrinsic {}({})",
                outputs.iter().join(", "),
                intrinsic,
                params.iter().join(", ")
            ),
            InstructionKind::Phi { dest, sources } => {
                write!(f, "{} = phi({})", dest, sources.iter().join(", "))
            }
            InstructionKind::Goto { target } => write!(f, "goto {:#x}", target),
            InstructionKind::Jump { dest } => write!(f, "jump({})", dest),
            InstructionKind::Call { dest } => write!(f, "call({})", dest),
            InstructionKind::Ret { dest } => write!(f, "ret({})", dest),
            InstructionKind::Nop => write!(f, "nop"),
        }
    }
}

/// An IL instruction, tagged with the address of the machine instruction it was lifted from. A
/// machine instruction may lift to several IL instructions sharing one address.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Instruction {
    pub address: u64,
    pub kind: InstructionKind,
}

impl std::fmt::Display for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:08x} {}", self.address, self.kind)
    }
}

/// A function in SSA form.
#[derive(Debug)]
pub struct Function {
    pub name: String,
    pub entry_point: u64,
    pub arch: &'static Architecture,
    instructions: Vec<Instruction>,
    /// Index (into `instructions`) of the definition of each SSA register
    definitions: UnorderedMap<SSARegister, usize>,
}

impl Function {
    /// Construct a function, checking that no SSA register is defined twice.
    pub fn new(
        name: impl Into<String>,
        entry_point: u64,
        arch: &'static Architecture,
        instructions: Vec<Instruction>,
    ) -> Result<Self> {
        let mut definitions: UnorderedMap<SSARegister, usize> = Default::default();
        for (i, ins) in instructions.iter().enumerate() {
            for r in ins.kind.defined_registers() {
                if let Some(&prev) = definitions.get(r) {
                    return Err(Error::DuplicateDefinition {
                        register: r.to_string(),
                        first: instructions[prev].address,
                        second: ins.address,
                    });
                }
                definitions.insert(r.clone(), i);
            }
        }
        Ok(Self {
            name: name.into(),
            entry_point,
            arch,
            instructions,
            definitions,
        })
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    /// The instruction defining `register`, if any. Registers without a definition (eg: version 0
    /// of anything, holding the value at function entry) are inputs to the function.
    pub fn define_site_of(&self, register: &SSARegister) -> Option<&Instruction> {
        self.definitions
            .get(register)
            .map(|&i| &self.instructions[i])
    }

    /// All versions of the register `name` that are defined or used in this function, in
    /// increasing order of version.
    pub fn all_versions_of(&self, name: &str) -> Vec<SSARegister> {
        self.instructions
            .iter()
            .flat_map(|ins| {
                ins.kind
                    .defined_registers()
                    .into_iter()
                    .chain(ins.kind.used_registers())
            })
            .filter(|r| r.reg == name)
            .cloned()
            .sorted()
            .dedup()
            .collect()
    }

    /// The first IL instruction lifted from the machine instruction at `address`
    pub fn instruction_at(&self, address: u64) -> Option<&Instruction> {
        self.instructions.iter().find(|i| i.address == address)
    }

    pub fn contains(&self, address: u64) -> bool {
        self.instruction_at(address).is_some()
    }
}

/// A whole lifted program.
#[derive(Debug)]
pub struct Program {
    pub name: String,
    pub arch: &'static Architecture,
    pub functions: Vec<Function>,
}

impl Program {
    pub fn function_containing(&self, address: u64) -> Option<&Function> {
        self.functions.iter().find(|f| f.contains(address))
    }

    pub fn function_named(&self, name: &str) -> Result<&Function> {
        self.functions
            .iter()
            .find(|f| f.name == name)
            .ok_or_else(|| Error::UnknownFunction(name.to_owned()))
    }

    pub fn instruction_at(&self, address: u64) -> Option<&Instruction> {
        self.function_containing(address)?.instruction_at(address)
    }
}
