//! The expression model: value-typed trees that carry no references back into the IL.
//!
//! Expressions are produced by the [builder](crate::builder), ordered by the
//! [slicer](crate::slicer), and consumed by the [renderer](crate::render) and the
//! [evaluator](crate::evaluator). All walks over them use explicit stacks, so arbitrarily deep
//! trees are handled without exhausting the native stack.

use crate::arch::{mask_for_size, Architecture};
use crate::error::{malformed_error, Result};
use crate::il::SSARegister;

/// A reference to a specific SSA version of a register. Sub-registers keep their own name, and
/// the version of the full register they live in.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct VersionedRegister {
    pub name: String,
    pub version: usize,
}

impl VersionedRegister {
    pub fn new(name: impl Into<String>, version: usize) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }

    /// The version written just before this one, if any.
    pub fn previous(&self) -> Option<Self> {
        Some(Self {
            name: self.name.clone(),
            version: self.version.checked_sub(1)?,
        })
    }

    /// The same version of the full register that `self` lives in.
    pub fn to_full(&self, arch: &Architecture) -> Self {
        Self {
            name: arch.full_register_of(&self.name).to_owned(),
            version: self.version,
        }
    }

    pub fn to_ssa(&self) -> SSARegister {
        SSARegister::new(self.name.clone(), self.version)
    }
}

impl From<&SSARegister> for VersionedRegister {
    fn from(r: &SSARegister) -> Self {
        Self::new(r.reg.clone(), r.version)
    }
}

impl std::fmt::Display for VersionedRegister {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}#{}", self.name, self.version)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum BinaryOp {
    Add,
    Sub,
    And,
    Or,
    Xor,
    /// Rotate left within the size of the node
    Rol,
    /// Rotate right within the size of the node
    Ror,
    /// Logical shift left
    Shl,
    /// Logical shift right
    Shr,
}

impl BinaryOp {
    pub fn name(self) -> &'static str {
        match self {
            BinaryOp::Add => "Add",
            BinaryOp::Sub => "Sub",
            BinaryOp::And => "And",
            BinaryOp::Or => "Or",
            BinaryOp::Xor => "Xor",
            BinaryOp::Rol => "Rol",
            BinaryOp::Ror => "Ror",
            BinaryOp::Shl => "Shl",
            BinaryOp::Shr => "Shr",
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum UnaryOp {
    Not,
    Neg,
    ZeroExtend,
    SignExtend,
}

impl UnaryOp {
    pub fn name(self) -> &'static str {
        match self {
            UnaryOp::Not => "Not",
            UnaryOp::Neg => "Neg",
            UnaryOp::ZeroExtend => "ZeroExtend",
            UnaryOp::SignExtend => "SignExtend",
        }
    }
}

/// An expression tree. Sizes are in bytes.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Expr {
    /// An immediate, already masked to `size`
    Constant { value: u64, size: usize },
    Register(VersionedRegister),
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
        size: usize,
    },
    /// `size` is the size of the result, which for extensions differs from that of `operand`
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
        size: usize,
    },
    MemoryRead { address: Box<Expr>, size: usize },
    ByteSwap { operand: Box<Expr>, size: usize },
    /// A single flag bit. Flags are not modelled beyond this placeholder.
    FlagBit { flag: String, bit: usize },
}

impl Expr {
    /// A constant, with `value` masked down to `size` bytes.
    pub fn constant(value: u64, size: usize) -> Self {
        Expr::Constant {
            value: value & mask_for_size(size),
            size,
        }
    }

    pub fn register(name: impl Into<String>, version: usize) -> Self {
        Expr::Register(VersionedRegister::new(name, version))
    }

    pub fn binary(op: BinaryOp, lhs: Expr, rhs: Expr, size: usize) -> Self {
        Expr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
            size,
        }
    }

    pub fn unary(op: UnaryOp, operand: Expr, size: usize) -> Self {
        Expr::Unary {
            op,
            operand: Box::new(operand),
            size,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Expr::Constant { .. } => "Constant",
            Expr::Register(_) => "Register",
            Expr::Binary { op, .. } => op.name(),
            Expr::Unary { op, .. } => op.name(),
            Expr::MemoryRead { .. } => "ReadMem",
            Expr::ByteSwap { .. } => "ByteSwap",
            Expr::FlagBit { .. } => "FlagBit",
        }
    }

    /// Immediate sub-expressions, left to right.
    pub fn children(&self) -> Vec<&Expr> {
        match self {
            Expr::Binary { lhs, rhs, .. } => vec![lhs.as_ref(), rhs.as_ref()],
            Expr::Unary { operand, .. } | Expr::ByteSwap { operand, .. } => vec![operand.as_ref()],
            Expr::MemoryRead { address, .. } => vec![address.as_ref()],
            Expr::Constant { .. } | Expr::Register(_) | Expr::FlagBit { .. } => vec![],
        }
    }

    /// Size in bytes of the value this expression produces.
    pub fn size(&self, arch: &Architecture) -> usize {
        match self {
            Expr::Constant { size, .. }
            | Expr::Binary { size, .. }
            | Expr::Unary { size, .. }
            | Expr::MemoryRead { size, .. }
            | Expr::ByteSwap { size, .. } => *size,
            Expr::Register(r) => arch.register_size(&r.name),
            Expr::FlagBit { .. } => 1,
        }
    }

    /// Every register node, in left-to-right order. Duplicates are kept.
    pub fn registers(&self) -> Vec<&VersionedRegister> {
        let mut res = vec![];
        let mut todo = vec![self];
        while let Some(e) = todo.pop() {
            if let Expr::Register(r) = e {
                res.push(r);
            }
            todo.extend(e.children().into_iter().rev());
        }
        res
    }

    /// Bottom-up reduction of the tree. `reduce` is handed each node along with the already
    /// reduced values of its children (left to right), in postorder.
    pub fn fold<T>(&self, mut reduce: impl FnMut(&Expr, Vec<T>) -> Result<T>) -> Result<T> {
        let mut todo: Vec<(&Expr, bool)> = vec![(self, false)];
        let mut out: Vec<T> = vec![];
        while let Some((e, children_done)) = todo.pop() {
            if children_done {
                let arity = e.children().len();
                if out.len() < arity {
                    return Err(malformed_error!(
                        "{} needs {} operands, only {} available",
                        e.kind(),
                        arity,
                        out.len()
                    ));
                }
                let args = out.split_off(out.len() - arity);
                out.push(reduce(e, args)?);
            } else {
                todo.push((e, true));
                todo.extend(e.children().into_iter().rev().map(|c| (c, false)));
            }
        }
        match (out.pop(), out.is_empty()) {
            (Some(r), true) => Ok(r),
            (r, _) => Err(malformed_error!(
                "reduction left {} results",
                out.len() + r.map_or(0, |_| 1)
            )),
        }
    }
}

impl std::fmt::Display for Expr {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let s = self
            .fold(|e, args: Vec<String>| {
                Ok(match e {
                    Expr::Constant { value, .. } => format!("{:#x}", value),
                    Expr::Register(r) => r.to_string(),
                    Expr::Binary { op, .. } => format!("{}({}, {})", op.name(), args[0], args[1]),
                    Expr::Unary { op, size, .. } => format!("{}({}, {})", op.name(), args[0], size),
                    Expr::MemoryRead { size, .. } => format!("ReadMem({}, {})", args[0], size),
                    Expr::ByteSwap { .. } => format!("ByteSwap({})", args[0]),
                    Expr::FlagBit { flag, bit } => format!("FlagBit({}, {})", flag, bit),
                })
            })
            .map_err(|_| std::fmt::Error)?;
        write!(f, "{}", s)
    }
}

/// A single state change, built from one IL instruction.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Assignment {
    FullRegister { dest: VersionedRegister, src: Expr },
    /// Writes `src` into sub-register `sub`, producing version `full`. The remaining bits of `full`
    /// are those of its previous version.
    PartialRegister {
        sub: String,
        full: VersionedRegister,
        src: Expr,
    },
    MemoryStore {
        address: Expr,
        src: Expr,
        size: usize,
    },
}

impl Assignment {
    /// The full register version produced by this assignment. Stores produce none.
    pub fn defined_register(&self) -> Option<&VersionedRegister> {
        match self {
            Assignment::FullRegister { dest, .. } => Some(dest),
            Assignment::PartialRegister { full, .. } => Some(full),
            Assignment::MemoryStore { .. } => None,
        }
    }

    pub fn source(&self) -> &Expr {
        match self {
            Assignment::FullRegister { src, .. }
            | Assignment::PartialRegister { src, .. }
            | Assignment::MemoryStore { src, .. } => src,
        }
    }

    /// Every expression read by this assignment: the store address (if any), then the source.
    pub fn expressions(&self) -> Vec<&Expr> {
        match self {
            Assignment::MemoryStore { address, src, .. } => vec![address, src],
            Assignment::FullRegister { src, .. } | Assignment::PartialRegister { src, .. } => {
                vec![src]
            }
        }
    }
}

impl std::fmt::Display for Assignment {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Assignment::FullRegister { dest, src } => write!(f, "{} = {}", dest, src),
            Assignment::PartialRegister { sub, full, src } => {
                write!(f, "{}.{} = {}", full, sub, src)
            }
            Assignment::MemoryStore { address, src, .. } => write!(f, "[{}] = {}", address, src),
        }
    }
}
