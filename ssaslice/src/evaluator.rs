//! Concrete evaluation of expressions under an environment of register values, definitions, and
//! named symbolic inputs, with memory served by a read-only oracle.
//!
//! Evaluation never recurses natively: both the walk over an expression tree, and the chasing of
//! register definitions across assignments, run on a single explicit task stack. This keeps long
//! dependency chains (as commonly produced by obfuscators) from exhausting the native stack.

use crate::analysis_config::CONFIG;
use crate::arch::{bit_width, mask_for_bits, mask_for_size, Architecture};
use crate::containers::unordered::{UnorderedMap, UnorderedSet};
use crate::error::{malformed_error, Error, Result};
use crate::expr::{Assignment, BinaryOp, Expr, UnaryOp, VersionedRegister};
use crate::il::Function;
use crate::log::*;
use crate::slicer::slice_from_register_name;

use std::collections::BTreeMap;
use std::rc::Rc;

/// A source of memory contents.
///
/// Reads return signed integers (as read from the underlying image); the evaluator wraps them to
/// the unsigned value of the requested size. `None` signals the read cannot be served.
pub trait MemoryOracle {
    fn read_int(&self, address: u64, size: usize) -> Option<i64>;
}

impl<F: Fn(u64, usize) -> Option<i64>> MemoryOracle for F {
    fn read_int(&self, address: u64, size: usize) -> Option<i64> {
        self(address, size)
    }
}

/// Something that can be given a value in an [`Environment`].
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub enum Symbol {
    /// A (full) register version
    Register(VersionedRegister),
    /// A named symbolic input, eg: `"key"`
    Named(String),
}

#[derive(Clone, Debug)]
pub enum Binding {
    Concrete(u64),
    /// The value is that of the assignment, evaluated on demand
    Defined(Rc<Assignment>),
}

/// The bindings a single evaluation runs under.
#[derive(Clone, Default, Debug)]
pub struct Environment {
    bindings: UnorderedMap<Symbol, Binding>,
}

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a register version to a concrete value. Sub-registers are bound through their full
    /// register.
    pub fn bind_register(&mut self, register: VersionedRegister, value: u64) {
        self.bindings
            .insert(Symbol::Register(register), Binding::Concrete(value));
    }

    pub fn bind_named(&mut self, name: impl Into<String>, value: u64) {
        self.bindings
            .insert(Symbol::Named(name.into()), Binding::Concrete(value));
    }

    /// Bind the register defined by `assignment` (if any) to it.
    pub fn bind_definition(&mut self, assignment: Rc<Assignment>) {
        if let Some(dest) = assignment.defined_register() {
            self.bindings
                .insert(Symbol::Register(dest.clone()), Binding::Defined(assignment.clone()));
        }
    }

    /// An environment binding every register defined in `slice` to its definition.
    pub fn from_slice(slice: &[Assignment]) -> Self {
        let mut env = Self::new();
        for a in slice {
            env.bind_definition(Rc::new(a.clone()));
        }
        env
    }

    /// Combine with `initial`. Bindings of `initial` take precedence over those of `self`.
    pub fn merged_with(mut self, initial: &Environment) -> Self {
        for (k, v) in initial.bindings.iter() {
            self.bindings.insert(k.clone(), v.clone());
        }
        self
    }

    pub fn register(&self, register: &VersionedRegister) -> Option<&Binding> {
        self.bindings.get(&Symbol::Register(register.clone()))
    }

    pub fn named(&self, name: &str) -> Option<u64> {
        match self.bindings.get(&Symbol::Named(name.to_owned())) {
            Some(Binding::Concrete(v)) => Some(*v),
            Some(Binding::Defined(_)) | None => None,
        }
    }
}

/// A stack-pointer relative read that stands for a named symbolic input rather than memory, i.e.,
/// `ReadMem(sp + offset)` evaluates to the value of `symbol`.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct SymbolicStackRead {
    pub offset: u64,
    pub symbol: String,
}

/// The runtime key of the VM dispatcher lives at `esp + 0x28` on entry.
pub fn default_symbolic_stack_reads() -> Vec<SymbolicStackRead> {
    vec![SymbolicStackRead {
        offset: 0x28,
        symbol: "key".into(),
    }]
}

enum Task<'x> {
    Visit(&'x Expr),
    /// All operands of the expression have been evaluated
    Reduce(&'x Expr),
    /// Evaluate a full register version
    Resolve(VersionedRegister),
    /// Replace the full register value on top of the stack by some of its bits
    Extract { offset: u32, width: u32 },
    /// All inputs to the definition of `dest` have been evaluated
    Define {
        assignment: &'x Assignment,
        dest: VersionedRegister,
    },
}

/// Everything that stays fixed while evaluating.
struct Context<'a> {
    arch: &'a Architecture,
    env: Environment,
    oracle: &'a dyn MemoryOracle,
    stack_reads: Vec<SymbolicStackRead>,
}

/// Everything that is updated while evaluating.
#[derive(Default)]
struct Memo {
    cache: UnorderedMap<VersionedRegister, u64>,
    in_progress: UnorderedSet<VersionedRegister>,
}

/// An evaluator, bound to a single environment. Register values are memoized across calls (see
/// [`memoize_register_values`](crate::analysis_config::AnalysisConfig)).
pub struct Evaluator<'a> {
    ctx: Context<'a>,
    memo: Memo,
}

impl<'a> Evaluator<'a> {
    pub fn new(arch: &'a Architecture, env: Environment, oracle: &'a dyn MemoryOracle) -> Self {
        Self {
            ctx: Context {
                arch,
                env,
                oracle,
                stack_reads: default_symbolic_stack_reads(),
            },
            memo: Default::default(),
        }
    }

    /// Replace the table of symbolic stack reads.
    pub fn with_symbolic_stack_reads(mut self, stack_reads: Vec<SymbolicStackRead>) -> Self {
        self.ctx.stack_reads = stack_reads;
        self
    }

    pub fn evaluate(&mut self, expr: &Expr) -> Result<u64> {
        self.ctx.run(&mut self.memo, Task::Visit(expr))
    }

    /// Evaluate a register version. Sub-registers evaluate to their bits of the full register.
    pub fn evaluate_register(&mut self, register: &VersionedRegister) -> Result<u64> {
        self.evaluate(&Expr::Register(register.clone()))
    }
}

fn pop(values: &mut Vec<u64>) -> Result<u64> {
    values
        .pop()
        .ok_or_else(|| malformed_error!("value stack underflow"))
}

impl<'a> Context<'a> {
    /// Run `root` to completion. Definitions left half-evaluated by an error are forgotten, so that
    /// a later call reports the same error again rather than a cycle.
    fn run<'x>(&'x self, memo: &mut Memo, root: Task<'x>) -> Result<u64> {
        let res = self.run_tasks(memo, root);
        if res.is_err() {
            memo.in_progress = Default::default();
        }
        res
    }

    fn run_tasks<'x>(&'x self, memo: &mut Memo, root: Task<'x>) -> Result<u64> {
        let mut tasks: Vec<Task<'x>> = vec![root];
        let mut values: Vec<u64> = vec![];
        while let Some(task) = tasks.pop() {
            match task {
                Task::Visit(e) => self.visit(e, &mut tasks, &mut values)?,
                Task::Reduce(e) => {
                    let v = self.reduce(e, &mut values)?;
                    values.push(v);
                }
                Task::Resolve(reg) => {
                    if let Some(&v) = memo.cache.get(&reg) {
                        values.push(v);
                        continue;
                    }
                    match self.env.register(&reg) {
                        Some(Binding::Concrete(v)) => {
                            values.push(v & mask_for_size(self.arch.register_size(&reg.name)))
                        }
                        Some(Binding::Defined(a)) => {
                            if memo.in_progress.contains(&reg) {
                                return Err(Error::CyclicDependency {
                                    register: reg,
                                    assignment: a.to_string(),
                                });
                            }
                            memo.in_progress.insert(reg.clone());
                            tasks.push(Task::Define {
                                assignment: a.as_ref(),
                                dest: reg.clone(),
                            });
                            match a.as_ref() {
                                Assignment::FullRegister { src, .. } => tasks.push(Task::Visit(src)),
                                Assignment::PartialRegister { full, src, .. } => {
                                    let prev = full.previous().ok_or_else(|| {
                                        malformed_error!("partial write to version 0 of {}", full)
                                    })?;
                                    tasks.push(Task::Visit(src));
                                    tasks.push(Task::Resolve(prev));
                                }
                                Assignment::MemoryStore { .. } => {
                                    return Err(malformed_error!(
                                        "{} is bound to a store: {}",
                                        reg,
                                        a
                                    ))
                                }
                            }
                        }
                        None => return Err(Error::UnboundRegister(reg)),
                    }
                }
                Task::Extract { offset, width } => {
                    let v = pop(&mut values)?;
                    values.push((v >> offset) & mask_for_bits(width));
                }
                Task::Define { assignment, dest } => {
                    let full_mask = mask_for_size(self.arch.register_size(&dest.name));
                    let v = match assignment {
                        Assignment::FullRegister { .. } => pop(&mut values)? & full_mask,
                        Assignment::PartialRegister { sub, .. } => {
                            let src = pop(&mut values)?;
                            let prev = pop(&mut values)?;
                            let info = self.arch.sub_register(sub)?;
                            ((prev & !info.mask()) | ((src << info.bit_offset) & info.mask()))
                                & full_mask
                        }
                        Assignment::MemoryStore { .. } => {
                            return Err(malformed_error!("store defines no register: {}", assignment))
                        }
                    };
                    trace!("Evaluated register"; "register" => %dest, "value" => format!("{:#x}", v));
                    memo.in_progress.remove(&dest);
                    if CONFIG.memoize_register_values {
                        memo.cache.insert(dest, v);
                    }
                    values.push(v);
                }
            }
        }
        match (values.pop(), values.is_empty()) {
            (Some(v), true) => Ok(v),
            (v, _) => Err(malformed_error!(
                "evaluation left {} values",
                values.len() + v.map_or(0, |_| 1)
            )),
        }
    }

    /// The symbolic input a read at `address` stands for, if any.
    fn symbolic_stack_read(&self, address: &Expr) -> Option<&SymbolicStackRead> {
        let (reg, offset) = match address {
            Expr::Register(r) => (r, 0),
            Expr::Binary {
                op: BinaryOp::Add,
                lhs,
                rhs,
                ..
            } => match (lhs.as_ref(), rhs.as_ref()) {
                (Expr::Register(r), Expr::Constant { value, .. }) => (r, *value),
                _ => return None,
            },
            _ => return None,
        };
        if reg.name != self.arch.stack_pointer {
            return None;
        }
        self.stack_reads.iter().find(|p| p.offset == offset)
    }

    fn visit<'x>(
        &'x self,
        e: &'x Expr,
        tasks: &mut Vec<Task<'x>>,
        values: &mut Vec<u64>,
    ) -> Result<()> {
        match e {
            Expr::Constant { value, size } => values.push(value & mask_for_size(*size)),
            Expr::Register(r) => match self.arch.register(&r.name) {
                Some(info) if info.is_sub_register() => {
                    tasks.push(Task::Extract {
                        offset: info.bit_offset,
                        width: info.bit_width,
                    });
                    tasks.push(Task::Resolve(r.to_full(self.arch)));
                }
                _ => tasks.push(Task::Resolve(r.clone())),
            },
            Expr::MemoryRead { address, size } => {
                if let Some(p) = self.symbolic_stack_read(address) {
                    let v = self
                        .env
                        .named(&p.symbol)
                        .ok_or_else(|| Error::UnboundSymbol(p.symbol.clone()))?;
                    trace!("Symbolic stack read"; "address" => %address, "symbol" => &p.symbol);
                    values.push(v & mask_for_size(*size));
                } else if address
                    .registers()
                    .iter()
                    .any(|r| self.arch.is_stack_pointer(&r.name))
                {
                    return Err(Error::UnhandledStackAccess {
                        address: address.to_string(),
                    });
                } else {
                    tasks.push(Task::Reduce(e));
                    tasks.push(Task::Visit(address));
                }
            }
            Expr::Binary { lhs, rhs, .. } => {
                tasks.push(Task::Reduce(e));
                tasks.push(Task::Visit(rhs));
                tasks.push(Task::Visit(lhs));
            }
            Expr::Unary { operand, .. } | Expr::ByteSwap { operand, .. } => {
                tasks.push(Task::Reduce(e));
                tasks.push(Task::Visit(operand));
            }
            Expr::FlagBit { .. } => {
                return Err(Error::UnsupportedNode {
                    kind: e.kind(),
                    text: e.to_string(),
                })
            }
        }
        Ok(())
    }

    fn reduce(&self, e: &Expr, values: &mut Vec<u64>) -> Result<u64> {
        Ok(match e {
            Expr::Binary { op, size, .. } => {
                let bits = bit_width(*size)? as u64;
                let r = pop(values)?;
                let l = pop(values)?;
                let mask = mask_for_size(*size);
                let (l, r) = (l & mask, r & mask);
                match op {
                    BinaryOp::Add => l.wrapping_add(r) & mask,
                    BinaryOp::Sub => l.wrapping_sub(r) & mask,
                    BinaryOp::And => l & r,
                    BinaryOp::Or => l | r,
                    BinaryOp::Xor => l ^ r,
                    BinaryOp::Shl if r >= bits => 0,
                    BinaryOp::Shl => (l << r) & mask,
                    BinaryOp::Shr if r >= bits => 0,
                    BinaryOp::Shr => l >> r,
                    BinaryOp::Rol | BinaryOp::Ror if bits == 0 => 0,
                    BinaryOp::Rol => match r % bits {
                        0 => l,
                        r => ((l << r) | (l >> (bits - r))) & mask,
                    },
                    BinaryOp::Ror => match r % bits {
                        0 => l,
                        r => ((l >> r) | (l << (bits - r))) & mask,
                    },
                }
            }
            Expr::Unary { op, operand, size } => {
                bit_width(*size)?;
                bit_width(operand.size(self.arch))?;
                let v = pop(values)?;
                let mask = mask_for_size(*size);
                let operand_mask = mask_for_size(operand.size(self.arch));
                match op {
                    UnaryOp::Not => !v & mask,
                    UnaryOp::Neg => v.wrapping_neg() & mask,
                    UnaryOp::ZeroExtend => v & operand_mask & mask,
                    UnaryOp::SignExtend => {
                        let v = v & operand_mask;
                        let sign_bit = operand_mask & !(operand_mask >> 1);
                        if v & sign_bit != 0 {
                            (v | !operand_mask) & mask
                        } else {
                            v & mask
                        }
                    }
                }
            }
            Expr::MemoryRead { size, .. } => {
                bit_width(*size)?;
                let address = pop(values)?;
                let raw = self
                    .oracle
                    .read_int(address, *size)
                    .ok_or(Error::MemoryRead {
                        address,
                        size: *size,
                    })?;
                let v = (raw as u64) & mask_for_size(*size);
                trace!("Memory read"; "address" => format!("{:#x}", address), "size" => size, "value" => format!("{:#x}", v));
                v
            }
            Expr::ByteSwap { size, .. } => {
                let bits = bit_width(*size)?;
                let v = pop(values)? & mask_for_size(*size);
                if bits == 0 {
                    0
                } else {
                    v.swap_bytes() >> (64 - bits)
                }
            }
            Expr::Constant { .. } | Expr::Register(_) | Expr::FlagBit { .. } => {
                return Err(malformed_error!("`{}` has no operands to reduce", e.kind()))
            }
        })
    }
}

/// Compute the final value of each of `targets` (full register names) in `function`.
///
/// Each target is sliced back to its definitions, and evaluated under those definitions, together
/// with `initial_env` (whose bindings take precedence). A target that is never defined in the
/// function takes its value straight from `initial_env`.
pub fn evaluate_final_register_state(
    function: &Function,
    targets: &[&str],
    initial_env: &Environment,
    oracle: &dyn MemoryOracle,
    stack_reads: &[SymbolicStackRead],
) -> Result<BTreeMap<String, u64>> {
    let mut res = BTreeMap::new();
    for &target in targets {
        let slice = slice_from_register_name(function, target)?;
        let (env, root) = match slice.first().and_then(Assignment::defined_register) {
            Some(root) => (
                Environment::from_slice(&slice).merged_with(initial_env),
                root.clone(),
            ),
            None => (
                initial_env.clone(),
                function
                    .all_versions_of(target)
                    .last()
                    .map(VersionedRegister::from)
                    .unwrap_or_else(|| VersionedRegister::new(target, 0)),
            ),
        };
        let value = Evaluator::new(function.arch, env, oracle)
            .with_symbolic_stack_reads(stack_reads.to_vec())
            .evaluate_register(&root)?;
        debug!("Final register value"; "register" => %root, "value" => format!("{:#x}", value));
        res.insert(target.to_owned(), value);
    }
    Ok(res)
}
