//! Errors produced while lifting, slicing, rendering, and evaluating.

use thiserror::Error;

use crate::expr::VersionedRegister;

/// Build an [`Error::MalformedExpression`], recording where the inconsistency was detected.
macro_rules! malformed_error {
    ($msg:expr) => {
        $crate::error::Error::MalformedExpression {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::Error::MalformedExpression {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

pub(crate) use malformed_error;

/// Every error a single slicing or evaluation request can end with.
///
/// None of these are transient: they signal either an input shape outside of what is supported, or
/// an internal inconsistency. Requests are aborted, never retried. Note that a register that is
/// simply not mentioned (or never defined) in a function is _not_ an error; such lookups produce
/// empty results instead.
#[derive(Error, Debug)]
pub enum Error {
    /// An IL operand kind outside of the supported set was encountered by the builder.
    #[error("Unsupported IL operand `{kind}`: {text}")]
    UnsupportedOperand {
        /// The kind of the offending operand
        kind: &'static str,
        /// The offending operand, as text
        text: String,
    },

    /// An IL instruction that cannot be turned into an assignment.
    #[error("Unsupported IL instruction `{kind}`: {text}")]
    UnsupportedInstruction {
        /// The kind of the offending instruction
        kind: &'static str,
        /// The offending instruction, as text
        text: String,
    },

    /// An expression node that the evaluator has no semantics for.
    #[error("Cannot evaluate `{kind}` node: {text}")]
    UnsupportedNode {
        /// The kind of the offending node
        kind: &'static str,
        /// The offending node, as text
        text: String,
    },

    /// An expression could not be reduced to exactly one result. This is a bug in the reduction,
    /// not a problem with the data.
    #[error("Malformed expression - {file}:{line}: {message}")]
    MalformedExpression {
        /// What went wrong
        message: String,
        /// Source file in which the inconsistency was detected
        file: &'static str,
        /// Source line in which the inconsistency was detected
        line: u32,
    },

    /// A define-site chain led back to a register that was still being expanded.
    #[error("Cyclic dependency on {register} while expanding `{assignment}`")]
    CyclicDependency {
        register: VersionedRegister,
        assignment: String,
    },

    /// The architecture table has no entry for a register that needs one.
    #[error("Configuration error: {message}")]
    ConfigurationError { message: String },

    /// A stack-pointer relative read that does not match a known symbolic input.
    #[error("Unhandled stack-relative memory read at `{address}`")]
    UnhandledStackAccess { address: String },

    /// A register with neither a definition nor an initial value.
    #[error("Register {0} has no definition and no initial value")]
    UnboundRegister(VersionedRegister),

    /// A named symbolic input was referenced but never provided.
    #[error("Symbolic input `{0}` was not provided")]
    UnboundSymbol(String),

    /// The memory oracle could not serve a read.
    #[error("Memory read of {size} bytes at {address:#x} failed")]
    MemoryRead { address: u64, size: usize },

    /// An SSA register was defined more than once in a function.
    #[error("{register} is defined at both {first:#x} and {second:#x}")]
    DuplicateDefinition {
        register: String,
        first: u64,
        second: u64,
    },

    #[error("No instruction at {0:#x}")]
    NoInstructionAt(u64),

    #[error("No function contains {0:#x}")]
    NoFunctionContaining(u64),

    #[error("No function named `{0}`")]
    UnknownFunction(String),

    /// The textual listing could not be lifted.
    #[error("Parse error on line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
