//! Conversion of IL operand trees and instructions into the [expression model](crate::expr).

use crate::arch::Architecture;
use crate::error::{malformed_error, Error, Result};
use crate::expr::{Assignment, BinaryOp, Expr, UnaryOp};
use crate::il::{Instruction, InstructionKind, Operand, OperandOp};
use crate::log::*;

/// How an operator of the IL reduces into an expression node
#[derive(Clone, Copy, Debug)]
enum Shape {
    Binary(BinaryOp),
    Unary(UnaryOp),
    Load,
}

impl Shape {
    fn of(op: OperandOp) -> Option<Self> {
        use OperandOp::*;
        Some(match op {
            Add => Shape::Binary(BinaryOp::Add),
            Sub => Shape::Binary(BinaryOp::Sub),
            And => Shape::Binary(BinaryOp::And),
            Or => Shape::Binary(BinaryOp::Or),
            Xor => Shape::Binary(BinaryOp::Xor),
            Lsl => Shape::Binary(BinaryOp::Shl),
            Lsr => Shape::Binary(BinaryOp::Shr),
            Rol => Shape::Binary(BinaryOp::Rol),
            Ror => Shape::Binary(BinaryOp::Ror),
            Zx => Shape::Unary(UnaryOp::ZeroExtend),
            Sx => Shape::Unary(UnaryOp::SignExtend),
            Not => Shape::Unary(UnaryOp::Not),
            Neg => Shape::Unary(UnaryOp::Neg),
            Load => Shape::Load,
            Asr | Mul | DivU | DivS | ModU | ModS | LowPart | CmpE | CmpNe | CmpUlt | BoolToInt => {
                return None
            }
        })
    }

    fn arity(self) -> usize {
        match self {
            Shape::Binary(_) => 2,
            Shape::Unary(_) | Shape::Load => 1,
        }
    }
}

fn unsupported(operand: &Operand) -> Error {
    Error::UnsupportedOperand {
        kind: operand.kind(),
        text: operand.to_string(),
    }
}

/// Make sure `sub` is a sub-register that lives inside `full`.
fn check_sub_register(arch: &Architecture, sub: &str, full: &str) -> Result<()> {
    let info = arch.sub_register(sub)?;
    if info.full != full {
        return Err(Error::ConfigurationError {
            message: format!("`{}` lives in `{}`, not `{}`", sub, info.full, full),
        });
    }
    Ok(())
}

/// Build an expression out of an IL operand tree.
///
/// This runs in two passes, neither of which recurses: the first collects the nodes of the tree
/// in preorder (rejecting anything outside of the supported set), and the second replays them in
/// reverse (i.e., postorder), reducing each operator with the results of its operands.
pub fn build_expression(operand: &Operand, arch: &Architecture) -> Result<Expr> {
    let mut sources: Vec<&Operand> = vec![operand];
    let mut todo: Vec<&Operand> = vec![];
    while let Some(o) = sources.pop() {
        match o {
            Operand::Const { .. }
            | Operand::Reg { .. }
            | Operand::RegPartial { .. }
            | Operand::FlagBit { .. } => {}
            Operand::Op { op, operands, .. } => {
                if Shape::of(*op).is_none() {
                    return Err(unsupported(o));
                }
                sources.extend(operands.iter());
            }
            Operand::Flag { .. } | Operand::Unimplemented | Operand::Undefined => {
                return Err(unsupported(o));
            }
        }
        todo.push(o);
    }

    let mut output: Vec<Expr> = vec![];
    while let Some(o) = todo.pop() {
        let e = match o {
            Operand::Const { value, size } => Expr::constant(*value, *size),
            Operand::Reg { src, .. } => Expr::Register(src.into()),
            Operand::RegPartial { full_reg, sub, .. } => {
                check_sub_register(arch, sub, &full_reg.reg)?;
                Expr::register(sub.clone(), full_reg.version)
            }
            Operand::FlagBit { flag, bit, .. } => Expr::FlagBit {
                flag: flag.to_string(),
                bit: *bit,
            },
            Operand::Op { op, size, operands } => {
                let shape = Shape::of(*op).ok_or_else(|| unsupported(o))?;
                if operands.len() != shape.arity() {
                    return Err(malformed_error!(
                        "`{}` takes {} operands, got {}: {}",
                        op.mnemonic(),
                        shape.arity(),
                        operands.len(),
                        o
                    ));
                }
                if output.len() < shape.arity() {
                    return Err(malformed_error!(
                        "output stack underflow while reducing `{}`",
                        o
                    ));
                }
                let mut args = output.split_off(output.len() - shape.arity());
                match shape {
                    Shape::Binary(bop) => {
                        let rhs = args.pop();
                        let lhs = args.pop();
                        match (lhs, rhs) {
                            (Some(lhs), Some(rhs)) => Expr::binary(bop, lhs, rhs, *size),
                            _ => return Err(malformed_error!("missing operand for `{}`", o)),
                        }
                    }
                    Shape::Unary(uop) => match args.pop() {
                        Some(x) => Expr::unary(uop, x, *size),
                        None => return Err(malformed_error!("missing operand for `{}`", o)),
                    },
                    Shape::Load => match args.pop() {
                        Some(address) => Expr::MemoryRead {
                            address: Box::new(address),
                            size: *size,
                        },
                        None => return Err(malformed_error!("missing address for `{}`", o)),
                    },
                }
            }
            Operand::Flag { .. } | Operand::Unimplemented | Operand::Undefined => {
                return Err(unsupported(o));
            }
        };
        output.push(e);
    }

    match (output.pop(), output.is_empty()) {
        (Some(e), true) => Ok(e),
        (e, _) => Err(malformed_error!(
            "expected exactly one result, found {}",
            output.len() + e.map_or(0, |_| 1)
        )),
    }
}

/// Build an assignment out of a single IL instruction.
pub fn build_assignment(instruction: &Instruction, arch: &Architecture) -> Result<Assignment> {
    let unsupported_insn = || Error::UnsupportedInstruction {
        kind: instruction.kind.name(),
        text: instruction.to_string(),
    };
    let assignment = match &instruction.kind {
        InstructionKind::SetReg { dest, src } => Assignment::FullRegister {
            dest: dest.into(),
            src: build_expression(src, arch)?,
        },
        InstructionKind::SetRegPartial {
            full_reg,
            dest,
            src,
        } => {
            check_sub_register(arch, dest, &full_reg.reg)?;
            Assignment::PartialRegister {
                sub: dest.clone(),
                full: full_reg.into(),
                src: build_expression(src, arch)?,
            }
        }
        InstructionKind::Store { size, dest, src } => Assignment::MemoryStore {
            address: build_expression(dest, arch)?,
            src: build_expression(src, arch)?,
            size: *size,
        },
        InstructionKind::Intrinsic {
            outputs,
            intrinsic,
            params,
        } => match (intrinsic.as_str(), outputs.as_slice(), params.as_slice()) {
            ("bswap", [out], [param]) => Assignment::FullRegister {
                dest: out.into(),
                src: Expr::ByteSwap {
                    operand: Box::new(build_expression(param, arch)?),
                    size: arch.register_size(&out.reg),
                },
            },
            _ => return Err(unsupported_insn()),
        },
        InstructionKind::Phi { .. }
        | InstructionKind::Goto { .. }
        | InstructionKind::Jump { .. }
        | InstructionKind::Call { .. }
        | InstructionKind::Ret { .. }
        | InstructionKind::Nop => return Err(unsupported_insn()),
    };
    trace!("Built assignment";
           "machine_addr" => format_args!("{:#x}", instruction.address),
           "insn" => %instruction.kind,
           OptionalKV("dest", assignment.defined_register().map(|r| r.to_string())),
    );
    Ok(assignment)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::X86;
    use crate::il::SSARegister;

    fn reg(name: &str, version: usize) -> Operand {
        Operand::Reg {
            src: SSARegister::new(name, version),
            size: 4,
        }
    }

    fn op(op: OperandOp, operands: Vec<Operand>) -> Operand {
        Operand::Op {
            op,
            size: 4,
            operands,
        }
    }

    #[test]
    fn operand_order_is_preserved() {
        let e = build_expression(
            &op(
                OperandOp::Sub,
                vec![
                    reg("eax", 0),
                    op(OperandOp::Lsl, vec![reg("ebx", 1), Operand::Const { value: 3, size: 1 }]),
                ],
            ),
            &X86,
        )
        .unwrap();
        assert_eq!(e.to_string(), "Sub(eax#0, Shl(ebx#1, 0x3))");
    }

    #[test]
    fn unsupported_operators_are_rejected() {
        let err = build_expression(&op(OperandOp::Mul, vec![reg("eax", 0), reg("ebx", 0)]), &X86)
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedOperand { kind: "mul", .. }));

        let nested = op(OperandOp::Add, vec![reg("eax", 0), Operand::Undefined]);
        let err = build_expression(&nested, &X86).unwrap_err();
        assert!(matches!(err, Error::UnsupportedOperand { kind: "undef", .. }));
    }

    #[test]
    fn wrong_arity_is_malformed() {
        let err = build_expression(&op(OperandOp::Add, vec![reg("eax", 0)]), &X86).unwrap_err();
        assert!(matches!(err, Error::MalformedExpression { .. }));
    }

    #[test]
    fn sub_registers_keep_their_name() {
        let e = build_expression(
            &Operand::RegPartial {
                full_reg: SSARegister::new("eax", 3),
                sub: "ah".into(),
                size: 1,
            },
            &X86,
        )
        .unwrap();
        assert_eq!(e, Expr::register("ah", 3));

        let err = build_expression(
            &Operand::RegPartial {
                full_reg: SSARegister::new("ebx", 3),
                sub: "ah".into(),
                size: 1,
            },
            &X86,
        )
        .unwrap_err();
        assert!(matches!(err, Error::ConfigurationError { .. }));
    }

    #[test]
    fn bswap_intrinsic() {
        let insn = Instruction {
            address: 0x1000,
            kind: InstructionKind::Intrinsic {
                outputs: vec![SSARegister::new("edx", 1)],
                intrinsic: "bswap".into(),
                params: vec![reg("eax", 1)],
            },
        };
        let a = build_assignment(&insn, &X86).unwrap();
        assert_eq!(a.to_string(), "edx#1 = ByteSwap(eax#1)");

        let insn = Instruction {
            address: 0x1000,
            kind: InstructionKind::Phi {
                dest: SSARegister::new("eax", 3),
                sources: vec![SSARegister::new("eax", 1), SSARegister::new("eax", 2)],
            },
        };
        assert!(matches!(
            build_assignment(&insn, &X86),
            Err(Error::UnsupportedInstruction { kind: "phi", .. })
        ));
    }
}
