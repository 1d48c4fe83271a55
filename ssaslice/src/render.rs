//! Human-readable rendering of assignments, with sub-register aliasing made explicit through masks
//! and shifts.

use crate::arch::{bit_width, mask_for_bits, mask_for_size, Architecture};
use crate::error::{malformed_error, Error, Result};
use crate::expr::{Assignment, BinaryOp, Expr, UnaryOp, VersionedRegister};

fn register_text(name: &str, version: usize) -> String {
    format!("{}_{}", name, version)
}

fn binary_symbol(op: BinaryOp) -> Option<&'static str> {
    match op {
        BinaryOp::Add => Some("+"),
        BinaryOp::Sub => Some("-"),
        BinaryOp::And => Some("&"),
        BinaryOp::Or => Some("|"),
        BinaryOp::Xor => Some("^"),
        BinaryOp::Shl => Some("<<"),
        BinaryOp::Shr => Some(">>"),
        BinaryOp::Rol | BinaryOp::Ror => None,
    }
}

fn unary_name(op: UnaryOp) -> &'static str {
    match op {
        UnaryOp::Not => "not",
        UnaryOp::Neg => "neg",
        UnaryOp::ZeroExtend => "zx",
        UnaryOp::SignExtend => "sx",
    }
}

/// A register read. Sub-registers are shown as the masked (and, if needed, shifted down) bits of
/// their full register.
fn render_register(r: &VersionedRegister, arch: &Architecture) -> String {
    match arch.register(&r.name) {
        Some(info) if info.is_sub_register() => {
            let masked = format!(
                "({:#x} & {})",
                info.mask(),
                register_text(info.full, r.version)
            );
            if info.bit_offset == 0 {
                masked
            } else {
                format!("({} >> {})", masked, info.bit_offset)
            }
        }
        _ => register_text(&r.name, r.version),
    }
}

/// Render an expression as infix text.
pub fn render_expression(expr: &Expr, arch: &Architecture) -> Result<String> {
    expr.fold(|e, args: Vec<String>| {
        Ok(match e {
            Expr::Constant { value, .. } => format!("{:#x}", value),
            Expr::Register(r) => render_register(r, arch),
            Expr::Binary { op, size, .. } => {
                let (l, r) = (&args[0], &args[1]);
                match (op, binary_symbol(*op)) {
                    (_, Some(sym)) => format!("({} {} {})", l, sym, r),
                    (BinaryOp::Rol, None) => {
                        let bits = bit_width(*size)?;
                        format!(
                            "({:#x} & (({} << {}) | ({} >> ({} - {}))))",
                            mask_for_bits(bits),
                            l,
                            r,
                            l,
                            bits,
                            r
                        )
                    }
                    (_, None) => {
                        let bits = bit_width(*size)?;
                        format!(
                            "({:#x} & (({} >> {}) | ({} << ({} - {}))))",
                            mask_for_bits(bits),
                            l,
                            r,
                            l,
                            bits,
                            r
                        )
                    }
                }
            }
            Expr::Unary { op, size, .. } => format!("{}({}, {})", unary_name(*op), args[0], size),
            Expr::MemoryRead { size, .. } => format!("read_mem({}, {})", args[0], size),
            Expr::ByteSwap { .. } => format!("bswap({})", args[0]),
            Expr::FlagBit { flag, bit } => format!("flag_bit({}, {})", flag, bit),
        })
    })
}

/// Render a single assignment.
///
/// A write to a sub-register is shown as the full register it produces: the bits outside the
/// sub-register come from the previous version, and the written value is shifted into place.
pub fn render_assignment(assignment: &Assignment, arch: &Architecture) -> Result<String> {
    Ok(match assignment {
        Assignment::FullRegister { dest, src } => format!(
            "{} = {}",
            register_text(&dest.name, dest.version),
            render_expression(src, arch)?
        ),
        Assignment::PartialRegister { sub, full, src } => {
            let info = arch.sub_register(sub)?;
            if info.full != full.name {
                return Err(Error::ConfigurationError {
                    message: format!("`{}` lives in `{}`, not `{}`", sub, info.full, full.name),
                });
            }
            let prev = full
                .previous()
                .ok_or_else(|| malformed_error!("partial write to version 0 of {}", full))?;
            let full_mask = mask_for_size(arch.register_size(&full.name));
            let src = render_expression(src, arch)?;
            let written = if info.bit_offset == 0 {
                src
            } else {
                format!("({} << {})", src, info.bit_offset)
            };
            format!(
                "{} = (({:#x} & {}) | ({:#x} & {}))",
                register_text(&full.name, full.version),
                !info.mask() & full_mask,
                register_text(&prev.name, prev.version),
                info.mask(),
                written
            )
        }
        Assignment::MemoryStore { address, src, .. } => format!(
            "[{}] = {}",
            render_expression(address, arch)?,
            render_expression(src, arch)?
        ),
    })
}

/// Render each assignment of `assignments`, preserving their order.
pub fn render_assignments(assignments: &[Assignment], arch: &Architecture) -> Result<Vec<String>> {
    assignments
        .iter()
        .map(|a| render_assignment(a, arch))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::X86;

    #[test]
    fn partial_writes() {
        let low = Assignment::PartialRegister {
            sub: "al".into(),
            full: VersionedRegister::new("eax", 2),
            src: Expr::constant(0xd2, 1),
        };
        assert_eq!(
            render_assignment(&low, &X86).unwrap(),
            "eax_2 = ((0xffffff00 & eax_1) | (0xff & 0xd2))"
        );

        let high = Assignment::PartialRegister {
            sub: "ah".into(),
            full: VersionedRegister::new("eax", 3),
            src: Expr::register("bl", 1),
        };
        assert_eq!(
            render_assignment(&high, &X86).unwrap(),
            "eax_3 = ((0xffff00ff & eax_2) | (0xff00 & ((0xff & ebx_1) << 8)))"
        );
    }

    #[test]
    fn sub_register_reads() {
        let e = Expr::binary(
            BinaryOp::Add,
            Expr::register("ah", 3),
            Expr::register("ax", 1),
            2,
        );
        assert_eq!(
            render_expression(&e, &X86).unwrap(),
            "(((0xff00 & eax_3) >> 8) + (0xffff & eax_1))"
        );
    }

    #[test]
    fn rotates_expand() {
        let e = Expr::binary(
            BinaryOp::Rol,
            Expr::register("eax", 1),
            Expr::constant(3, 1),
            4,
        );
        assert_eq!(
            render_expression(&e, &X86).unwrap(),
            "(0xffffffff & ((eax_1 << 0x3) | (eax_1 >> (32 - 0x3))))"
        );
        let e = Expr::binary(
            BinaryOp::Ror,
            Expr::register("bl", 1),
            Expr::register("cl", 0),
            1,
        );
        assert_eq!(
            render_expression(&e, &X86).unwrap(),
            "(0xff & (((0xff & ebx_1) >> (0xff & ecx_0)) | ((0xff & ebx_1) << (8 - (0xff & ecx_0)))))"
        );
    }

    #[test]
    fn stores_and_unknown_sub_registers() {
        let store = Assignment::MemoryStore {
            address: Expr::binary(
                BinaryOp::Add,
                Expr::register("esp", 0),
                Expr::constant(8, 4),
                4,
            ),
            src: Expr::MemoryRead {
                address: Box::new(Expr::register("esi", 2)),
                size: 4,
            },
            size: 4,
        };
        assert_eq!(
            render_assignment(&store, &X86).unwrap(),
            "[(esp_0 + 0x8)] = read_mem(esi_2, 4)"
        );

        let first = Assignment::PartialRegister {
            sub: "al".into(),
            full: VersionedRegister::new("eax", 0),
            src: Expr::constant(0, 1),
        };
        assert!(matches!(
            render_assignment(&first, &X86),
            Err(Error::MalformedExpression { .. })
        ));

        let wide = Expr::binary(
            BinaryOp::Ror,
            Expr::register("eax", 1),
            Expr::constant(3, 1),
            16,
        );
        assert!(matches!(
            render_expression(&wide, &X86),
            Err(Error::MalformedExpression { .. })
        ));

        let bogus = Assignment::PartialRegister {
            sub: "xl".into(),
            full: VersionedRegister::new("eax", 1),
            src: Expr::constant(0, 1),
        };
        assert!(matches!(
            render_assignment(&bogus, &X86),
            Err(Error::ConfigurationError { .. })
        ));
    }
}
