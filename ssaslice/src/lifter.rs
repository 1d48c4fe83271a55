//! A lifter from textual SSA listings.
//!
//! A listing consists of a `PROGRAM` section and a `FUNCTIONS` section, separated by a blank line:
//!
//! ```text
//! PROGRAM
//! name dispatcher
//! arch x86
//!
//! FUNCTIONS
//! 00401000 vm_entry
//!     00401000 eax#1 = add.4(eax#0, 0x10:4)
//!     00401003 ebx#2.bl = xor.1(ebx#1.bl, eax#1.al)
//!     00401006 store.4(add.4(esp#0, 0x8:4), eax#1)
//!     00401009 edx#1 = intrinsic bswap(eax#1)
//! ```
//!
//! Each function starts with an unindented `<entry> <name>` header, followed by indented
//! `<address> <statement>` lines. Lines starting with `;` are comments.

use crate::arch::Architecture;
use crate::error::{Error, Result};
use crate::il::{
    Function, Instruction, InstructionKind, Operand, OperandOp, Program, SSAFlag, SSARegister,
};
use crate::log::*;

use itertools::Itertools;

fn parse_error(line: usize, message: impl Into<String>) -> Error {
    Error::Parse {
        line,
        message: message.into(),
    }
}

/// Lift a listing file.
pub fn lift_from_file(path: impl AsRef<std::path::Path>) -> Result<Program> {
    let listing = std::fs::read_to_string(path.as_ref())?;
    lift_from(&listing)
}

/// Lift a listing to a program that slicing and evaluation can be performed on.
pub fn lift_from(listing: &str) -> Result<Program> {
    let mut lines = listing
        .lines()
        .enumerate()
        .map(|(i, l)| (i + 1, l.trim_end()))
        .filter(|(_, l)| !l.trim_start().starts_with(';'));

    // Program section
    match lines.find(|(_, l)| !l.is_empty()) {
        Some((_, "PROGRAM")) => {}
        Some((n, l)) => return Err(parse_error(n, format!("Expected `PROGRAM`, got `{}`", l))),
        None => return Err(parse_error(0, "Empty listing")),
    }
    let mut name: Option<String> = None;
    let mut arch: Option<&'static Architecture> = None;
    for (n, l) in lines.by_ref() {
        if l.is_empty() {
            break;
        }
        match l.split_whitespace().collect_vec().as_slice() {
            ["name", v] => name = Some(v.to_string()),
            ["arch", v] => {
                arch = Some(
                    Architecture::by_name(v)
                        .ok_or_else(|| parse_error(n, format!("Unknown architecture `{}`", v)))?,
                )
            }
            _ => return Err(parse_error(n, format!("Unexpected program property `{}`", l))),
        }
    }
    let name = name.ok_or_else(|| parse_error(0, "Missing program `name`"))?;
    let arch = arch.ok_or_else(|| parse_error(0, "Missing program `arch`"))?;

    // Functions section
    match lines.find(|(_, l)| !l.is_empty()) {
        Some((_, "FUNCTIONS")) => {}
        Some((n, l)) => return Err(parse_error(n, format!("Expected `FUNCTIONS`, got `{}`", l))),
        None => return Err(parse_error(0, "Missing `FUNCTIONS` section")),
    }
    let mut functions: Vec<Function> = vec![];
    let mut current: Option<(u64, String, Vec<Instruction>)> = None;
    for (n, l) in lines {
        if l.is_empty() {
            continue;
        }
        let (addr, rest) = l
            .trim_start()
            .split_once(char::is_whitespace)
            .ok_or_else(|| parse_error(n, format!("Expected `<address> ...`, got `{}`", l)))?;
        let addr = parse_address(addr).ok_or_else(|| parse_error(n, "Invalid address"))?;
        let rest = rest.trim();
        if l.starts_with(char::is_whitespace) {
            let (_, _, insns) = current
                .as_mut()
                .ok_or_else(|| parse_error(n, "Instruction outside of a function"))?;
            insns.push(Instruction {
                address: addr,
                kind: parse_statement(rest, arch, n)?,
            });
        } else {
            if let Some((entry, fname, insns)) = current.take() {
                functions.push(finish_function(fname, entry, arch, insns)?);
            }
            current = Some((addr, rest.to_owned(), vec![]));
        }
    }
    if let Some((entry, fname, insns)) = current.take() {
        functions.push(finish_function(fname, entry, arch, insns)?);
    }

    info!("Lifted program"; "name" => &name, "functions" => functions.len());
    Ok(Program {
        name,
        arch,
        functions,
    })
}

fn finish_function(
    name: String,
    entry: u64,
    arch: &'static Architecture,
    insns: Vec<Instruction>,
) -> Result<Function> {
    debug!("Lifted function"; "name" => &name, "entry" => format!("{:#x}", entry), "instructions" => insns.len());
    Function::new(name, entry, arch, insns)
}

fn parse_address(s: &str) -> Option<u64> {
    u64::from_str_radix(s.trim_start_matches("0x"), 16).ok()
}

fn parse_number(s: &str) -> Option<u64> {
    let (neg, s) = match s.strip_prefix('-') {
        Some(s) => (true, s),
        None => (false, s),
    };
    let v = match s.strip_prefix("0x") {
        Some(h) => u64::from_str_radix(h, 16).ok()?,
        None => s.parse().ok()?,
    };
    Some(if neg { v.wrapping_neg() } else { v })
}

/// `name#version`
/// An operand width in bytes, one of 1, 2, 4, or 8.
fn parse_size(s: &str, line: usize, context: &str) -> Result<usize> {
    match s.trim().parse() {
        Ok(size @ (1 | 2 | 4 | 8)) => Ok(size),
        _ => Err(parse_error(
            line,
            format!("Invalid size `{}` in `{}`, expected 1, 2, 4, or 8", s, context),
        )),
    }
}

fn parse_register(s: &str, line: usize) -> Result<SSARegister> {
    let (reg, version) = s
        .split_once('#')
        .ok_or_else(|| parse_error(line, format!("Expected `reg#version`, got `{}`", s)))?;
    let version = version
        .parse()
        .map_err(|_| parse_error(line, format!("Invalid SSA version in `{}`", s)))?;
    if reg.is_empty() || !reg.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(parse_error(line, format!("Invalid register name `{}`", reg)));
    }
    Ok(SSARegister::new(reg, version))
}

#[derive(Clone, PartialEq, Eq, Debug)]
enum Token<'s> {
    Atom(&'s str),
    LParen,
    RParen,
    Comma,
}

fn tokenize(s: &str) -> Vec<Token<'_>> {
    let mut res = vec![];
    let mut start: Option<usize> = None;
    for (i, c) in s.char_indices() {
        let punct = match c {
            '(' => Some(Token::LParen),
            ')' => Some(Token::RParen),
            ',' => Some(Token::Comma),
            _ => None,
        };
        if punct.is_some() || c.is_whitespace() {
            if let Some(st) = start.take() {
                res.push(Token::Atom(&s[st..i]));
            }
            res.extend(punct);
        } else if start.is_none() {
            start = Some(i);
        }
    }
    if let Some(st) = start {
        res.push(Token::Atom(&s[st..]));
    }
    res
}

/// A leaf operand: a constant, a (partial) register, `unimpl`, or `undef`.
fn parse_leaf(atom: &str, arch: &Architecture, line: usize) -> Result<Operand> {
    match atom {
        "unimpl" => return Ok(Operand::Unimplemented),
        "undef" => return Ok(Operand::Undefined),
        _ => {}
    }
    if atom.contains('#') {
        return Ok(match atom.split_once('.') {
            Some((full, sub)) => Operand::RegPartial {
                full_reg: parse_register(full, line)?,
                sub: sub.to_owned(),
                size: arch.register_size(sub),
            },
            None => {
                let src = parse_register(atom, line)?;
                let size = arch.register_size(&src.reg);
                Operand::Reg { src, size }
            }
        });
    }
    let (value, size) = match atom.split_once(':') {
        Some((v, sz)) => (v, parse_size(sz, line, atom)?),
        None => (atom, arch.word_size),
    };
    let value = parse_number(value)
        .ok_or_else(|| parse_error(line, format!("Invalid operand `{}`", atom)))?;
    Ok(Operand::Const {
        value: value & crate::arch::mask_for_size(size),
        size,
    })
}

/// An operator application `op.size(args...)`, with all `args` already parsed.
fn make_application(
    head: &str,
    args: Vec<Operand>,
    arch: &Architecture,
    line: usize,
) -> Result<Operand> {
    let (name, size) = match head.split_once('.') {
        Some((name, size)) => (name, parse_size(size, line, head)?),
        None => (head, arch.word_size),
    };
    let as_flag = |o: &Operand| match o {
        Operand::Reg { src, .. } => Ok(SSAFlag {
            flag: src.reg.clone(),
            version: src.version,
        }),
        _ => Err(parse_error(line, format!("Expected a flag, got `{}`", o))),
    };
    match name {
        "flagbit" => match args.as_slice() {
            [flag, Operand::Const { value, .. }] => Ok(Operand::FlagBit {
                flag: as_flag(flag)?,
                bit: *value as usize,
                size,
            }),
            _ => Err(parse_error(
                line,
                format!("Malformed `flagbit({})`", args.iter().join(", ")),
            )),
        },
        "flag" => match args.as_slice() {
            [flag] => Ok(Operand::Flag {
                flag: as_flag(flag)?,
            }),
            _ => Err(parse_error(
                line,
                format!("Malformed `flag({})`", args.iter().join(", ")),
            )),
        },
        _ => Ok(Operand::Op {
            op: OperandOp::from_mnemonic(name)
                .ok_or_else(|| parse_error(line, format!("Unknown operator `{}`", name)))?,
            size,
            operands: args,
        }),
    }
}

/// Parse a comma-separated list of operands.
///
/// Nested applications are handled with an explicit stack of partially collected argument lists,
/// so nesting depth is not limited by the native stack.
fn parse_operands(s: &str, arch: &Architecture, line: usize) -> Result<Vec<Operand>> {
    struct Frame<'s> {
        head: &'s str,
        args: Vec<Operand>,
        /// Whether another argument may start here
        expecting_arg: bool,
    }
    let mut top = Frame {
        head: "",
        args: vec![],
        expecting_arg: true,
    };
    let mut frames: Vec<Frame> = vec![];
    let mut tokens = tokenize(s).into_iter().peekable();
    while let Some(tok) = tokens.next() {
        let cur = frames.last_mut().unwrap_or(&mut top);
        let completed = match tok {
            Token::Atom(a) => {
                if !cur.expecting_arg {
                    return Err(parse_error(line, format!("Unexpected `{}` in `{}`", a, s)));
                }
                if tokens.peek() == Some(&Token::LParen) {
                    tokens.next();
                    cur.expecting_arg = false;
                    frames.push(Frame {
                        head: a,
                        args: vec![],
                        expecting_arg: true,
                    });
                    continue;
                }
                parse_leaf(a, arch, line)?
            }
            Token::Comma => {
                if cur.expecting_arg {
                    return Err(parse_error(line, format!("Unexpected `,` in `{}`", s)));
                }
                cur.expecting_arg = true;
                continue;
            }
            Token::RParen => {
                let f = frames
                    .pop()
                    .ok_or_else(|| parse_error(line, format!("Unbalanced `)` in `{}`", s)))?;
                if f.expecting_arg && !f.args.is_empty() {
                    return Err(parse_error(line, format!("Trailing `,` in `{}`", s)));
                }
                make_application(f.head, f.args, arch, line)?
            }
            Token::LParen => {
                return Err(parse_error(line, format!("Unexpected `(` in `{}`", s)));
            }
        };
        let cur = frames.last_mut().unwrap_or(&mut top);
        cur.args.push(completed);
        cur.expecting_arg = false;
    }
    if !frames.is_empty() {
        return Err(parse_error(line, format!("Unbalanced `(` in `{}`", s)));
    }
    if top.expecting_arg && !top.args.is_empty() {
        return Err(parse_error(line, format!("Trailing `,` in `{}`", s)));
    }
    Ok(top.args)
}

fn parse_operand(s: &str, arch: &Architecture, line: usize) -> Result<Operand> {
    let mut ops = parse_operands(s, arch, line)?;
    match (ops.pop(), ops.is_empty()) {
        (Some(o), true) => Ok(o),
        _ => Err(parse_error(line, format!("Expected a single operand, got `{}`", s))),
    }
}

/// The contents of `<prefix>(...)`
fn parenthesized<'s>(s: &'s str, prefix: &str) -> Option<&'s str> {
    s.strip_prefix(prefix)?
        .trim_start()
        .strip_prefix('(')?
        .strip_suffix(')')
}

fn parse_statement(s: &str, arch: &Architecture, line: usize) -> Result<InstructionKind> {
    if s == "nop" {
        return Ok(InstructionKind::Nop);
    }
    if let Some(target) = s.strip_prefix("goto ") {
        return Ok(InstructionKind::Goto {
            target: parse_address(target.trim())
                .ok_or_else(|| parse_error(line, format!("Invalid goto target `{}`", target)))?,
        });
    }
    if let Some(inner) = parenthesized(s, "jump") {
        return Ok(InstructionKind::Jump {
            dest: parse_operand(inner, arch, line)?,
        });
    }
    if let Some(inner) = parenthesized(s, "call") {
        return Ok(InstructionKind::Call {
            dest: parse_operand(inner, arch, line)?,
        });
    }
    if let Some(inner) = parenthesized(s, "ret") {
        return Ok(InstructionKind::Ret {
            dest: parse_operand(inner, arch, line)?,
        });
    }
    if let Some(rest) = s.strip_prefix("store.") {
        let (size, args) = rest
            .split_once('(')
            .ok_or_else(|| parse_error(line, format!("Malformed store `{}`", s)))?;
        let size = parse_size(size, line, s)?;
        let args = args
            .strip_suffix(')')
            .ok_or_else(|| parse_error(line, format!("Malformed store `{}`", s)))?;
        let mut ops = parse_operands(args, arch, line)?;
        return match (ops.pop(), ops.pop(), ops.is_empty()) {
            (Some(src), Some(dest), true) => Ok(InstructionKind::Store { size, dest, src }),
            _ => Err(parse_error(line, format!("Store takes two operands: `{}`", s))),
        };
    }

    let (lhs, rhs) = s
        .split_once('=')
        .ok_or_else(|| parse_error(line, format!("Unrecognized statement `{}`", s)))?;
    let (lhs, rhs) = (lhs.trim(), rhs.trim());

    if let Some(rest) = rhs.strip_prefix("intrinsic ") {
        let (intrinsic, params) = rest
            .split_once('(')
            .ok_or_else(|| parse_error(line, format!("Malformed intrinsic `{}`", rhs)))?;
        let params = params
            .strip_suffix(')')
            .ok_or_else(|| parse_error(line, format!("Malformed intrinsic `{}`", rhs)))?;
        let outputs = lhs
            .split(',')
            .map(|o| parse_register(o.trim(), line))
            .collect::<Result<Vec<_>>>()?;
        return Ok(InstructionKind::Intrinsic {
            outputs,
            intrinsic: intrinsic.trim().to_owned(),
            params: parse_operands(params, arch, line)?,
        });
    }

    if let Some(sources) = parenthesized(rhs, "phi") {
        return Ok(InstructionKind::Phi {
            dest: parse_register(lhs, line)?,
            sources: sources
                .split(',')
                .map(|r| parse_register(r.trim(), line))
                .collect::<Result<Vec<_>>>()?,
        });
    }

    let src = parse_operand(rhs, arch, line)?;
    Ok(match lhs.split_once('.') {
        Some((full, sub)) => InstructionKind::SetRegPartial {
            full_reg: parse_register(full, line)?,
            dest: sub.to_owned(),
            src,
        },
        None => InstructionKind::SetReg {
            dest: parse_register(lhs, line)?,
            src,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::X86;

    #[test]
    fn operands() {
        let o = parse_operand("sub.4(eax#0, lsl.4(ebx#1.bl, 0x3:1))", &X86, 1).unwrap();
        assert_eq!(o.to_string(), "sub.4(eax#0, lsl.4(ebx#1.bl, 0x3:1))");
        let o = parse_operand("flagbit.1(c#2, 3)", &X86, 1).unwrap();
        assert_eq!(
            o,
            Operand::FlagBit {
                flag: SSAFlag {
                    flag: "c".into(),
                    version: 2
                },
                bit: 3,
                size: 1
            }
        );
        assert_eq!(
            parse_operand("-1:2", &X86, 1).unwrap(),
            Operand::Const {
                value: 0xffff,
                size: 2
            }
        );
    }

    #[test]
    fn malformed_operands() {
        for bad in [
            "add.4(eax#0, ebx#0",
            "add.4(eax#0,, ebx#0)",
            "add.4(eax#0 ebx#0)",
            "frobnicate.4(eax#0)",
            "eax#x",
            "",
            "0x1:3",
            "0x1:4000000000000000000",
            "lsl.16(eax#0, 0x40:1)",
            "add.0(eax#0, 0x1:4)",
        ] {
            assert!(
                matches!(parse_operand(bad, &X86, 7), Err(Error::Parse { line: 7, .. })),
                "{}",
                bad
            );
        }
    }

    #[test]
    fn oversized_stores_are_rejected() {
        assert!(matches!(
            parse_statement("store.16(eax#0, ebx#0)", &X86, 3),
            Err(Error::Parse { line: 3, .. })
        ));
        assert!(matches!(
            crate::tests::single_function_program("    00001000 eax#1 = 0x1:4000000000000000000"),
            Err(Error::Parse { line: 7, .. })
        ));
    }

    #[test]
    fn statements() {
        let st = |s| parse_statement(s, &X86, 1).unwrap().to_string();
        assert_eq!(st("eax#1 = add.4(eax#0, 0x10:4)"), "eax#1 = add.4(eax#0, 0x10:4)");
        assert_eq!(st("ebx#2.bl = xor.1(ebx#1.bl, eax#1.al)"), "ebx#2.bl = xor.1(ebx#1.bl, eax#1.al)");
        assert_eq!(st("store.4(add.4(esp#0, 8:4), eax#1)"), "store.4(add.4(esp#0, 0x8:4), eax#1)");
        assert_eq!(st("edx#1 = intrinsic bswap(eax#1)"), "edx#1 = intrinsic bswap(eax#1)");
        assert_eq!(st("eax#3 = phi(eax#1, eax#2)"), "eax#3 = phi(eax#1, eax#2)");
        assert_eq!(st("jump(edi#4)"), "jump(edi#4)");
        assert_eq!(st("goto 401000"), "goto 0x401000");
        assert_eq!(st("nop"), "nop");
    }

    #[test]
    fn duplicate_definitions_are_rejected() {
        let listing = "PROGRAM\nname t\narch x86\n\nFUNCTIONS\n00001000 f\n    00001000 eax#1 = 1:4\n    00001002 eax#1 = 2:4\n";
        assert!(matches!(
            lift_from(listing),
            Err(Error::DuplicateDefinition {
                first: 0x1000,
                second: 0x1002,
                ..
            })
        ));
    }

    #[test]
    fn sections() {
        assert!(matches!(
            lift_from("PROGRAM\nname t\narch mips\n"),
            Err(Error::Parse { line: 3, .. })
        ));
        assert!(matches!(
            lift_from("PROGRAM\nname t\narch x86\n\nFUNCTIONS\n    00001000 nop\n"),
            Err(Error::Parse { line: 6, .. })
        ));
        let p = lift_from("PROGRAM\nname t\narch x86\n\nFUNCTIONS\n; empty\n00001000 f\n    00001000 nop\n00002000 g\n").unwrap();
        assert_eq!(p.functions.len(), 2);
        assert_eq!(p.functions[1].entry_point, 0x2000);
        assert!(p.functions[1].instructions().is_empty());
    }
}
