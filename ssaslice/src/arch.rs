//! Architecture descriptions: which registers exist, and how narrower registers alias wider ones.
//!
//! There is exactly one table per architecture, and it is shared (immutably) by every consumer that
//! needs to know about register widths or sub-register masks, namely the builder, the renderer and
//! the evaluator.

use crate::containers::unordered::UnorderedMap;
use crate::error::{malformed_error, Error, Result};

/// A single register, possibly a view into part of a wider register.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct RegisterInfo {
    pub name: &'static str,
    /// The full register this one lives in. Equal to `name` for full registers.
    pub full: &'static str,
    /// Offset (in bits) of the lowest bit of this register within `full`
    pub bit_offset: u32,
    pub bit_width: u32,
}

impl RegisterInfo {
    pub fn is_sub_register(&self) -> bool {
        self.name != self.full
    }

    /// Size in bytes
    pub fn size(&self) -> usize {
        (self.bit_width / 8) as usize
    }

    /// The bits of the full register that belong to this register, in place.
    pub fn mask(&self) -> u64 {
        mask_for_bits(self.bit_width) << self.bit_offset
    }
}

/// The all-ones value of `bits` bits.
pub fn mask_for_bits(bits: u32) -> u64 {
    if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

/// The all-ones value of `size` bytes. Sizes past 8 bytes saturate to all ones.
pub fn mask_for_size(size: usize) -> u64 {
    mask_for_bits(size.min(8) as u32 * 8)
}

/// The width in bits of a `size`-byte value, which must fit in a `u64`.
pub fn bit_width(size: usize) -> Result<u32> {
    if size > 8 {
        return Err(malformed_error!("{}-byte values are wider than 64 bits", size));
    }
    Ok(size as u32 * 8)
}

#[derive(Debug)]
pub struct Architecture {
    pub name: &'static str,
    /// Width of full registers (and addresses), in bytes
    pub word_size: usize,
    pub stack_pointer: &'static str,
    registers: UnorderedMap<&'static str, RegisterInfo>,
}

impl Architecture {
    fn new(
        name: &'static str,
        word_size: usize,
        stack_pointer: &'static str,
        full_registers: &[&'static str],
        sub_registers: &[(&'static str, &'static str, u32, u32)],
    ) -> Self {
        let bits = (word_size * 8) as u32;
        let registers = full_registers
            .iter()
            .map(|&r| (r, r, 0, bits))
            .chain(sub_registers.iter().copied())
            .map(|(name, full, bit_offset, bit_width)| {
                (
                    name,
                    RegisterInfo {
                        name,
                        full,
                        bit_offset,
                        bit_width,
                    },
                )
            })
            .collect();
        Self {
            name,
            word_size,
            stack_pointer,
            registers,
        }
    }

    /// Look up an architecture by its listing name.
    pub fn by_name(name: &str) -> Option<&'static Architecture> {
        match name {
            "x86" => Some(&X86),
            _ => None,
        }
    }

    pub fn register(&self, name: &str) -> Option<&RegisterInfo> {
        self.registers.get(name)
    }

    /// Look up a sub-register. A name missing from the table is a configuration error, since
    /// guessing a mask would silently corrupt every value flowing through it.
    pub fn sub_register(&self, name: &str) -> Result<&RegisterInfo> {
        match self.registers.get(name) {
            Some(info) if info.is_sub_register() => Ok(info),
            Some(_) => Err(Error::ConfigurationError {
                message: format!("`{}` is a full register, not a sub-register", name),
            }),
            None => Err(Error::ConfigurationError {
                message: format!("no mask/shift entry for sub-register `{}` on {}", name, self.name),
            }),
        }
    }

    /// The full register owning `name`. Registers unknown to the table (eg: IL temporaries) are
    /// their own full register.
    pub fn full_register_of<'a>(&self, name: &'a str) -> &'a str {
        match self.registers.get(name) {
            Some(info) => info.full,
            None => name,
        }
    }

    /// Size in bytes of register `name`. Unknown registers are word-sized.
    pub fn register_size(&self, name: &str) -> usize {
        self.registers
            .get(name)
            .map(RegisterInfo::size)
            .unwrap_or(self.word_size)
    }

    pub fn is_stack_pointer(&self, name: &str) -> bool {
        self.full_register_of(name) == self.stack_pointer
    }
}

lazy_static::lazy_static! {
    /// 32-bit x86, with its 16-bit and 8-bit (low and high byte) views.
    pub static ref X86: Architecture = Architecture::new(
        "x86",
        4,
        "esp",
        &["eax", "ebx", "ecx", "edx", "esi", "edi", "ebp", "esp", "eip"],
        &[
            ("ax", "eax", 0, 16),
            ("bx", "ebx", 0, 16),
            ("cx", "ecx", 0, 16),
            ("dx", "edx", 0, 16),
            ("si", "esi", 0, 16),
            ("di", "edi", 0, 16),
            ("bp", "ebp", 0, 16),
            ("sp", "esp", 0, 16),
            ("al", "eax", 0, 8),
            ("bl", "ebx", 0, 8),
            ("cl", "ecx", 0, 8),
            ("dl", "edx", 0, 8),
            ("ah", "eax", 8, 8),
            ("bh", "ebx", 8, 8),
            ("ch", "ecx", 8, 8),
            ("dh", "edx", 8, 8),
        ],
    );
}
