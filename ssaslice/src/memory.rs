//! A read-only, little-endian memory image, serving as the memory oracle for evaluation.

use crate::error::Result;
use crate::evaluator::MemoryOracle;
use crate::log::*;

/// A contiguous run of bytes, mapped at `base`.
#[derive(Clone, Debug)]
struct Segment {
    base: u64,
    bytes: Vec<u8>,
}

impl Segment {
    fn get(&self, address: u64, size: usize) -> Option<&[u8]> {
        let start = usize::try_from(address.checked_sub(self.base)?).ok()?;
        self.bytes.get(start..start.checked_add(size)?)
    }
}

#[derive(Clone, Default, Debug)]
pub struct MemoryImage {
    segments: Vec<Segment>,
}

impl MemoryImage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `bytes` at `base`. Later segments shadow earlier ones where they overlap.
    pub fn add_segment(&mut self, base: u64, bytes: Vec<u8>) {
        self.segments.push(Segment { base, bytes });
    }

    /// An image holding the raw contents of the file at `path`, mapped at `base`.
    pub fn from_flat_file(path: impl AsRef<std::path::Path>, base: u64) -> Result<Self> {
        let bytes = std::fs::read(path.as_ref())?;
        info!("Loaded memory image"; "path" => ?path.as_ref(), "base" => format!("{:#x}", base), "len" => bytes.len());
        let mut image = Self::new();
        image.add_segment(base, bytes);
        Ok(image)
    }

    /// The `size` bytes at `address`, if they are all mapped within a single segment.
    pub fn read_bytes(&self, address: u64, size: usize) -> Option<&[u8]> {
        self.segments
            .iter()
            .rev()
            .find_map(|s| s.get(address, size))
    }
}

impl MemoryOracle for MemoryImage {
    /// Little-endian, sign-extended read of 1, 2, 4, or 8 bytes.
    fn read_int(&self, address: u64, size: usize) -> Option<i64> {
        let b = self.read_bytes(address, size)?;
        let v = match size {
            1 => i8::from_le_bytes(b.try_into().ok()?) as i64,
            2 => i16::from_le_bytes(b.try_into().ok()?) as i64,
            4 => i32::from_le_bytes(b.try_into().ok()?) as i64,
            8 => i64::from_le_bytes(b.try_into().ok()?),
            _ => {
                debug!("Unsupported read size"; "address" => format!("{:#x}", address), "size" => size);
                return None;
            }
        };
        Some(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_are_little_endian_and_signed() {
        let mut image = MemoryImage::new();
        image.add_segment(0x1000, vec![0x78, 0x56, 0x34, 0x12, 0xfe, 0xff, 0xff, 0xff]);
        assert_eq!(image.read_int(0x1000, 4), Some(0x1234_5678));
        assert_eq!(image.read_int(0x1004, 4), Some(-2));
        assert_eq!(image.read_int(0x1004, 1), Some(-2));
        assert_eq!(image.read_int(0x1002, 2), Some(0x1234));
        assert_eq!(image.read_int(0x1006, 4), None);
        assert_eq!(image.read_int(0x0fff, 1), None);
        assert_eq!(image.read_int(0x1000, 3), None);
    }
}
