//! Bit-level field access and report synthesis.

/// Reads `bit_size` bits (1..=32) starting `bit_offset` bits into `data`,
/// little-endian bit order as HID packs fields. `None` if the field does
/// not fit inside `data`.
pub fn extract_bits(data: &[u8], bit_offset: u32, bit_size: u32) -> Option<u32> {
    if bit_size == 0 || bit_size > 32 {
        return None;
    }
    let end_bit = bit_offset.checked_add(bit_size)?;
    let first = usize::try_from(bit_offset / 8).ok()?;
    let last = usize::try_from(end_bit.div_ceil(8)).ok()?;
    let bytes = data.get(first..last)?;

    let mut acc: u64 = 0;
    for (i, byte) in bytes.iter().enumerate() {
        acc |= u64::from(*byte) << (i * 8);
    }
    let shifted = acc >> (bit_offset % 8);
    let mask = (1u64 << bit_size) - 1;
    u32::try_from(shifted & mask).ok()
}

/// Sign-extends a `bit_size`-wide two's-complement value.
pub fn sign_extend(value: u32, bit_size: u32) -> i32 {
    if bit_size == 0 || bit_size >= 32 {
        return i32::from_ne_bytes(value.to_ne_bytes());
    }
    let shift = 32 - bit_size;
    i32::from_ne_bytes((value << shift).to_ne_bytes()) >> shift
}

/// Little-endian report writer, used to synthesize reports for doubles and
/// virtual devices.
#[derive(Debug, Clone, Default)]
pub struct ReportBuilder {
    buffer: Vec<u8>,
}

impl ReportBuilder {
    /// A zeroed report of `len` bytes, for `set_*` style writes.
    pub fn zeroed(len: usize) -> Self {
        Self {
            buffer: vec![0u8; len],
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
        }
    }

    pub fn write_u8(&mut self, value: u8) -> &mut Self {
        self.buffer.push(value);
        self
    }

    pub fn write_u16_le(&mut self, value: u16) -> &mut Self {
        self.buffer.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn write_bytes(&mut self, data: &[u8]) -> &mut Self {
        self.buffer.extend_from_slice(data);
        self
    }

    /// Overwrites a little-endian u16 at `offset`, growing the report if needed.
    pub fn set_u16_le(&mut self, offset: usize, value: u16) -> &mut Self {
        let end = offset.saturating_add(2);
        if self.buffer.len() < end {
            self.buffer.resize(end, 0);
        }
        if let Some(slot) = self.buffer.get_mut(offset..end) {
            slot.copy_from_slice(&value.to_le_bytes());
        }
        self
    }

    pub fn set_bit(&mut self, bit_offset: usize, on: bool) -> &mut Self {
        let index = bit_offset / 8;
        if self.buffer.len() <= index {
            self.buffer.resize(index.saturating_add(1), 0);
        }
        if let Some(byte) = self.buffer.get_mut(index) {
            let mask = 1u8 << (bit_offset % 8);
            if on {
                *byte |= mask;
            } else {
                *byte &= !mask;
            }
        }
        self
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buffer
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buffer
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_bits_within_and_across_bytes() {
        let data = [0b1010_0101, 0b0000_0011];
        assert_eq!(extract_bits(&data, 0, 1), Some(1));
        assert_eq!(extract_bits(&data, 1, 1), Some(0));
        assert_eq!(extract_bits(&data, 4, 4), Some(0b1010));
        assert_eq!(extract_bits(&data, 6, 4), Some(0b1110));
        assert_eq!(extract_bits(&data, 0, 16), Some(0x03A5));
        assert_eq!(extract_bits(&data, 12, 8), None);
        assert_eq!(extract_bits(&data, 0, 0), None);
    }

    #[test]
    fn test_sign_extend() {
        assert_eq!(sign_extend(0xFF, 8), -1);
        assert_eq!(sign_extend(0x7F, 8), 127);
        assert_eq!(sign_extend(0x8000, 16), i32::from(i16::MIN));
        assert_eq!(sign_extend(0b100, 3), -4);
    }

    #[test]
    fn test_report_builder() {
        let mut builder = ReportBuilder::with_capacity(8);
        builder
            .write_u8(0x01)
            .write_u16_le(0x1234)
            .write_bytes(&[0xAA, 0xBB]);
        assert_eq!(builder.as_slice(), &[0x01, 0x34, 0x12, 0xAA, 0xBB]);

        let mut builder = ReportBuilder::zeroed(2);
        builder.set_u16_le(3, 0xBEEF).set_bit(9, true);
        assert_eq!(builder.into_inner(), vec![0x00, 0x02, 0x00, 0xEF, 0xBE]);
    }
}
