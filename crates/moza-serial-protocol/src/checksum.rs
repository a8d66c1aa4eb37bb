//! Frame checksums.
//!
//! The checksum is an 8-bit accumulator over every byte of the frame from the
//! address through the end of the payload; the start marker is excluded.
//! Firmware families differ in the accumulator, so the codec takes any
//! [`Checksum`] and the Moza default can be swapped for a variant validated
//! against recorded traffic.

use core::fmt;

/// Seed of the additive accumulator used by Moza firmware.
pub const MOZA_CHECKSUM_SEED: u8 = 0x0D;

/// An 8-bit frame checksum.
pub trait Checksum: fmt::Debug + Send + Sync {
    /// Compute the checksum of `bytes` (address through payload).
    fn compute(&self, bytes: &[u8]) -> u8;
}

/// Wrapping byte sum, seeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdditiveChecksum {
    /// Initial accumulator value
    pub seed: u8,
}

impl AdditiveChecksum {
    /// The accumulator Moza wheelbases, wheels and peripherals expect.
    pub const MOZA: Self = Self {
        seed: MOZA_CHECKSUM_SEED,
    };
}

impl Default for AdditiveChecksum {
    fn default() -> Self {
        Self::MOZA
    }
}

impl Checksum for AdditiveChecksum {
    fn compute(&self, bytes: &[u8]) -> u8 {
        bytes.iter().fold(self.seed, |acc, b| acc.wrapping_add(*b))
    }
}

/// Running XOR, seeded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct XorChecksum {
    /// Initial accumulator value
    pub seed: u8,
}

impl Checksum for XorChecksum {
    fn compute(&self, bytes: &[u8]) -> u8 {
        bytes.iter().fold(self.seed, |acc, b| acc ^ b)
    }
}

/// Moza checksum of `bytes`.
pub fn checksum(bytes: &[u8]) -> u8 {
    AdditiveChecksum::MOZA.compute(bytes)
}
