//! Checksums of inbound and outbound frames.
//!
//! The two directions use unrelated algorithms. Inbound command frames carry an
//! additive sum over their length, command and data bytes, which the parser
//! accumulates while reading. Outbound ACK frames are stamped by a
//! [`FrameChecksum`] implementation supplied by the integrator.

use crate::protocol::{self as proto, CHECKSUM_BYPASS, CHECKSUM_FIELD_LEN};

/// Adds `bytes` to a running inbound checksum, modulo 2^32.
pub fn accumulate(sum: u32, bytes: &[u8]) -> u32 {
    bytes
        .iter()
        .fold(sum, |acc, byte| acc.wrapping_add(*byte as u32))
}

/// The additive sum of `bytes`, modulo 2^32.
pub fn additive_sum(bytes: &[u8]) -> u32 {
    accumulate(0, bytes)
}

/// Result of checking a received checksum field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verification {
    /// The field was the literal `XXXX`.
    Bypassed,
    /// The field matched the accumulated sum.
    Matched,
    /// The field did not match, or was not valid hex.
    Mismatch { calculated: u32, received: Option<u32> },
}

impl Verification {
    /// A bypassed check counts as valid.
    pub fn is_valid(&self) -> bool {
        !matches!(self, Verification::Mismatch { .. })
    }
}

/// Checks a received checksum field against the accumulated sum.
pub fn verify(field: &[u8; CHECKSUM_FIELD_LEN], calculated: u32) -> Verification {
    if field == CHECKSUM_BYPASS {
        return Verification::Bypassed;
    }
    match proto::parse_hex(field) {
        Some(received) if received == calculated => Verification::Matched,
        received => Verification::Mismatch {
            calculated,
            received,
        },
    }
}

/// Checksum stamped onto outgoing ACK frames.
pub trait FrameChecksum {
    fn checksum(&self, bytes: &[u8]) -> u16;
}

impl<F> FrameChecksum for F
where
    F: Fn(&[u8]) -> u16,
{
    fn checksum(&self, bytes: &[u8]) -> u16 {
        self(bytes)
    }
}

/// CRC-16/XMODEM, the default outbound checksum.
pub const ACK_CRC16: crc::Algorithm<u16> = crc::CRC_16_XMODEM;

#[derive(Debug, Clone, Copy, Default)]
pub struct Crc16Xmodem;

impl FrameChecksum for Crc16Xmodem {
    fn checksum(&self, bytes: &[u8]) -> u16 {
        crc::Crc::<u16>::new(&ACK_CRC16).checksum(bytes)
    }
}
