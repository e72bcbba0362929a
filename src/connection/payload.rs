//! Conversion of caller-supplied integers into wire bytes.

use crate::transport::Packet;

/// Maps an integer onto a signed byte with two's-complement wraparound.
///
/// `0..=127` pass through, `128..=255` become `-128..=-1`, anything else is
/// reduced modulo 256 first.
pub const fn to_wire_byte(value: i64) -> i8 {
   value.rem_euclid(256) as u8 as i8
}

/// Encodes a whole payload for the transport.
pub fn encode(values: &[i64]) -> Packet {
   values.iter().map(|&v| to_wire_byte(v) as u8).collect()
}
