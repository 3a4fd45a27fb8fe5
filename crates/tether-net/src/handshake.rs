//! The nonce/scramble exchange that gates the framed stream: an 8-byte
//! nonce out, an 8-byte scrambled response back.
//!
//! This is **not** a security primitive — it rejects peers speaking the
//! wrong protocol dialect, nothing more. `scramble` is an intentionally
//! weak, reversible bit-mixer with fixed constants; anyone who can read
//! this file can forge a valid handshake. Do not mistake it for
//! authentication or encryption.

const K1: u64 = 0xDEAD_BEEF_C0DE_CAFE;
const K2: u64 = 0xC0DE_FACE_1234_5678;

/// `((x XOR K1) with a bit reshuffle) XOR K2`.
pub fn scramble(x: u64) -> u64 {
    let mixed = x ^ K1;
    let reshuffled = ((mixed & 0xF0F0_F0F0_DEAD_BEEF) << 8) | ((mixed & 0xDEAD_BEEF_0000_0000) >> 8);
    reshuffled ^ K2
}

/// An unpredictable-enough 64-bit nonce. Not cryptographically secure —
/// see the module docs.
pub fn nonce() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_nanos() as u64).unwrap_or(0)
}

pub const NONCE_WIRE_SIZE: usize = 8;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn scramble_is_deterministic() {
        assert_eq!(scramble(42), scramble(42));
    }

    #[test]
    fn scramble_changes_input() {
        assert_ne!(scramble(42), 42);
    }

    #[test]
    fn different_inputs_scramble_differently() {
        assert_ne!(scramble(1), scramble(2));
    }
}
