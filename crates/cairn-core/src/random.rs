//! Two randomness sources with distinct duties.
//!
//! The secure source backs cryptographic material: connection IDs,
//! stateless reset tokens, and the static secret. The fast source feeds
//! the engine's per-packet `random` callback, where entropy quality does
//! not matter but call frequency does. Never swap one for the other.

use rand::rngs::{OsRng, SmallRng};
use rand::{RngCore, SeedableRng};

/// Operating-system entropy. Used for all secret material.
#[derive(Debug, Default)]
pub struct SecureRandom;

impl SecureRandom {
    pub fn new() -> Self {
        SecureRandom
    }

    pub fn fill(&mut self, buffer: &mut [u8]) {
        OsRng.fill_bytes(buffer);
    }

    /// Generate a 32-byte secret.
    pub fn secret(&mut self) -> [u8; 32] {
        let mut secret = [0u8; 32];
        self.fill(&mut secret);
        secret
    }
}

/// Non-secure generator, seeded once from the secure source.
#[derive(Debug)]
pub struct FastRandom(SmallRng);

impl FastRandom {
    pub fn new() -> Self {
        FastRandom(SmallRng::from_rng(OsRng).expect("OS entropy source"))
    }

    pub fn fill(&mut self, buffer: &mut [u8]) {
        self.0.fill_bytes(buffer);
    }
}

impl Default for FastRandom {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secrets_are_distinct() {
        let mut random = SecureRandom::new();
        assert_ne!(random.secret(), random.secret());
    }

    #[test]
    fn fast_fill_covers_buffer() {
        let mut random = FastRandom::new();
        let mut a = [0u8; 64];
        let mut b = [0u8; 64];
        random.fill(&mut a);
        random.fill(&mut b);
        assert_ne!(a, b);
    }
}
