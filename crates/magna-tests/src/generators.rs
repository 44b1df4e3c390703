//! Random data generators for the integration tests.

use magna_core::Hash256;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// A deterministic RNG so failures reproduce.
pub fn seeded_rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

/// A random 256-bit hash.
pub fn random_hash(rng: &mut impl Rng) -> Hash256 {
    let mut bytes = [0u8; 32];
    rng.fill(&mut bytes);
    Hash256::from_bytes(bytes)
}

/// `count` distinct random txids.
pub fn random_txids(rng: &mut impl Rng, count: usize) -> Vec<Hash256> {
    (0..count).map(|_| random_hash(rng)).collect()
}

/// An inclusion mask where each position is set with probability
/// `1 / 2^bits` (so `bits == 0` includes everything).
pub fn inclusion_mask(rng: &mut impl Rng, count: usize, bits: u32) -> Vec<bool> {
    (0..count)
        .map(|_| {
            if bits == 0 {
                true
            } else {
                rng.gen_range(0u64..(1 << bits)) == 0
            }
        })
        .collect()
}
