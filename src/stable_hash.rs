//! Deterministic seeding for per-decision random streams.
//!
//! Not cryptographic. The ledger uses SHA-256; this is only for reproducible
//! sampling: the same engine seed, decision nonce and visitor give the same
//! stream on every platform.

use rand::rngs::StdRng;
use rand::SeedableRng;

/// FNV-1a over the bytes of each part (with a separator), finished with
/// SplitMix64 for diffusion.
#[must_use]
pub fn stable_hash64(seed: u64, parts: &[&str]) -> u64 {
    let mut h: u64 = 0xcbf2_9ce4_8422_2325;
    for part in parts {
        for b in part.as_bytes() {
            h ^= u64::from(*b);
            h = h.wrapping_mul(0x0100_0000_01b3);
        }
        h ^= 0xff;
        h = h.wrapping_mul(0x0100_0000_01b3);
    }
    splitmix64(seed ^ h)
}

#[inline]
fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    let mut z = x;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// RNG for one allocation.
pub(crate) fn decision_rng(seed: u64, nonce: u64, experiment: &str, visitor: &str) -> StdRng {
    StdRng::seed_from_u64(stable_hash64(splitmix64(seed ^ nonce), &[experiment, visitor]))
}
