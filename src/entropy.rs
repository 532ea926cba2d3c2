//! Process-scoped pseudo-randomness for the content ID and descriptor's
//! `longContentID` fields.
//!
//! Nothing in this crate needs cryptographic randomness, just distinct
//! values across runs. Rather than pull in an RNG crate, [`Rng`] is a tiny
//! splitmix64 generator that can be seeded explicitly (`Rng::seeded`) for
//! deterministic tests, or seeded from ambient process state (`Rng::from_os`)
//! for real use — the injection point the spec's design notes call for
//! ("pass them explicitly at create time or via an injected seed to keep
//! tests deterministic").

use std::time::{SystemTime, UNIX_EPOCH};

pub struct Rng {
    state: u64,
}

impl Rng {
    pub fn seeded(seed: u64) -> Self {
        // splitmix64 rejects an all-zero state by construction below, but a
        // zero seed would otherwise emit a degenerate first value.
        Self {
            state: seed ^ 0x9E37_79B9_7F4A_7C15,
        }
    }

    pub fn from_os() -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        let tid = thread_id_u64();
        Self::seeded(nanos ^ tid.rotate_left(17))
    }

    pub fn next_u64(&mut self) -> u64 {
        self.state = self.state.wrapping_add(0x9E37_79B9_7F4A_7C15);
        let mut z = self.state;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^ (z >> 31)
    }

    pub fn next_u32(&mut self) -> u32 {
        (self.next_u64() >> 32) as u32
    }
}

fn thread_id_u64() -> u64 {
    let id = std::thread::current().id();
    // `ThreadId` has no stable numeric accessor; hash its Debug form instead.
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    format!("{:?}", id).hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_is_deterministic() {
        let mut a = Rng::seeded(42);
        let mut b = Rng::seeded(42);
        for _ in 0..8 {
            assert_eq!(a.next_u64(), b.next_u64());
        }
    }

    #[test]
    fn different_seeds_diverge() {
        let mut a = Rng::seeded(1);
        let mut b = Rng::seeded(2);
        assert_ne!(a.next_u32(), b.next_u32());
    }
}
