//! Deterministic per-run PRNG.
//!
//! Every secret a peer commits to during a run is drawn from a ChaCha20
//! stream keyed by a 32-byte seed, with the run index selecting the stream.
//! Revealing the seed lets any other party regenerate those secrets bit for
//! bit during blame assignment.

use rand::{CryptoRng, RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;

/// Size of a PRNG seed in bytes.
pub const SEED_SIZE: usize = 32;

/// Stream ids at or above this value carry encapsulation randomness. Key
/// streams use the run index directly and stay below it.
const ENCAPSULATION_STREAM: u64 = 1 << 32;

/// ChaCha20 keystream reader bound to a seed and a run.
pub struct Prng {
    inner: ChaCha20Rng,
}

impl std::fmt::Debug for Prng {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Prng")
            .field("stream", &self.inner.get_stream())
            .field("word_pos", &self.inner.get_word_pos())
            .finish_non_exhaustive()
    }
}

impl Prng {
    /// Create the keystream for `seed` in the stream selected by `run`.
    pub fn new(seed: &[u8; SEED_SIZE], run: u32) -> Self {
        let mut inner = ChaCha20Rng::from_seed(*seed);
        inner.set_stream(u64::from(run));
        Self { inner }
    }

    /// Create the keystream supplying KEM encapsulation randomness for `run`.
    ///
    /// Kept apart from the key streams so that a run reusing earlier keys
    /// still encapsulates with randomness of its own.
    pub fn encapsulation(seed: &[u8; SEED_SIZE], run: u32) -> Self {
        let mut inner = ChaCha20Rng::from_seed(*seed);
        inner.set_stream(ENCAPSULATION_STREAM | u64::from(run));
        Self { inner }
    }

    /// Read the next `n` bytes of keystream.
    pub fn next_bytes(&mut self, n: usize) -> Vec<u8> {
        let mut out = vec![0u8; n];
        self.inner.fill_bytes(&mut out);
        out
    }
}

impl RngCore for Prng {
    fn next_u32(&mut self) -> u32 {
        self.inner.next_u32()
    }

    fn next_u64(&mut self) -> u64 {
        self.inner.next_u64()
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.inner.fill_bytes(dest);
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
        self.inner.try_fill_bytes(dest)
    }
}

impl CryptoRng for Prng {}
