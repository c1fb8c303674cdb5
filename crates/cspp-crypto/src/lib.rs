//! CSPP mixing primitives.
//!
//! Provides the cryptographic building blocks of a DiceMix Light client,
//! kept free of any networking so that revealed secrets can be replayed by
//! other peers and by the coordinator.
//!
//! ## Crypto primitives
//!
//! - **PRNG**: ChaCha20 keyed by a revealable 32-byte seed, one stream per run
//! - **Field**: exponential slot reservation over `F = 2^127 - 1`
//! - **DC-net**: XOR vectors of fixed-size messages and their pads
//! - **Key exchange**: X25519 ECDH XOR ML-KEM-768 per peer pair → HKDF-SHA256 → pad PRNG seeds
//! - **Identity**: ed25519 session signing keys

pub mod dcnet;
pub mod error;
pub mod field;
pub mod identity;
pub mod kx;
pub mod prng;

pub use dcnet::{
    DcVec, PadContext, SharedKeys, dc_mix, dc_mix_pads, shared_keys, sr_mix, sr_mix_pads,
    xor_vectors,
};
pub use error::CryptoError;
pub use field::{FIELD_BYTES, field_prime, in_field, random_field_element};
pub use identity::{SessionKeyPair, fingerprint_of, verify_signature};
pub use kx::HybridKx;
pub use prng::{Prng, SEED_SIZE};
