//! Crypto error types.

/// Errors from mixing primitives.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("Invalid ciphertext length: expected {expected}, got {actual}")]
    InvalidCiphertextLength { expected: usize, actual: usize },

    #[error("KEM failure: {0}")]
    Kem(String),

    #[error("Value is not in the field")]
    NotInField,

    #[error("Vector dimensions differ: {left_n}x{left_msize} vs {right_n}x{right_msize}")]
    VectorDimension {
        left_n: usize,
        left_msize: usize,
        right_n: usize,
        right_msize: usize,
    },

    #[error("Message length {actual} does not match slot size {expected}")]
    MessageLength { expected: usize, actual: usize },

    #[error("Slot {slot} out of range for {n} slots")]
    SlotOutOfRange { slot: usize, n: usize },

    #[error("Peer count mismatch: {0}")]
    PeerCount(String),

    #[error("Key derivation failed: {0}")]
    KeyDerivationFailed(String),

    #[error("Randomness source failed: {0}")]
    Randomness(#[from] rand::Error),
}
