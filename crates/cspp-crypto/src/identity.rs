//! Session signing keypair.
//!
//! Each mix session uses a fresh ed25519 keypair. The public half identifies
//! the peer in the coordinator's roster; the secret half signs every message
//! the peer sends during the session.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::{CryptoRng, RngCore};
use zeroize::Zeroize;

use crate::error::CryptoError;

/// Size of an ed25519 public key.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Size of an ed25519 signature.
pub const SIGNATURE_SIZE: usize = 64;

/// An ed25519 keypair for one mix session.
pub struct SessionKeyPair {
    signing: SigningKey,
}

impl std::fmt::Debug for SessionKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKeyPair")
            .field("public", &hex::encode(self.public_bytes()))
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

impl SessionKeyPair {
    /// Generate a keypair from `random`.
    ///
    /// Fails when the randomness source cannot supply 32 bytes.
    pub fn generate<R: RngCore + CryptoRng + ?Sized>(random: &mut R) -> Result<Self, CryptoError> {
        let mut secret = [0u8; 32];
        random.try_fill_bytes(&mut secret)?;
        let signing = SigningKey::from_bytes(&secret);
        secret.zeroize();
        Ok(Self { signing })
    }

    /// Get the public key as raw bytes.
    pub fn public_bytes(&self) -> [u8; PUBLIC_KEY_SIZE] {
        self.signing.verifying_key().to_bytes()
    }

    /// Sign `msg`.
    pub fn sign(&self, msg: &[u8]) -> [u8; SIGNATURE_SIZE] {
        self.signing.sign(msg).to_bytes()
    }

    /// Compute a human-readable hex fingerprint of the public key.
    pub fn fingerprint(&self) -> String {
        fingerprint_of(&self.public_bytes())
    }
}

/// Verify an ed25519 signature over `msg` by raw public key bytes.
///
/// Malformed keys and signatures verify as false.
pub fn verify_signature(public: &[u8], msg: &[u8], sig: &[u8]) -> bool {
    let Ok(public) = <[u8; PUBLIC_KEY_SIZE]>::try_from(public) else {
        return false;
    };
    let Ok(sig) = <[u8; SIGNATURE_SIZE]>::try_from(sig) else {
        return false;
    };
    let Ok(vk) = VerifyingKey::from_bytes(&public) else {
        return false;
    };
    vk.verify(msg, &Signature::from_bytes(&sig)).is_ok()
}

/// Compute a colon-separated hex fingerprint from raw public key bytes.
///
/// Only the first eight bytes of the SHA-256 digest are shown; this is for
/// log correlation, not authentication.
pub fn fingerprint_of(pubkey_bytes: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let hash = Sha256::digest(pubkey_bytes);
    hash.iter()
        .take(8)
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}
