//! Hybrid X25519 + ML-KEM-768 key exchange between mix peers.
//!
//! Every peer publishes an X25519 public value and an ML-KEM encapsulation
//! key, then encapsulates a secret to every peer (itself included). The
//! pairwise secret is the XOR of the ECDH output with both KEM secrets of the
//! pair, so a break of either primitive alone leaves the other standing.
//!
//! Key material is drawn from the key stream of a [`Prng`] and encapsulation
//! randomness from the per-run encapsulation stream of the same seed, so a
//! revealed seed reproduces both exactly.

use ml_kem::array::Array;
use ml_kem::kem::{Decapsulate, Encapsulate};
use ml_kem::{EncodedSizeUser, KemCore, MlKem768};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

use crate::error::CryptoError;
use crate::prng::Prng;

/// Encoded ML-KEM-768 encapsulation key size.
pub const PQ_PUBLIC_KEY_SIZE: usize = 1184;

/// ML-KEM-768 ciphertext size.
pub const PQ_CIPHERTEXT_SIZE: usize = 1088;

type PqSecret = <MlKem768 as KemCore>::DecapsulationKey;
type PqPublic = <MlKem768 as KemCore>::EncapsulationKey;
type PqPublicBytes = Array<u8, <PqPublic as EncodedSizeUser>::EncodedSize>;
type PqCiphertext = Array<u8, <MlKem768 as KemCore>::CiphertextSize>;

/// Public and secret key exchange material for one run.
pub struct HybridKx {
    x25519_secret: StaticSecret,
    x25519_public: PublicKey,
    pq_secret: PqSecret,
    pq_public: PqPublic,
    /// Secrets we encapsulated to each peer, indexed by peer.
    pq_cleartexts: Vec<[u8; 32]>,
}

impl std::fmt::Debug for HybridKx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HybridKx")
            .field("x25519_public", &hex::encode(self.x25519_public.as_bytes()))
            .field("secret", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

impl Drop for HybridKx {
    fn drop(&mut self) {
        self.pq_cleartexts.zeroize();
    }
}

impl HybridKx {
    /// Generate X25519 and ML-KEM keys from the run PRNG, in that order.
    pub fn generate(prng: &mut Prng) -> Result<Self, CryptoError> {
        let mut scalar = [0u8; 32];
        rand::RngCore::try_fill_bytes(prng, &mut scalar)?;
        let x25519_secret = StaticSecret::from(scalar);
        scalar.zeroize();
        let x25519_public = PublicKey::from(&x25519_secret);
        let (pq_secret, pq_public) = MlKem768::generate(prng);
        Ok(Self {
            x25519_secret,
            x25519_public,
            pq_secret,
            pq_public,
            pq_cleartexts: Vec::new(),
        })
    }

    /// Our X25519 public value.
    pub fn x25519_public(&self) -> [u8; 32] {
        *self.x25519_public.as_bytes()
    }

    /// Our encoded ML-KEM encapsulation key.
    pub fn pq_public(&self) -> Vec<u8> {
        self.pq_public.as_bytes().to_vec()
    }

    /// Encapsulate a fresh secret to each peer's encapsulation key.
    ///
    /// Returns the ciphertexts indexed by peer and remembers the cleartext
    /// secrets for [`combined_secret`](Self::combined_secret). The PRNG must
    /// be [`Prng::encapsulation`] for the committed seed and the current run.
    pub fn encapsulate(
        &mut self,
        prng: &mut Prng,
        pubkeys: &[Vec<u8>],
    ) -> Result<Vec<Vec<u8>>, CryptoError> {
        self.pq_cleartexts.zeroize();
        self.pq_cleartexts = Vec::with_capacity(pubkeys.len());
        let mut cts = Vec::with_capacity(pubkeys.len());
        for pk in pubkeys {
            let encoded = PqPublicBytes::try_from(pk.as_slice()).map_err(|_| {
                CryptoError::InvalidKeyLength {
                    expected: PQ_PUBLIC_KEY_SIZE,
                    actual: pk.len(),
                }
            })?;
            let ek = PqPublic::from_bytes(&encoded);
            let (ct, shared) = ek
                .encapsulate(prng)
                .map_err(|e| CryptoError::Kem(format!("encapsulate: {e:?}")))?;
            let mut cleartext = [0u8; 32];
            cleartext.copy_from_slice(&shared);
            self.pq_cleartexts.push(cleartext);
            cts.push(ct.to_vec());
        }
        Ok(cts)
    }

    /// The combined pairwise secret with `peer`.
    ///
    /// `their_ct` is the ciphertext `peer` encapsulated to us. For our own
    /// index the decapsulated and cleartext secrets are equal, so the KEM
    /// secret is only mixed in once.
    pub fn combined_secret(
        &self,
        peer: usize,
        their_ecdh: &[u8; 32],
        their_ct: &[u8],
        my: usize,
    ) -> Result<[u8; 32], CryptoError> {
        if their_ct.len() != PQ_CIPHERTEXT_SIZE {
            return Err(CryptoError::InvalidCiphertextLength {
                expected: PQ_CIPHERTEXT_SIZE,
                actual: their_ct.len(),
            });
        }
        let cleartext = self.pq_cleartexts.get(peer).ok_or_else(|| {
            CryptoError::PeerCount(format!("no encapsulated secret for peer {peer}"))
        })?;

        let their_public = PublicKey::from(*their_ecdh);
        let mut shared = self.x25519_secret.diffie_hellman(&their_public).to_bytes();

        let ct = PqCiphertext::try_from(their_ct).map_err(|_| CryptoError::InvalidCiphertextLength {
            expected: PQ_CIPHERTEXT_SIZE,
            actual: their_ct.len(),
        })?;
        let decapsulated = self
            .pq_secret
            .decapsulate(&ct)
            .map_err(|e| CryptoError::Kem(format!("decapsulate: {e:?}")))?;

        xor_into(&mut shared, &decapsulated);
        if peer != my {
            xor_into(&mut shared, cleartext);
        }
        Ok(shared)
    }
}

fn xor_into(dst: &mut [u8; 32], src: &[u8]) {
    for (d, s) in dst.iter_mut().zip(src) {
        *d ^= s;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn pair() -> (HybridKx, Prng, HybridKx, Prng) {
        let mut pa = Prng::new(&[1u8; 32], 0);
        let mut pb = Prng::new(&[2u8; 32], 0);
        let a = HybridKx::generate(&mut pa).unwrap();
        let b = HybridKx::generate(&mut pb).unwrap();
        (a, pa, b, pb)
    }

    #[test]
    fn generation_is_deterministic_per_seed_and_run() {
        let a = HybridKx::generate(&mut Prng::new(&[8u8; 32], 4)).unwrap();
        let b = HybridKx::generate(&mut Prng::new(&[8u8; 32], 4)).unwrap();
        let c = HybridKx::generate(&mut Prng::new(&[8u8; 32], 5)).unwrap();
        assert_eq!(a.x25519_public(), b.x25519_public());
        assert_eq!(a.pq_public(), b.pq_public());
        assert_ne!(a.x25519_public(), c.x25519_public());
        assert_eq!(a.pq_public().len(), PQ_PUBLIC_KEY_SIZE);
    }

    #[test]
    fn encapsulation_is_deterministic() {
        let (a, _, _, _) = pair();
        let pks = vec![a.pq_public()];
        let (mut x, mut px, _, _) = pair();
        let (mut y, mut py, _, _) = pair();
        assert_eq!(
            x.encapsulate(&mut px, &pks).unwrap(),
            y.encapsulate(&mut py, &pks).unwrap()
        );
    }

    #[test]
    fn combined_secret_is_symmetric() {
        let (mut a, mut pa, mut b, mut pb) = pair();
        let pks = vec![a.pq_public(), b.pq_public()];
        let cts_a = a.encapsulate(&mut pa, &pks).unwrap();
        let cts_b = b.encapsulate(&mut pb, &pks).unwrap();
        assert_eq!(cts_a[1].len(), PQ_CIPHERTEXT_SIZE);

        let ab = a.combined_secret(1, &b.x25519_public(), &cts_b[0], 0).unwrap();
        let ba = b.combined_secret(0, &a.x25519_public(), &cts_a[1], 1).unwrap();
        assert_eq!(ab, ba);

        let aa = a.combined_secret(0, &a.x25519_public(), &cts_a[0], 0).unwrap();
        assert_ne!(aa, [0u8; 32]);
        assert_ne!(aa, ab);
    }

    #[test]
    fn encapsulate_rejects_short_public_key() {
        let (mut a, mut pa, _, _) = pair();
        let result = a.encapsulate(&mut pa, &[vec![0u8; 10]]);
        assert!(matches!(
            result,
            Err(CryptoError::InvalidKeyLength { expected: PQ_PUBLIC_KEY_SIZE, actual: 10 })
        ));
    }

    #[test]
    fn combined_secret_rejects_bad_ciphertext_length() {
        let (mut a, mut pa, b, _) = pair();
        let pks = vec![a.pq_public(), b.pq_public()];
        a.encapsulate(&mut pa, &pks).unwrap();
        let result = a.combined_secret(1, &b.x25519_public(), &[0u8; 5], 0);
        assert!(matches!(
            result,
            Err(CryptoError::InvalidCiphertextLength { actual: 5, .. })
        ));
    }

    #[test]
    fn debug_redacts_secrets() {
        let (a, _, _, _) = pair();
        let dbg = format!("{a:?}");
        assert!(dbg.contains("REDACTED"));
    }
}
