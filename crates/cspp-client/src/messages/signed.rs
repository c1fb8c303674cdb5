//! Signed message preimages and per-run context hashes.

use std::sync::Arc;

use cspp_crypto::{SessionKeyPair, verify_signature};
use num_bigint::BigUint;
use sha2::{Digest, Sha256};

/// Incremental SHA-256 over a tagged, length-prefixed preimage.
///
/// Integers are written as 8-byte big-endian values and byte strings are
/// prefixed by their 8-byte big-endian length, so no two distinct field
/// sequences share an encoding.
pub struct Preimage {
    hasher: Sha256,
}

impl Preimage {
    pub fn new(tag: &[u8]) -> Self {
        let mut p = Self {
            hasher: Sha256::new(),
        };
        p.bytes(tag);
        p
    }

    pub fn int(&mut self, v: u64) -> &mut Self {
        self.hasher.update(v.to_be_bytes());
        self
    }

    pub fn bool(&mut self, v: bool) -> &mut Self {
        self.hasher.update([u8::from(v)]);
        self
    }

    pub fn bytes(&mut self, b: &[u8]) -> &mut Self {
        self.int(b.len() as u64);
        self.hasher.update(b);
        self
    }

    pub fn byte_slices<B: AsRef<[u8]>>(&mut self, bs: &[B]) -> &mut Self {
        self.int(bs.len() as u64);
        for b in bs {
            self.bytes(b.as_ref());
        }
        self
    }

    /// A field element, prefixed by a sign byte.
    pub fn field(&mut self, x: &BigUint) -> &mut Self {
        let sign = u8::from(*x != BigUint::default());
        self.hasher.update([sign]);
        self.bytes(&x.to_bytes_be())
    }

    pub fn fields(&mut self, xs: &[BigUint]) -> &mut Self {
        self.int(xs.len() as u64);
        for x in xs {
            self.field(x);
        }
        self
    }

    pub fn finish(self) -> [u8; 32] {
        self.hasher.finalize().into()
    }
}

/// A message whose sender signs a digest of its fields.
pub trait Signed {
    /// The signature carried by the message.
    fn signature(&self) -> &[u8];

    /// Hash the signed fields. The signature itself is excluded.
    fn write_preimage(&self) -> Preimage;

    fn signed_digest(&self) -> [u8; 32] {
        self.write_preimage().finish()
    }

    /// Check the carried signature against an ed25519 public key.
    fn verify_signature(&self, public: &[u8]) -> bool {
        verify_signature(public, &self.signed_digest(), self.signature())
    }
}

pub(crate) fn sign(keys: &SessionKeyPair, msg: &impl Signed) -> Vec<u8> {
    keys.sign(&msg.signed_digest()).to_vec()
}

/// Session state shared by every message of one run.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub sid: Vec<u8>,
    pub run: u32,
    pub vk: Vec<[u8; 32]>,
    /// Hash of the session id, roster and run index.
    pub sid_h: [u8; 32],
    /// Hash of the session id and run index only.
    pub sid_h_pre: [u8; 32],
    keys: Arc<SessionKeyPair>,
}

impl RunContext {
    pub fn new(sid: Vec<u8>, run: u32, vk: Vec<[u8; 32]>, keys: Arc<SessionKeyPair>) -> Self {
        let mut h = Preimage::new(b"sidH");
        h.bytes(&sid).byte_slices(&vk).int(u64::from(run));
        let sid_h = h.finish();

        let mut h = Preimage::new(b"sidHPre");
        h.bytes(&sid).int(u64::from(run));
        let sid_h_pre = h.finish();

        Self {
            sid,
            run,
            vk,
            sid_h,
            sid_h_pre,
            keys,
        }
    }

    pub fn keys(&self) -> &SessionKeyPair {
        &self.keys
    }
}
