//! DC-net pads and vectors.
//!
//! Two mixes run over the same pairwise shared keys:
//!
//! - the exponential slot reservation mix, where every message slot carries
//!   padded power sums `m^k + pad_k (mod F)`;
//! - the XOR DC-net, where every peer publishes an `mtot`-slot vector of pad
//!   bytes with its message XORed into the slot it reserved.
//!
//! Pads of honest peers cancel pairwise, so only the messages survive the
//! coordinator's sum.

use std::fmt;

use hkdf::Hkdf;
use num_bigint::BigUint;
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

use crate::error::CryptoError;
use crate::field::{field_prime, sub_mod};
use crate::kx::HybridKx;
use crate::prng::Prng;

/// HKDF info prefix for pairwise pad seeds.
const PAD_SEED_INFO: &[u8] = b"cspp-dcnet-pad-seed-v1";

/// An `n`-slot vector of `msize`-byte messages.
#[derive(Clone, PartialEq, Eq)]
pub struct DcVec {
    pub n: usize,
    pub msize: usize,
    pub data: Vec<u8>,
}

impl DcVec {
    /// A zero vector holding `n` messages of `msize` bytes.
    pub fn new(n: usize, msize: usize) -> Self {
        Self {
            n,
            msize,
            data: vec![0u8; n * msize],
        }
    }

    /// Whether the vector has dimensions `n`-by-`msize`.
    pub const fn is_dim(&self, n: usize, msize: usize) -> bool {
        self.n == n && self.msize == msize && self.data.len() == n * msize
    }

    /// The `i`th message.
    pub fn m(&self, i: usize) -> &[u8] {
        &self.data[i * self.msize..(i + 1) * self.msize]
    }

    fn m_mut(&mut self, i: usize) -> &mut [u8] {
        &mut self.data[i * self.msize..(i + 1) * self.msize]
    }

    /// XOR `other` into this vector.
    pub fn xor_assign(&mut self, other: &Self) -> Result<(), CryptoError> {
        if !other.is_dim(self.n, self.msize) || !self.is_dim(self.n, self.msize) {
            return Err(CryptoError::VectorDimension {
                left_n: self.n,
                left_msize: self.msize,
                right_n: other.n,
                right_msize: other.msize,
            });
        }
        for (d, s) in self.data.iter_mut().zip(&other.data) {
            *d ^= s;
        }
        Ok(())
    }
}

impl fmt::Display for DcVec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for i in 0..self.n {
            if i != 0 {
                f.write_str(" ")?;
            }
            f.write_str(&hex::encode(self.m(i)))?;
        }
        f.write_str("]")
    }
}

impl fmt::Debug for DcVec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DcVec({}x{} {self})", self.n, self.msize)
    }
}

/// XOR of all vectors. Fails when dimensions differ.
pub fn xor_vectors(vs: &[DcVec]) -> Result<DcVec, CryptoError> {
    let Some(first) = vs.first() else {
        return Ok(DcVec::new(0, 0));
    };
    let mut res = DcVec::new(first.n, first.msize);
    for v in vs {
        res.xor_assign(v)?;
    }
    Ok(res)
}

/// Exponential DC-net pads for the message at global index `my`.
///
/// Pad `j` is the signed sum over every other slot `i` of
/// `SHA-256(kp[i] || le64(j + 1))`, added when `my > i` and subtracted
/// otherwise, so that each pair's contributions cancel.
pub fn sr_mix_pads(kp: &[[u8; 32]], my: usize) -> Vec<BigUint> {
    (0..kp.len())
        .map(|j| {
            let counter = (j as u64 + 1).to_le_bytes();
            kp.iter()
                .enumerate()
                .filter(|(i, _)| *i != my)
                .fold(BigUint::default(), |pad, (i, key)| {
                    let digest = Sha256::new()
                        .chain_update(key)
                        .chain_update(counter)
                        .finalize();
                    let partial = BigUint::from_bytes_be(&digest) % field_prime();
                    if my > i {
                        (pad + partial) % field_prime()
                    } else {
                        sub_mod(&pad, &partial)
                    }
                })
        })
        .collect()
}

/// The padded exponential vector `{m^1, m^2, ..., m^n}` for message `m`.
///
/// `m` must be in the field and unique to this slot reservation run.
pub fn sr_mix(m: &BigUint, pads: &[BigUint]) -> Vec<BigUint> {
    pads.iter()
        .zip(1u32..)
        .map(|(pad, k)| (m.modpow(&BigUint::from(k), field_prime()) + pad) % field_prime())
        .collect()
}

/// XOR DC-net pads for the message at global index `my`.
pub fn dc_mix_pads(kp: &[DcVec], msize: usize, my: usize) -> Result<DcVec, CryptoError> {
    let mut pads = DcVec::new(kp.len(), msize);
    for (i, key) in kp.iter().enumerate() {
        if i == my {
            continue;
        }
        pads.xor_assign(key)?;
    }
    Ok(pads)
}

/// The DC-net vector with `m` XORed into reserved `slot` of `pads`.
pub fn dc_mix(pads: &DcVec, m: &[u8], slot: usize) -> Result<DcVec, CryptoError> {
    if slot >= pads.n {
        return Err(CryptoError::SlotOutOfRange { slot, n: pads.n });
    }
    if m.len() != pads.msize {
        return Err(CryptoError::MessageLength {
            expected: pads.msize,
            actual: m.len(),
        });
    }
    let mut mix = pads.clone();
    for (d, s) in mix.m_mut(slot).iter_mut().zip(m) {
        *d ^= s;
    }
    Ok(mix)
}

/// Pairwise shared keys for every own message against every global slot.
///
/// `sr[i][m]` and `dc[i][m]` are the keys between own message `i` and the
/// message at global index `m`. The entry at the own message's global index
/// is left zeroed and is never used by the pad functions.
pub struct SharedKeys {
    pub sr: Vec<Vec<[u8; 32]>>,
    pub dc: Vec<Vec<DcVec>>,
}

impl Drop for SharedKeys {
    fn drop(&mut self) {
        for keys in &mut self.sr {
            keys.zeroize();
        }
        for keys in &mut self.dc {
            for key in keys {
                key.data.zeroize();
            }
        }
    }
}

/// Parameters binding derived pad keys to one run.
#[derive(Debug, Clone, Copy)]
pub struct PadContext<'a> {
    pub sid: &'a [u8],
    pub run: u32,
    pub msize: usize,
    pub my: usize,
    pub mcounts: &'a [usize],
}

/// Derive the SR and DC shared keys for `mcounts[my]` own messages.
///
/// `ecdh_pubs` and `cts` are indexed by peer and must be as long as
/// `mcounts`. `cts[peer]` is the ciphertext that `peer` encapsulated to us.
pub fn shared_keys(
    kx: &HybridKx,
    ecdh_pubs: &[[u8; 32]],
    cts: &[Vec<u8>],
    ctx: &PadContext<'_>,
) -> Result<SharedKeys, CryptoError> {
    let mcounts = ctx.mcounts;
    if ecdh_pubs.len() != mcounts.len() {
        return Err(CryptoError::PeerCount(format!(
            "{} x25519 public keys for {} peers",
            ecdh_pubs.len(),
            mcounts.len()
        )));
    }
    if cts.len() != mcounts.len() {
        return Err(CryptoError::PeerCount(format!(
            "{} ciphertexts for {} peers",
            cts.len(),
            mcounts.len()
        )));
    }
    let my = ctx.my;
    let mcount = mcounts[my];
    let mtot: usize = mcounts.iter().sum();

    let mut sr = Vec::with_capacity(mcount);
    let mut dc = Vec::with_capacity(mcount);
    for i in 0..mcount {
        let mut sr_i = vec![[0u8; 32]; mtot];
        let mut dc_i = vec![DcVec::new(mtot, ctx.msize); mtot];
        let mut m = 0usize;
        for (peer, &peer_mcount) in mcounts.iter().enumerate() {
            if peer == my && mcount == 1 {
                m += 1;
                continue;
            }
            let mut shared = kx.combined_secret(peer, &ecdh_pubs[peer], &cts[peer], my)?;
            let hk = Hkdf::<Sha256>::new(Some(ctx.sid), &shared);
            shared.zeroize();

            for j in 0..peer_mcount {
                if peer == my && j == i {
                    m += 1;
                    continue;
                }
                // The lower peer index owns the seed counter, the higher one
                // the stream nonce; both sides of the pair agree. Pairs of
                // our own messages reverse roles for the upper half.
                let (seed_counter, nonce) = if my > peer || (my == peer && j > i) {
                    (j, i)
                } else {
                    (i, j)
                };
                let mut info = Vec::with_capacity(PAD_SEED_INFO.len() + 8);
                info.extend_from_slice(PAD_SEED_INFO);
                info.extend_from_slice(&ctx.run.to_le_bytes());
                info.extend_from_slice(&(seed_counter as u32).to_le_bytes());
                let mut seed = [0u8; 32];
                hk.expand(&info, &mut seed)
                    .map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()))?;
                let mut prng = Prng::new(&seed, nonce as u32);
                seed.zeroize();

                let mut sr_key = prng.next_bytes(32);
                sr_i[m].copy_from_slice(&sr_key);
                sr_key.zeroize();
                dc_i[m].data = prng.next_bytes(mtot * ctx.msize);
                m += 1;
            }
        }
        sr.push(sr_i);
        dc.push(dc_i);
    }
    Ok(SharedKeys { sr, dc })
}
