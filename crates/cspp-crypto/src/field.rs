//! Arithmetic over the slot reservation field `F = 2^127 - 1`.
//!
//! Peers publish padded power sums of their random slot reservation values;
//! once the pads cancel, the coordinator recovers the values as the roots of
//! the polynomial given by Newton's identities. Only the helpers a client (or
//! a blame verifier) needs live here; root finding itself is the
//! coordinator's job.

use std::sync::LazyLock;

use num_bigint::BigUint;
use rand::RngCore;

use crate::error::CryptoError;

/// Width in bytes of a zero-padded big-endian field element.
pub const FIELD_BYTES: usize = 16;

static F: LazyLock<BigUint> = LazyLock::new(|| (BigUint::from(1u8) << 127usize) - 1u8);

/// The field prime.
pub fn field_prime() -> &'static BigUint {
    &F
}

/// Whether `x` lies in `[0, F)`.
pub fn in_field(x: &BigUint) -> bool {
    x < &*F
}

/// Draw a uniformly random field element by rejection sampling.
pub fn random_field_element<R: RngCore + ?Sized>(rng: &mut R) -> Result<BigUint, CryptoError> {
    loop {
        let mut buf = [0u8; FIELD_BYTES];
        rng.try_fill_bytes(&mut buf)?;
        buf[0] &= 0x7f;
        let x = BigUint::from_bytes_be(&buf);
        if in_field(&x) {
            return Ok(x);
        }
    }
}

/// Fixed-width big-endian encoding of a field element.
pub fn to_fixed_bytes(x: &BigUint) -> Result<[u8; FIELD_BYTES], CryptoError> {
    if !in_field(x) {
        return Err(CryptoError::NotInField);
    }
    let bytes = x.to_bytes_be();
    let mut out = [0u8; FIELD_BYTES];
    out[FIELD_BYTES - bytes.len()..].copy_from_slice(&bytes);
    Ok(out)
}

/// `(a - b) mod F` for values already reduced into the field.
pub(crate) fn sub_mod(a: &BigUint, b: &BigUint) -> BigUint {
    (a + &*F - (b % &*F)) % &*F
}

/// Multiplicative inverse by Fermat's little theorem.
pub fn inverse(x: &BigUint) -> BigUint {
    let exp = &*F - 2u8;
    x.modpow(&exp, &F)
}

/// Sum each element position of the vectors over F.
///
/// With honest peers the pads cancel and the result is the vector of
/// message power sums.
pub fn add_vectors(vs: &[Vec<BigUint>]) -> Vec<BigUint> {
    let n = vs.first().map_or(0, Vec::len);
    (0..n)
        .map(|i| vs.iter().fold(BigUint::default(), |acc, v| acc + &v[i]) % &*F)
        .collect()
}

/// Coefficients `a0..an` of the polynomial whose roots are the mixed
/// messages, from the power sums `S`.
///
/// `an = -1` and each lower coefficient follows Newton's identities:
/// `a(n-k) = -(1/k) * sum_{j<k} a(n-k+1+j) * S(j)`. The result is one
/// element longer than `s`.
pub fn coefficients(s: &[BigUint]) -> Vec<BigUint> {
    let n = s.len() + 1;
    let mut a = vec![BigUint::default(); n];
    a[n - 1] = &*F - 1u8;
    for i in 0..n - 1 {
        let mut acc = BigUint::default();
        for (j, sj) in s.iter().enumerate().take(i + 1) {
            acc += &a[n - 1 - i + j] * sj;
        }
        let xinv = sub_mod(&BigUint::default(), &inverse(&BigUint::from(i + 1)));
        a[n - 2 - i] = (acc * xinv) % &*F;
    }
    a
}

/// Whether `m` is a root of the polynomial with coefficients `a`.
pub fn is_root(m: &BigUint, a: &[BigUint]) -> bool {
    let mut sum = BigUint::default();
    let mut power = BigUint::from(1u8);
    for coeff in a {
        sum = (sum + &power * coeff) % &*F;
        power = (power * m) % &*F;
    }
    sum == BigUint::default()
}
