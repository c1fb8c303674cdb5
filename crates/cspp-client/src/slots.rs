//! Slot resolution against the coordinator's recovered roots.

use cspp_crypto::FIELD_BYTES;
use cspp_crypto::field::{in_field, to_fixed_bytes};
use num_bigint::BigUint;
use subtle::{ConditionallySelectable, ConstantTimeEq};
use zeroize::Zeroize;

use crate::error::MixError;

/// Not the encoding of any field element, since the top bit of `F` is clear.
const NO_MATCH: [u8; FIELD_BYTES] = [0xff; FIELD_BYTES];

/// Check every root lies in the field, then order them ascending.
///
/// Slot `i` of the DC-net is the `i`th smallest root, so every peer must
/// derive the same order.
pub fn sort_roots(roots: &mut [BigUint]) -> Result<(), MixError> {
    if let Some(bad) = roots.iter().find(|r| !in_field(r)) {
        return Err(MixError::RootNotInField(bad.to_str_radix(16)));
    }
    roots.sort_unstable();
    Ok(())
}

/// Index of `secret` among `roots`.
///
/// Compares fixed-width encodings of every root without branching on secret
/// data, so timing does not reveal which slot was reserved.
pub fn constant_time_search(secret: &BigUint, roots: &[BigUint]) -> Option<usize> {
    let Ok(mut want) = to_fixed_bytes(secret) else {
        return None;
    };
    let mut slot: i64 = -1;
    for (i, root) in roots.iter().enumerate() {
        let mut have = to_fixed_bytes(root).unwrap_or(NO_MATCH);
        let eq = want[..].ct_eq(&have[..]);
        slot = i64::conditional_select(&slot, &(i as i64), eq);
        have.zeroize();
    }
    want.zeroize();
    usize::try_from(slot).ok()
}

/// Resolve the reserved slot of every own slot reservation value.
///
/// Returns `None` when any value is missing or two values share a slot;
/// either way this peer cannot complete the DC-net.
pub fn resolve_slots(secrets: &[BigUint], roots: &[BigUint]) -> Option<Vec<usize>> {
    let mut slots = Vec::with_capacity(secrets.len());
    for secret in secrets {
        let slot = constant_time_search(secret, roots)?;
        if slots.contains(&slot) {
            return None;
        }
        slots.push(slot);
    }
    Some(slots)
}
