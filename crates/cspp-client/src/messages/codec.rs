//! Serde helpers for the JSON wire encoding.
//!
//! Byte strings travel as lowercase hex, field elements as the hex string of
//! their big-endian value.

use num_bigint::BigUint;
use serde::{Deserialize, Deserializer, Serializer};

fn parse_field<E: serde::de::Error>(s: &str) -> Result<BigUint, E> {
    BigUint::parse_bytes(s.as_bytes(), 16)
        .ok_or_else(|| E::custom(format!("invalid field element {s:?}")))
}

/// `Vec<Vec<u8>>` as a list of hex strings.
pub mod hex_seq {
    use serde::de::Error;

    use super::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &[Vec<u8>], s: S) -> Result<S::Ok, S::Error> {
        s.collect_seq(v.iter().map(hex::encode))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<Vec<u8>>, D::Error> {
        Vec::<String>::deserialize(d)?
            .iter()
            .map(|s| hex::decode(s).map_err(D::Error::custom))
            .collect()
    }
}

/// `Vec<BigUint>` as a list of hex strings.
pub mod field_seq {
    use super::{BigUint, Deserialize, Deserializer, Serializer, parse_field};

    pub fn serialize<S: Serializer>(v: &[BigUint], s: S) -> Result<S::Ok, S::Error> {
        s.collect_seq(v.iter().map(|x| x.to_str_radix(16)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<BigUint>, D::Error> {
        Vec::<String>::deserialize(d)?
            .iter()
            .map(|s| parse_field(s))
            .collect()
    }
}

/// `Vec<Vec<BigUint>>` as nested lists of hex strings.
pub mod field_seq_seq {
    use super::{BigUint, Deserialize, Deserializer, Serializer, parse_field};

    pub fn serialize<S: Serializer>(v: &[Vec<BigUint>], s: S) -> Result<S::Ok, S::Error> {
        s.collect_seq(
            v.iter()
                .map(|inner| inner.iter().map(|x| x.to_str_radix(16)).collect::<Vec<_>>()),
        )
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<Vec<BigUint>>, D::Error> {
        Vec::<Vec<String>>::deserialize(d)?
            .iter()
            .map(|inner| inner.iter().map(|s| parse_field(s)).collect())
            .collect()
    }
}
