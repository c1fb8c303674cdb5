//! Wire messages exchanged with the mixing coordinator.
//!
//! Every message is one JSON object per line. Client messages that carry a
//! `signature` are signed over a [`Preimage`] of their other fields.

mod codec;
mod signed;

use cspp_crypto::DcVec;
use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

pub use signed::{Preimage, RunContext, Signed};
pub(crate) use signed::sign;

/// Error reported by the coordinator in place of a protocol message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ServerError {
    #[error("server aborted mix session")]
    AbortedSession,

    #[error("server rejected unmixed data")]
    InvalidUnmixed,

    #[error("too few peers to mix")]
    TooFewPeers,

    #[error("unknown server error code {0}")]
    Unknown(u32),
}

impl ServerError {
    /// Map a wire error code. Zero means no error.
    pub const fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => None,
            1 => Some(Self::AbortedSession),
            2 => Some(Self::InvalidUnmixed),
            3 => Some(Self::TooFewPeers),
            other => Some(Self::Unknown(other)),
        }
    }

    pub const fn code(self) -> u32 {
        match self {
            Self::AbortedSession => 1,
            Self::InvalidUnmixed => 2,
            Self::TooFewPeers => 3,
            Self::Unknown(code) => code,
        }
    }
}

/// Messages that may carry a coordinator error code.
pub trait ServerErrorCode {
    fn server_error(&self) -> Option<ServerError>;
}

/// Coordinator replies that may redirect the run instead of advancing it.
pub trait Reply: ServerErrorCode {
    /// Take an embedded roster for a new run, if any.
    fn take_begin_run(&mut self) -> Option<BeginRun>;

    /// Whether the coordinator asks every peer to reveal its secrets.
    fn reveal_secrets(&self) -> bool {
        false
    }
}

macro_rules! impl_server_error_code {
    ($($ty:ty),* $(,)?) => {
        $(impl ServerErrorCode for $ty {
            fn server_error(&self) -> Option<ServerError> {
                ServerError::from_code(self.err)
            }
        })*
    };
}

macro_rules! impl_reply {
    ($($ty:ty),* $(,)?) => {
        $(impl Reply for $ty {
            fn take_begin_run(&mut self) -> Option<BeginRun> {
                self.br.take()
            }
        })*
    };
}

impl_server_error_code!(
    BeginRun,
    KeyExchanges,
    CiphertextsReply,
    RecoveredMessages,
    ConfirmMix,
);
impl_reply!(KeyExchanges, CiphertextsReply);

/// Opening request identifying a peer and its unmixed payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairRequest {
    #[serde(with = "hex::serde")]
    pub identity: Vec<u8>,
    #[serde(with = "hex::serde")]
    pub pair_commitment: Vec<u8>,
    #[serde(with = "hex::serde")]
    pub unmixed: Vec<u8>,
    pub message_count: u32,
    #[serde(with = "hex::serde")]
    pub signature: Vec<u8>,
}

impl PairRequest {
    pub fn new(
        keys: &cspp_crypto::SessionKeyPair,
        pair_commitment: Vec<u8>,
        unmixed: Vec<u8>,
        message_count: u32,
    ) -> Self {
        let mut pr = Self {
            identity: keys.public_bytes().to_vec(),
            pair_commitment,
            unmixed,
            message_count,
            signature: Vec::new(),
        };
        pr.signature = sign(keys, &pr);
        pr
    }
}

impl Signed for PairRequest {
    fn signature(&self) -> &[u8] {
        &self.signature
    }

    fn write_preimage(&self) -> Preimage {
        let mut p = Preimage::new(b"PR");
        p.bytes(&self.identity)
            .bytes(&self.pair_commitment)
            .bytes(&self.unmixed)
            .int(u64::from(self.message_count));
        p
    }
}

/// Roster announcement opening a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeginRun {
    #[serde(with = "codec::hex_seq", default)]
    pub vk: Vec<Vec<u8>>,
    #[serde(default)]
    pub message_counts: Vec<i64>,
    #[serde(with = "hex::serde", default)]
    pub sid: Vec<u8>,
    #[serde(default)]
    pub err: u32,
}

/// Per-run public key exchange and commitment to revealable secrets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyExchange {
    pub run: u32,
    #[serde(with = "hex::serde")]
    pub ecdh: Vec<u8>,
    #[serde(with = "hex::serde")]
    pub pqpk: Vec<u8>,
    #[serde(with = "hex::serde")]
    pub commitment: Vec<u8>,
    #[serde(with = "hex::serde")]
    pub signature: Vec<u8>,
}

impl KeyExchange {
    pub fn new(ecdh: Vec<u8>, pqpk: Vec<u8>, commitment: Vec<u8>, ctx: &RunContext) -> Self {
        let mut ke = Self {
            run: ctx.run,
            ecdh,
            pqpk,
            commitment,
            signature: Vec::new(),
        };
        ke.signature = sign(ctx.keys(), &ke);
        ke
    }
}

impl Signed for KeyExchange {
    fn signature(&self) -> &[u8] {
        &self.signature
    }

    fn write_preimage(&self) -> Preimage {
        let mut p = Preimage::new(b"KE");
        p.int(u64::from(self.run))
            .bytes(&self.ecdh)
            .bytes(&self.pqpk)
            .bytes(&self.commitment);
        p
    }
}

/// Every peer's key exchange, in roster order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyExchanges {
    #[serde(default)]
    pub kes: Vec<Option<KeyExchange>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub br: Option<BeginRun>,
    #[serde(default)]
    pub err: u32,
}

/// Post-quantum ciphertexts encapsulated to every peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ciphertexts {
    #[serde(with = "codec::hex_seq")]
    pub ciphertexts: Vec<Vec<u8>>,
    #[serde(with = "hex::serde")]
    pub signature: Vec<u8>,
}

impl Ciphertexts {
    pub fn new(ciphertexts: Vec<Vec<u8>>, ctx: &RunContext) -> Self {
        let mut ct = Self {
            ciphertexts,
            signature: Vec::new(),
        };
        ct.signature = sign(ctx.keys(), &ct);
        ct
    }
}

impl Signed for Ciphertexts {
    fn signature(&self) -> &[u8] {
        &self.signature
    }

    fn write_preimage(&self) -> Preimage {
        let mut p = Preimage::new(b"CT");
        p.byte_slices(&self.ciphertexts);
        p
    }
}

/// Ciphertexts addressed to this peer, one per roster peer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CiphertextsReply {
    #[serde(with = "codec::hex_seq", default)]
    pub ciphertexts: Vec<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub br: Option<BeginRun>,
    #[serde(default)]
    pub err: u32,
}

/// Exponential slot reservation vectors, one per own message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotReserve {
    pub run: u32,
    #[serde(with = "codec::field_seq_seq")]
    pub dc_mix: Vec<Vec<BigUint>>,
    #[serde(with = "hex::serde")]
    pub signature: Vec<u8>,
}

impl SlotReserve {
    pub fn new(dc_mix: Vec<Vec<BigUint>>, ctx: &RunContext) -> Self {
        let mut sr = Self {
            run: ctx.run,
            dc_mix,
            signature: Vec::new(),
        };
        sr.signature = sign(ctx.keys(), &sr);
        sr
    }
}

impl Signed for SlotReserve {
    fn signature(&self) -> &[u8] {
        &self.signature
    }

    fn write_preimage(&self) -> Preimage {
        let mut p = Preimage::new(b"SR");
        p.int(u64::from(self.run)).int(self.dc_mix.len() as u64);
        for mix in &self.dc_mix {
            p.fields(mix);
        }
        p
    }
}

/// Roots of the slot reservation polynomial solved by the coordinator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveredMessages {
    #[serde(default)]
    pub run: u32,
    #[serde(with = "codec::field_seq", default)]
    pub roots: Vec<BigUint>,
    #[serde(default)]
    pub reveal_secrets: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub br: Option<BeginRun>,
    #[serde(default)]
    pub err: u32,
}

impl Reply for RecoveredMessages {
    fn take_begin_run(&mut self) -> Option<BeginRun> {
        self.br.take()
    }

    fn reveal_secrets(&self) -> bool {
        self.reveal_secrets
    }
}

/// Wire form of one XOR DC-net vector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MixVector {
    pub n: usize,
    pub msize: usize,
    #[serde(with = "hex::serde")]
    pub data: Vec<u8>,
}

impl From<DcVec> for MixVector {
    fn from(v: DcVec) -> Self {
        Self {
            n: v.n,
            msize: v.msize,
            data: v.data,
        }
    }
}

impl From<MixVector> for DcVec {
    fn from(v: MixVector) -> Self {
        Self {
            n: v.n,
            msize: v.msize,
            data: v.data,
        }
    }
}

/// XOR DC-net vectors, one per own message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DcNet {
    pub run: u32,
    pub dc_net: Vec<MixVector>,
    #[serde(default)]
    pub reveal_secrets: bool,
    #[serde(with = "hex::serde")]
    pub signature: Vec<u8>,
}

impl DcNet {
    pub fn new(dc_net: Vec<DcVec>, ctx: &RunContext) -> Self {
        let mut dc = Self {
            run: ctx.run,
            dc_net: dc_net.into_iter().map(MixVector::from).collect(),
            reveal_secrets: false,
            signature: Vec::new(),
        };
        dc.signature = sign(ctx.keys(), &dc);
        dc
    }
}

impl Signed for DcNet {
    fn signature(&self) -> &[u8] {
        &self.signature
    }

    fn write_preimage(&self) -> Preimage {
        let mut p = Preimage::new(b"DC");
        p.int(u64::from(self.run)).int(self.dc_net.len() as u64);
        for v in &self.dc_net {
            p.int(v.n as u64).int(v.msize as u64).bytes(&v.data);
        }
        p.bool(self.reveal_secrets);
        p
    }
}

/// The merged mix, sent by the coordinator for confirmation and returned
/// signed by every peer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmMix {
    #[serde(with = "hex::serde", default)]
    pub mix: Vec<u8>,
    #[serde(default)]
    pub reveal_secrets: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub br: Option<BeginRun>,
    #[serde(default)]
    pub err: u32,
    #[serde(with = "hex::serde", default)]
    pub signature: Vec<u8>,
}

impl ConfirmMix {
    pub fn new(mix: Vec<u8>, ctx: &RunContext) -> Self {
        let mut cm = Self {
            mix,
            ..Self::default()
        };
        cm.signature = sign(ctx.keys(), &cm);
        cm
    }
}

impl Signed for ConfirmMix {
    fn signature(&self) -> &[u8] {
        &self.signature
    }

    fn write_preimage(&self) -> Preimage {
        let mut p = Preimage::new(b"CM");
        p.bytes(&self.mix).bool(self.reveal_secrets);
        p
    }
}

impl Reply for ConfirmMix {
    fn take_begin_run(&mut self) -> Option<BeginRun> {
        self.br.take()
    }

    fn reveal_secrets(&self) -> bool {
        self.reveal_secrets
    }
}

/// Secrets a peer reveals for blame assignment.
///
/// The seed and the run it was keyed with reproduce every key and slot
/// reservation value of the run; `m` holds the anonymized messages.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevealSecrets {
    #[serde(with = "hex::serde")]
    pub seed: Vec<u8>,
    pub seed_run: u32,
    #[serde(with = "codec::field_seq")]
    pub sr: Vec<BigUint>,
    #[serde(with = "codec::hex_seq")]
    pub m: Vec<Vec<u8>>,
}

impl std::fmt::Debug for RevealSecrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RevealSecrets")
            .field("seed", &"[REDACTED]")
            .field("seed_run", &self.seed_run)
            .field("sr", &self.sr.len())
            .field("m", &self.m.len())
            .finish()
    }
}

impl RevealSecrets {
    /// Commitment published in the key exchange before any secret is used.
    ///
    /// Binds the session id and run through the context's `sid_h_pre`.
    pub fn commit(&self, ctx: &RunContext) -> Vec<u8> {
        let mut p = Preimage::new(b"COMMIT");
        p.bytes(&ctx.sid_h_pre)
            .bytes(&self.seed)
            .int(u64::from(self.seed_run))
            .fields(&self.sr)
            .byte_slices(&self.m);
        p.finish().to_vec()
    }
}

impl Drop for RevealSecrets {
    fn drop(&mut self) {
        self.seed.zeroize();
    }
}

/// Sent before [`RevealSecrets`] when this peer detected the failure itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientFailure {
    pub reveal_secrets: bool,
}

impl Default for ClientFailure {
    fn default() -> Self {
        Self {
            reveal_secrets: true,
        }
    }
}
