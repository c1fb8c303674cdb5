//! One run of the mixing protocol.
//!
//! A run is a chain of stages. Each stage owns exactly what the next
//! transition needs and either hands over to the next stage or reroutes the
//! run: to a new run with a roster the coordinator embedded in its reply, or
//! to blame assignment where this peer reveals its secrets.

use cspp_core::MixConfig;
use cspp_crypto::{
    CryptoError, DcVec, HybridKx, PadContext, Prng, SEED_SIZE, SharedKeys, dc_mix, dc_mix_pads,
    random_field_element, shared_keys, sr_mix, sr_mix_pads,
};
use num_bigint::BigUint;
use tracing::{debug, trace, warn};

use crate::confirmer::{GenConfirmer, MESSAGE_SIZE};
use crate::error::MixError;
use crate::messages::{
    BeginRun, Ciphertexts, CiphertextsReply, ConfirmMix, DcNet, KeyExchange, KeyExchanges,
    RecoveredMessages, Reply, RunContext, SlotReserve,
};
use crate::slots::{resolve_slots, sort_roots};
use crate::transport::{Client, Conn};

/// Upper bound on the DC-net pad keys one peer derives in a run.
pub const MAX_PAD_BYTES: usize = 1 << 28;

/// Who detected the failure that triggers blame assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Blame {
    /// The coordinator asked every peer to reveal its secrets.
    Server,
    /// This peer could not complete the run.
    Client,
}

/// Where a run goes instead of its next stage.
#[derive(Debug)]
pub enum Reroute {
    BeginRun(BeginRun),
    RevealSecrets(Blame),
}

/// Result of one stage transition.
#[derive(Debug)]
pub enum Step<T> {
    Continue(T),
    Reroute(Reroute),
}

/// How a run that did not fail fatally ended.
#[derive(Debug)]
pub enum RunOutcome {
    Confirmed,
    RerunWithRoster(BeginRun),
    Rerun,
}

/// Inspect a coordinator reply for an embedded roster or a reveal request.
///
/// A roster without keys is ignored.
pub fn check_reroute<M: Reply>(msg: &mut M) -> Option<Reroute> {
    if let Some(br) = msg.take_begin_run().filter(|br| !br.vk.is_empty()) {
        return Some(Reroute::BeginRun(br));
    }
    msg.reveal_secrets()
        .then_some(Reroute::RevealSecrets(Blame::Server))
}

/// Validated participants of a run.
#[derive(Debug, Clone)]
pub struct Roster {
    pub sid: Vec<u8>,
    pub vk: Vec<[u8; 32]>,
    pub mcounts: Vec<usize>,
    /// Our index in the roster.
    pub my: usize,
    /// Global index of our first message.
    pub my_start: usize,
    pub mtot: usize,
}

impl Roster {
    pub fn from_begin_run(br: BeginRun, own: &[u8; 32], mcount: u32) -> Result<Self, MixError> {
        if br.vk.len() != br.message_counts.len() {
            return Err(MixError::InvalidRoster(format!(
                "{} keys but {} message counts",
                br.vk.len(),
                br.message_counts.len()
            )));
        }

        let mut vk: Vec<[u8; 32]> = Vec::with_capacity(br.vk.len());
        for (i, key) in br.vk.iter().enumerate() {
            let key = <[u8; 32]>::try_from(key.as_slice()).map_err(|_| {
                MixError::InvalidRoster(format!("key {i} is {} bytes", key.len()))
            })?;
            if vk.contains(&key) {
                return Err(MixError::InvalidRoster(format!("duplicate key at {i}")));
            }
            vk.push(key);
        }

        let my = vk
            .iter()
            .position(|k| k == own)
            .ok_or_else(|| MixError::InvalidRoster("own key not in roster".to_string()))?;
        if br.message_counts[my] != i64::from(mcount) {
            return Err(MixError::SelfMessageCount {
                expected: mcount as usize,
                actual: br.message_counts[my],
            });
        }

        let mut mcounts = Vec::with_capacity(br.message_counts.len());
        for (i, &count) in br.message_counts.iter().enumerate() {
            let count = usize::try_from(count)
                .ok()
                .filter(|&c| c > 0)
                .ok_or_else(|| {
                    MixError::InvalidRoster(format!("peer {i} declares {count} messages"))
                })?;
            mcounts.push(count);
        }
        let total = |counts: &[usize]| {
            counts
                .iter()
                .try_fold(0usize, |acc, &c| acc.checked_add(c))
                .ok_or_else(|| MixError::InvalidRoster("message count overflow".to_string()))
        };
        let my_start = total(&mcounts[..my])?;
        let mtot = total(&mcounts)?;
        let pad_bytes = mtot
            .checked_mul(mtot)
            .and_then(|n| n.checked_mul(mcount as usize))
            .and_then(|n| n.checked_mul(MESSAGE_SIZE));
        if pad_bytes.is_none_or(|n| n > MAX_PAD_BYTES) {
            return Err(MixError::InvalidRoster(format!(
                "{mtot} messages exceed the DC-net size limit"
            )));
        }

        Ok(Self {
            sid: br.sid,
            vk,
            mcounts,
            my,
            my_start,
            mtot,
        })
    }

    pub fn peer_count(&self) -> usize {
        self.vk.len()
    }
}

/// Per-run secrets derived from the session seed.
#[derive(Debug)]
pub struct RunKeys {
    /// Encapsulation randomness for the current run.
    pub encap: Prng,
    pub kx: HybridKx,
    /// Slot reservation values, one per own message.
    pub sr: Vec<BigUint>,
}

impl RunKeys {
    /// Derive, in order, the key exchange keys and `mcount` slot
    /// reservation values from the seed keyed to `seed_run`.
    ///
    /// Encapsulation randomness comes from the seed's stream for `run`, so
    /// a rerun that keeps its keys never repeats an earlier encapsulation.
    pub fn derive(
        seed: &[u8; SEED_SIZE],
        seed_run: u32,
        run: u32,
        mcount: usize,
    ) -> Result<Self, CryptoError> {
        let mut prng = Prng::new(seed, seed_run);
        let kx = HybridKx::generate(&mut prng)?;
        let sr = (0..mcount)
            .map(|_| random_field_element(&mut prng))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            encap: Prng::encapsulation(seed, run),
            kx,
            sr,
        })
    }
}

/// Everything a stage needs besides its own state.
pub struct RunIo<'a, C> {
    pub client: &'a mut Client<C>,
    pub config: &'a MixConfig,
    pub ctx: &'a RunContext,
    pub roster: &'a Roster,
}

impl<C: Conn> RunIo<'_, C> {
    /// Receive the coordinator's reply to the message just sent.
    #[track_caller]
    fn reply<M>(&mut self) -> impl Future<Output = Result<M, MixError>>
    where
        M: Reply + serde::de::DeserializeOwned,
    {
        let recv = self.client.recv(Some(self.config.recv_timeout()));
        async move { Ok(recv.await?) }
    }
}

macro_rules! advance {
    ($step:expr) => {
        match $step {
            Step::Continue(next) => next,
            Step::Reroute(reroute) => return Ok(Some(reroute)),
        }
    };
}

/// Drive a run from key exchange to the final confirmation.
///
/// Returns `None` once the mix is confirmed.
pub async fn drive<C: Conn, G: GenConfirmer>(
    io: &mut RunIo<'_, C>,
    start: KeyExchangeStage,
    gen_conf: &mut G,
) -> Result<Option<Reroute>, MixError> {
    let stage = advance!(start.exchange(io).await?);
    let stage = advance!(stage.exchange(io).await?);
    let stage = advance!(stage.reserve(io).await?);
    advance!(stage.mix(io, gen_conf).await?);
    Ok(None)
}

/// Publish our public keys and the commitment to our secrets.
pub struct KeyExchangeStage {
    pub keys: RunKeys,
    pub messages: Vec<Vec<u8>>,
    pub commitment: Vec<u8>,
}

impl KeyExchangeStage {
    async fn exchange<C: Conn>(
        self,
        io: &mut RunIo<'_, C>,
    ) -> Result<Step<CiphertextStage>, MixError> {
        let ke = KeyExchange::new(
            self.keys.kx.x25519_public().to_vec(),
            self.keys.kx.pq_public(),
            self.commitment,
            io.ctx,
        );
        io.client.send(&ke, io.config.send_timeout()).await?;

        let mut kes: KeyExchanges = io.reply().await?;
        if let Some(reroute) = check_reroute(&mut kes) {
            return Ok(Step::Reroute(reroute));
        }

        let present: Vec<KeyExchange> = kes.kes.into_iter().flatten().collect();
        if present.len() != io.roster.peer_count() {
            return Err(MixError::PeerTotal {
                what: "key exchange",
                expected: io.roster.peer_count(),
                actual: present.len(),
            });
        }
        let ecdh = present
            .iter()
            .map(|ke| {
                <[u8; 32]>::try_from(ke.ecdh.as_slice()).map_err(|_| MixError::Malformed {
                    what: "key exchange",
                    reason: format!("x25519 public key is {} bytes", ke.ecdh.len()),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let pqpk = present.into_iter().map(|ke| ke.pqpk).collect();
        debug!(peers = ecdh.len(), "received key exchanges");

        Ok(Step::Continue(CiphertextStage {
            keys: self.keys,
            messages: self.messages,
            ecdh,
            pqpk,
        }))
    }
}

/// Encapsulate to every peer and derive the pairwise pad keys.
pub struct CiphertextStage {
    keys: RunKeys,
    messages: Vec<Vec<u8>>,
    ecdh: Vec<[u8; 32]>,
    pqpk: Vec<Vec<u8>>,
}

impl CiphertextStage {
    async fn exchange<C: Conn>(
        mut self,
        io: &mut RunIo<'_, C>,
    ) -> Result<Step<SlotReserveStage>, MixError> {
        let cts = self.keys.kx.encapsulate(&mut self.keys.encap, &self.pqpk)?;
        let ct = Ciphertexts::new(cts, io.ctx);
        io.client.send(&ct, io.config.send_timeout()).await?;

        let mut reply: CiphertextsReply = io.reply().await?;
        if let Some(reroute) = check_reroute(&mut reply) {
            return Ok(Step::Reroute(reroute));
        }

        let pad_ctx = PadContext {
            sid: &io.ctx.sid,
            run: io.ctx.run,
            msize: MESSAGE_SIZE,
            my: io.roster.my,
            mcounts: &io.roster.mcounts,
        };
        let shared = shared_keys(&self.keys.kx, &self.ecdh, &reply.ciphertexts, &pad_ctx)?;

        Ok(Step::Continue(SlotReserveStage {
            sr: self.keys.sr,
            messages: self.messages,
            shared,
        }))
    }
}

/// Reserve slots through the exponential DC-net.
pub struct SlotReserveStage {
    sr: Vec<BigUint>,
    messages: Vec<Vec<u8>>,
    shared: SharedKeys,
}

impl SlotReserveStage {
    async fn reserve<C: Conn>(self, io: &mut RunIo<'_, C>) -> Result<Step<DcNetStage>, MixError> {
        let my_start = io.roster.my_start;
        let mixes: Vec<Vec<BigUint>> = self
            .sr
            .iter()
            .zip(&self.shared.sr)
            .enumerate()
            .map(|(i, (m, keys))| sr_mix(m, &sr_mix_pads(keys, my_start + i)))
            .collect();
        trace!(
            srmix = ?mixes.iter().map(|v| v.iter().map(|x| x.to_str_radix(16)).collect::<Vec<_>>()).collect::<Vec<_>>(),
            "slot reservation mix"
        );
        io.client
            .send(&SlotReserve::new(mixes, io.ctx), io.config.send_timeout())
            .await?;

        let mut rm: RecoveredMessages = io.reply().await?;
        if let Some(reroute) = check_reroute(&mut rm) {
            return Ok(Step::Reroute(reroute));
        }
        if rm.roots.len() > io.roster.mtot {
            return Err(MixError::Malformed {
                what: "recovered messages",
                reason: format!("{} roots for {} messages", rm.roots.len(), io.roster.mtot),
            });
        }
        sort_roots(&mut rm.roots)?;

        let Some(slots) = resolve_slots(&self.sr, &rm.roots) else {
            warn!(roots = rm.roots.len(), "own slot reservation missing from recovered roots");
            return Ok(Step::Reroute(Reroute::RevealSecrets(Blame::Client)));
        };
        trace!(?slots, "reserved slots");

        Ok(Step::Continue(DcNetStage {
            messages: self.messages,
            shared: self.shared,
            slots,
        }))
    }
}

/// Publish messages through the XOR DC-net and confirm the result.
pub struct DcNetStage {
    messages: Vec<Vec<u8>>,
    shared: SharedKeys,
    slots: Vec<usize>,
}

impl DcNetStage {
    async fn mix<C: Conn, G: GenConfirmer>(
        self,
        io: &mut RunIo<'_, C>,
        gen_conf: &mut G,
    ) -> Result<Step<()>, MixError> {
        let my_start = io.roster.my_start;
        let mut vectors: Vec<DcVec> = Vec::with_capacity(self.messages.len());
        for (i, (m, slot)) in self.messages.iter().zip(&self.slots).enumerate() {
            let pads = dc_mix_pads(&self.shared.dc[i], MESSAGE_SIZE, my_start + i)?;
            vectors.push(dc_mix(&pads, m, *slot)?);
        }
        trace!(dcmix = ?vectors, "DC-net mix");
        io.client
            .send(&DcNet::new(vectors, io.ctx), io.config.send_timeout())
            .await?;

        let mut cm: ConfirmMix = io.reply().await?;
        if let Some(reroute) = check_reroute(&mut cm) {
            return Ok(Step::Reroute(reroute));
        }
        match gen_conf.unmarshal(&cm.mix).and_then(|()| gen_conf.confirm()) {
            Ok(()) => {}
            Err(e) if e.is_missing_message() => {
                warn!(error = %e, "own message missing from mix");
                return Ok(Step::Reroute(Reroute::RevealSecrets(Blame::Client)));
            }
            Err(e) => return Err(MixError::Confirm(e)),
        }

        let signed = gen_conf.marshal().map_err(MixError::Payload)?;
        io.client
            .send(&ConfirmMix::new(signed, io.ctx), io.config.send_timeout())
            .await?;

        let mut done: ConfirmMix = io.reply().await?;
        if let Some(reroute) = check_reroute(&mut done) {
            return Ok(Step::Reroute(reroute));
        }
        gen_conf.unmarshal(&done.mix).map_err(MixError::Payload)?;
        Ok(Step::Continue(()))
    }
}
