//! Mix session: one peer's participation in one mix.

use std::sync::Arc;
use std::time::Duration;

use cspp_core::MixConfig;
use cspp_crypto::{SEED_SIZE, SessionKeyPair};
use rand::{CryptoRng, RngCore};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, info, info_span, trace, warn};
use zeroize::Zeroizing;

use crate::confirmer::{GenConfirmer, MESSAGE_SIZE};
use crate::error::MixError;
use crate::messages::{BeginRun, ClientFailure, PairRequest, RevealSecrets, RunContext};
use crate::run::{Blame, KeyExchangeStage, Reroute, Roster, RunIo, RunKeys, RunOutcome, drive};
use crate::transport::{Client, Conn};

/// Seed and messages kept across runs until blame forces fresh ones.
struct StoredSecrets {
    seed: Zeroizing<[u8; SEED_SIZE]>,
    /// Run index the seed's PRNG stream is keyed to.
    seed_run: u32,
    messages: Vec<Vec<u8>>,
}

/// A peer's participation in a mix session.
///
/// Secrets survive reruns: a run that ends without blame is retried with the
/// same keys and messages. Once secrets are revealed, the next run draws a
/// fresh seed and asks the generator for new messages.
pub struct Session<R> {
    random: R,
    keys: Arc<SessionKeyPair>,
    commitment: Vec<u8>,
    mcount: u32,
    config: MixConfig,
    span: Span,
    fresh_gen: bool,
    secrets: Option<StoredSecrets>,
    sid: Vec<u8>,
}

impl<R> std::fmt::Debug for Session<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("identity", &self.keys.fingerprint())
            .field("mcount", &self.mcount)
            .field("sid", &hex::encode(&self.sid))
            .finish_non_exhaustive()
    }
}

impl<R: RngCore + CryptoRng + Send> Session<R> {
    /// Create a session contributing `mcount` messages.
    ///
    /// `random` provides the session signing key and every run seed. `span`
    /// scopes all session logging.
    pub fn new(random: R, span: Span, commitment: Vec<u8>, mcount: u32) -> Result<Self, MixError> {
        Self::with_config(random, span, commitment, mcount, MixConfig::default())
    }

    pub fn with_config(
        mut random: R,
        span: Span,
        commitment: Vec<u8>,
        mcount: u32,
        config: MixConfig,
    ) -> Result<Self, MixError> {
        if mcount == 0 {
            return Err(MixError::Malformed {
                what: "session",
                reason: "must contribute at least one message".to_string(),
            });
        }
        let keys = SessionKeyPair::generate(&mut random)?;
        Ok(Self {
            random,
            keys: Arc::new(keys),
            commitment,
            mcount,
            config,
            span,
            fresh_gen: true,
            secrets: None,
            sid: Vec::new(),
        })
    }

    /// The session's ed25519 public key, as listed in rosters.
    pub fn public_key(&self) -> [u8; 32] {
        self.keys.public_bytes()
    }

    /// Session id assigned by the coordinator in the latest roster.
    pub fn sid(&self) -> &[u8] {
        &self.sid
    }

    /// Run the mix over `conn` until a run is confirmed.
    ///
    /// On success `gen_conf` holds the final mixed payload. The connection
    /// is shut down on every return path.
    pub async fn dice_mix<C: Conn, G: GenConfirmer>(
        &mut self,
        cancel: &CancellationToken,
        conn: C,
        gen_conf: &mut G,
    ) -> Result<(), MixError> {
        let span = self.span.clone();
        let mut client = Client::new(conn);
        let result = self
            .mix(cancel, &mut client, gen_conf)
            .instrument(span.clone())
            .await;
        if let Err(e) = client.shutdown().await {
            debug!(parent: &span, error = %e, "connection shutdown failed");
        }
        if let Err(e) = &result {
            warn!(parent: &span, error = %e, timed_out = e.is_timeout(), "mix failed");
        }
        result
    }

    async fn mix<C: Conn, G: GenConfirmer>(
        &mut self,
        cancel: &CancellationToken,
        client: &mut Client<C>,
        gen_conf: &mut G,
    ) -> Result<(), MixError> {
        let unmixed = gen_conf.marshal().map_err(MixError::Payload)?;
        let pr = PairRequest::new(&self.keys, self.commitment.clone(), unmixed, self.mcount);
        client.send(&pr, self.config.send_timeout()).await?;
        info!(
            identity = %self.keys.fingerprint(),
            remote = client.remote(),
            mcount = self.mcount,
            "pair request sent"
        );

        let mut carried: Option<BeginRun> = None;
        let mut run = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Err(MixError::Cancelled);
            }
            let outcome = self
                .run(cancel, client, gen_conf, run, carried.take())
                .instrument(info_span!("run", run))
                .await?;
            match outcome {
                RunOutcome::Confirmed => {
                    info!(run, "mix confirmed");
                    return Ok(());
                }
                RunOutcome::RerunWithRoster(br) => {
                    info!(run, peers = br.vk.len(), "rerunning with new roster");
                    carried = Some(br);
                }
                RunOutcome::Rerun => info!(run, "rerunning after blame"),
            }
            run = run.checked_add(1).ok_or(MixError::RunOverflow)?;
        }
    }

    async fn run<C: Conn, G: GenConfirmer>(
        &mut self,
        cancel: &CancellationToken,
        client: &mut Client<C>,
        gen_conf: &mut G,
        run: u32,
        carried: Option<BeginRun>,
    ) -> Result<RunOutcome, MixError> {
        let br = match carried {
            Some(br) => br,
            None => {
                let limit = (run > 0).then(|| self.config.recv_timeout());
                Self::begin_run(cancel, client, limit).await?
            }
        };
        let roster = Roster::from_begin_run(br, &self.keys.public_bytes(), self.mcount)?;
        self.sid.clone_from(&roster.sid);

        let ctx = RunContext::new(
            roster.sid.clone(),
            run,
            roster.vk.clone(),
            Arc::clone(&self.keys),
        );
        debug!(
            sid = %hex::encode(&roster.sid),
            sid_h = %hex::encode(ctx.sid_h),
            peers = roster.peer_count(),
            mtot = roster.mtot,
            my = roster.my,
            "received roster"
        );
        let (keys, rs) = self.prepare_secrets(run, gen_conf)?;
        let start = KeyExchangeStage {
            commitment: rs.commit(&ctx),
            messages: rs.m.clone(),
            keys,
        };

        let rerouted = {
            let mut io = RunIo {
                client: &mut *client,
                config: &self.config,
                ctx: &ctx,
                roster: &roster,
            };
            drive(&mut io, start, gen_conf).await?
        };
        match rerouted {
            None => Ok(RunOutcome::Confirmed),
            Some(Reroute::BeginRun(br)) => Ok(RunOutcome::RerunWithRoster(br)),
            Some(Reroute::RevealSecrets(blame)) => {
                self.reveal_secrets(cancel, client, blame, &rs).await?;
                Ok(RunOutcome::Rerun)
            }
        }
    }

    /// Wait for the roster opening `run`.
    ///
    /// The first run may wait indefinitely for enough peers to pair; later
    /// runs are bounded by the receive timeout.
    async fn begin_run<C: Conn>(
        cancel: &CancellationToken,
        client: &mut Client<C>,
        limit: Option<Duration>,
    ) -> Result<BeginRun, MixError> {
        tokio::select! {
            () = cancel.cancelled() => Err(MixError::Cancelled),
            br = client.recv::<BeginRun>(limit) => Ok(br?),
        }
    }

    /// Derive this run's keys, regenerating the seed and messages when none
    /// are stored or the previous run was blamed.
    fn prepare_secrets<G: GenConfirmer>(
        &mut self,
        run: u32,
        gen_conf: &mut G,
    ) -> Result<(RunKeys, RevealSecrets), MixError> {
        let stored = match self.secrets.take() {
            Some(stored) if !self.fresh_gen => stored,
            _ => self.fresh_secrets(run, gen_conf)?,
        };
        self.fresh_gen = false;

        let keys = RunKeys::derive(&stored.seed, stored.seed_run, run, self.mcount as usize)?;
        let rs = RevealSecrets {
            seed: stored.seed.to_vec(),
            seed_run: stored.seed_run,
            sr: keys.sr.clone(),
            m: stored.messages.clone(),
        };
        trace!(
            seed_run = stored.seed_run,
            sr = ?keys.sr.iter().map(|x| x.to_str_radix(16)).collect::<Vec<_>>(),
            m = ?stored.messages.iter().map(hex::encode).collect::<Vec<_>>(),
            "run secrets"
        );
        self.secrets = Some(stored);
        Ok((keys, rs))
    }

    fn fresh_secrets<G: GenConfirmer>(
        &mut self,
        run: u32,
        gen_conf: &mut G,
    ) -> Result<StoredSecrets, MixError> {
        let mut seed = Zeroizing::new([0u8; SEED_SIZE]);
        self.random.try_fill_bytes(&mut seed[..])?;

        let messages = gen_conf.generate().map_err(MixError::Generate)?;
        let expected = self.mcount as usize;
        if messages.len() != expected {
            return Err(MixError::GeneratedCount {
                expected,
                actual: messages.len(),
            });
        }
        if let Some((index, m)) = messages
            .iter()
            .enumerate()
            .find(|(_, m)| m.len() != MESSAGE_SIZE)
        {
            return Err(MixError::GeneratedSize {
                index,
                expected: MESSAGE_SIZE,
                actual: m.len(),
            });
        }
        debug!(seed_run = run, "generated fresh secrets");
        Ok(StoredSecrets {
            seed,
            seed_run: run,
            messages,
        })
    }

    async fn reveal_secrets<C: Conn>(
        &mut self,
        cancel: &CancellationToken,
        client: &mut Client<C>,
        blame: Blame,
        rs: &RevealSecrets,
    ) -> Result<(), MixError> {
        if cancel.is_cancelled() {
            return Err(MixError::Cancelled);
        }
        self.fresh_gen = true;
        let limit = self.config.send_timeout();
        match blame {
            Blame::Server => info!("revealing secrets for blame assignment"),
            Blame::Client => {
                warn!("run failed locally, revealing secrets");
                client.send(&ClientFailure::default(), limit).await?;
            }
        }
        client.send(rs, limit).await?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use rand::rngs::OsRng;

    use super::*;
    use crate::confirmer::ConfirmError;

    struct FixedGen {
        messages: Vec<Vec<u8>>,
        calls: usize,
    }

    impl GenConfirmer for FixedGen {
        fn marshal(&self) -> Result<Vec<u8>, ConfirmError> {
            Ok(Vec::new())
        }

        fn unmarshal(&mut self, _data: &[u8]) -> Result<(), ConfirmError> {
            Ok(())
        }

        fn generate(&mut self) -> Result<Vec<Vec<u8>>, ConfirmError> {
            self.calls += 1;
            Ok(self.messages.clone())
        }

        fn confirm(&mut self) -> Result<(), ConfirmError> {
            Ok(())
        }
    }

    struct BrokenRng;

    impl RngCore for BrokenRng {
        fn next_u32(&mut self) -> u32 {
            0
        }

        fn next_u64(&mut self) -> u64 {
            0
        }

        fn fill_bytes(&mut self, dest: &mut [u8]) {
            dest.fill(0);
        }

        fn try_fill_bytes(&mut self, _dest: &mut [u8]) -> Result<(), rand::Error> {
            Err(rand::Error::new("entropy source unavailable"))
        }
    }

    impl CryptoRng for BrokenRng {}

    fn session(mcount: u32) -> Session<OsRng> {
        Session::new(OsRng, Span::none(), b"commit".to_vec(), mcount).unwrap()
    }

    #[test]
    fn key_generation_failure_is_reported() {
        let err = Session::new(BrokenRng, Span::none(), Vec::new(), 1).unwrap_err();
        assert!(matches!(err, MixError::Crypto(_)));
    }

    #[test]
    fn zero_message_count_is_rejected() {
        assert!(Session::new(OsRng, Span::none(), Vec::new(), 0).is_err());
    }

    #[test]
    fn secrets_are_reused_until_blame() {
        let mut s = session(2);
        let mut g = FixedGen {
            messages: vec![vec![1; MESSAGE_SIZE], vec![2; MESSAGE_SIZE]],
            calls: 0,
        };

        let (k0, rs0) = s.prepare_secrets(0, &mut g).unwrap();
        let (k1, rs1) = s.prepare_secrets(1, &mut g).unwrap();
        assert_eq!(g.calls, 1);
        assert_eq!(rs0.seed, rs1.seed);
        assert_eq!(rs1.seed_run, 0);
        assert_eq!(k0.sr, k1.sr);
        assert_eq!(k0.kx.x25519_public(), k1.kx.x25519_public());

        s.fresh_gen = true;
        let (k2, rs2) = s.prepare_secrets(2, &mut g).unwrap();
        assert_eq!(g.calls, 2);
        assert_eq!(rs2.seed_run, 2);
        assert_ne!(rs2.seed, rs0.seed);
        assert_ne!(k2.sr, k0.sr);
        assert!(!s.fresh_gen);
    }

    #[test]
    fn rerun_without_blame_draws_new_encapsulation_randomness() {
        let mut s = session(1);
        let mut g = FixedGen {
            messages: vec![vec![3; MESSAGE_SIZE]],
            calls: 0,
        };
        let peer = RunKeys::derive(&[9u8; SEED_SIZE], 0, 0, 1).unwrap();
        let pks = vec![peer.kx.pq_public()];

        let (mut run0, _) = s.prepare_secrets(0, &mut g).unwrap();
        let (mut run1, rs1) = s.prepare_secrets(1, &mut g).unwrap();
        assert_eq!(rs1.seed_run, 0);
        let ct0 = run0.kx.encapsulate(&mut run0.encap, &pks).unwrap();
        let ct1 = run1.kx.encapsulate(&mut run1.encap, &pks).unwrap();
        assert_ne!(ct0, ct1);

        let seed: [u8; SEED_SIZE] = rs1.seed.as_slice().try_into().unwrap();
        let mut replay = RunKeys::derive(&seed, rs1.seed_run, 1, 1).unwrap();
        assert_eq!(replay.kx.encapsulate(&mut replay.encap, &pks).unwrap(), ct1);
    }

    #[test]
    fn revealed_secrets_reproduce_run_keys() {
        let mut s = session(1);
        let mut g = FixedGen {
            messages: vec![vec![7; MESSAGE_SIZE]],
            calls: 0,
        };
        let (keys, rs) = s.prepare_secrets(0, &mut g).unwrap();
        let seed: [u8; SEED_SIZE] = rs.seed.as_slice().try_into().unwrap();
        let replay = RunKeys::derive(&seed, rs.seed_run, 0, 1).unwrap();
        assert_eq!(replay.sr, rs.sr);
        assert_eq!(replay.kx.pq_public(), keys.kx.pq_public());
    }

    #[test]
    fn generator_count_mismatch_is_fatal() {
        let mut s = session(2);
        let mut g = FixedGen {
            messages: vec![vec![1; MESSAGE_SIZE]],
            calls: 0,
        };
        let err = s.prepare_secrets(0, &mut g).unwrap_err();
        assert!(matches!(
            err,
            MixError::GeneratedCount {
                expected: 2,
                actual: 1
            }
        ));
    }

    #[test]
    fn generator_size_mismatch_is_fatal() {
        let mut s = session(1);
        let mut g = FixedGen {
            messages: vec![vec![1; MESSAGE_SIZE + 1]],
            calls: 0,
        };
        let err = s.prepare_secrets(0, &mut g).unwrap_err();
        assert!(matches!(err, MixError::GeneratedSize { index: 0, .. }));
    }

    #[test]
    fn debug_hides_keys() {
        let s = session(1);
        let out = format!("{s:?}");
        assert!(out.contains("Session"));
        assert!(!out.contains("secret"));
    }
}
