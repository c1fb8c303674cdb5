//! In-memory coordinator driving real sessions over duplex pipes.
//!
//! Root solving covers up to two mixed messages, which is enough for the
//! one- and two-peer scenarios exercised here.

#![allow(dead_code)]

use std::time::Duration;

use cspp_client::messages::{
    BeginRun, Ciphertexts, CiphertextsReply, ConfirmMix, DcNet, KeyExchange, KeyExchanges,
    PairRequest, RecoveredMessages, SlotReserve,
};
use cspp_client::{ConfirmError, GenConfirmer, MESSAGE_SIZE, MixError, Session, Signed};
use cspp_core::MixConfig;
use cspp_crypto::field::{add_vectors, coefficients, inverse, is_root};
use cspp_crypto::{DcVec, field_prime, xor_vectors};
use num_bigint::BigUint;
use rand::RngCore;
use rand::rngs::OsRng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(10);

// =========================================================================
// Payload
// =========================================================================

/// JSON payload shared by all peers of a test mix.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mix {
    pub unmixed: Vec<String>,
    pub messages: Vec<String>,
    pub confirmed: Vec<String>,
}

/// A peer's view of the payload.
#[derive(Debug, Clone)]
pub struct TestPayload {
    pub name: String,
    pub mcount: usize,
    pub mix: Mix,
    pub generated: Vec<Vec<u8>>,
    pub generations: usize,
    pub reject: bool,
}

impl TestPayload {
    pub fn new(name: &str, mcount: usize) -> Self {
        Self {
            name: name.to_string(),
            mcount,
            mix: Mix {
                unmixed: vec![name.to_string()],
                ..Mix::default()
            },
            generated: Vec::new(),
            generations: 0,
            reject: false,
        }
    }
}

impl GenConfirmer for TestPayload {
    fn marshal(&self) -> Result<Vec<u8>, ConfirmError> {
        serde_json::to_vec(&self.mix).map_err(|e| ConfirmError::Other(Box::new(e)))
    }

    fn unmarshal(&mut self, data: &[u8]) -> Result<(), ConfirmError> {
        self.mix = serde_json::from_slice(data).map_err(|e| ConfirmError::Invalid(e.to_string()))?;
        Ok(())
    }

    fn generate(&mut self) -> Result<Vec<Vec<u8>>, ConfirmError> {
        self.generations += 1;
        self.generated = (0..self.mcount)
            .map(|_| {
                let mut m = vec![0u8; MESSAGE_SIZE];
                OsRng.fill_bytes(&mut m);
                m
            })
            .collect();
        Ok(self.generated.clone())
    }

    fn confirm(&mut self) -> Result<(), ConfirmError> {
        if self.reject {
            return Err(ConfirmError::Invalid("rejected by test".to_string()));
        }
        for m in &self.generated {
            if !self.mix.messages.contains(&hex::encode(m)) {
                return Err(ConfirmError::MissingMessage(hex::encode(m)));
            }
        }
        self.mix.confirmed.push(self.name.clone());
        Ok(())
    }
}

// =========================================================================
// Peers
// =========================================================================

pub type PeerResult = (Result<(), MixError>, TestPayload);

/// A running session and the token that cancels it.
pub struct Spawned {
    pub handle: JoinHandle<PeerResult>,
    pub cancel: CancellationToken,
}

impl Spawned {
    pub async fn join(self) -> PeerResult {
        timeout(WAIT, self.handle).await.unwrap().unwrap()
    }
}

pub fn spawn_peer(name: &str, mcount: u32) -> (Spawned, PeerLink) {
    spawn_payload(TestPayload::new(name, mcount as usize), mcount)
}

pub fn spawn_payload(mut payload: TestPayload, mcount: u32) -> (Spawned, PeerLink) {
    let _ = cspp_core::tracing_init::init_tracing("cspp_client=debug", false);

    let (client_side, server_side) = tokio::io::duplex(1 << 20);
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let span = tracing::info_span!("peer", name = %payload.name);
    let handle = tokio::spawn(async move {
        let mut session = Session::with_config(
            OsRng,
            span,
            b"pair-commitment".to_vec(),
            mcount,
            MixConfig::default(),
        )
        .unwrap();
        let result = session.dice_mix(&token, client_side, &mut payload).await;
        (result, payload)
    });
    (Spawned { handle, cancel }, PeerLink::new(server_side))
}

/// Coordinator side of one peer's connection.
pub struct PeerLink {
    lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
    writer: WriteHalf<DuplexStream>,
    pub identity: Vec<u8>,
    pub mcount: i64,
    pub unmixed: Mix,
}

impl PeerLink {
    fn new(stream: DuplexStream) -> Self {
        let (read, writer) = tokio::io::split(stream);
        Self {
            lines: BufReader::new(read).lines(),
            writer,
            identity: Vec::new(),
            mcount: 0,
            unmixed: Mix::default(),
        }
    }

    pub async fn recv<T: DeserializeOwned>(&mut self) -> T {
        let line = timeout(WAIT, self.lines.next_line())
            .await
            .unwrap()
            .unwrap()
            .unwrap_or_else(|| panic!("peer closed before {}", std::any::type_name::<T>()));
        serde_json::from_str(&line)
            .unwrap_or_else(|e| panic!("bad {}: {e}: {line}", std::any::type_name::<T>()))
    }

    pub async fn send<T: Serialize>(&mut self, msg: &T) {
        let mut line = serde_json::to_string(msg).unwrap();
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await.unwrap();
    }

    /// Whether the peer shut its side of the connection down.
    pub async fn closed(&mut self) -> bool {
        matches!(timeout(WAIT, self.lines.next_line()).await, Ok(Ok(None)))
    }
}

// =========================================================================
// Coordinator
// =========================================================================

pub struct Coordinator {
    pub peers: Vec<PeerLink>,
    pub sid: Vec<u8>,
    pub run: u32,
}

impl Coordinator {
    pub fn new(peers: Vec<PeerLink>) -> Self {
        Self {
            peers,
            sid: b"test-session".to_vec(),
            run: 0,
        }
    }

    /// Read every peer's pair request.
    pub async fn pair(&mut self) -> Vec<PairRequest> {
        let mut prs = Vec::new();
        for peer in &mut self.peers {
            let pr: PairRequest = peer.recv().await;
            assert!(pr.verify_signature(&pr.identity), "pair request signature");
            peer.identity.clone_from(&pr.identity);
            peer.mcount = i64::from(pr.message_count);
            peer.unmixed = serde_json::from_slice(&pr.unmixed).unwrap();
            prs.push(pr);
        }
        prs
    }

    pub fn roster(&self) -> BeginRun {
        BeginRun {
            vk: self.peers.iter().map(|p| p.identity.clone()).collect(),
            message_counts: self.peers.iter().map(|p| p.mcount).collect(),
            sid: self.sid.clone(),
            err: 0,
        }
    }

    pub async fn broadcast<T: Serialize>(&mut self, msg: &T) {
        for peer in &mut self.peers {
            peer.send(msg).await;
        }
    }

    pub async fn begin_run(&mut self) {
        let br = self.roster();
        self.broadcast(&br).await;
    }

    /// Read every key exchange, checking signatures and run index.
    pub async fn key_exchange(&mut self) -> Vec<KeyExchange> {
        let mut kes = Vec::new();
        for peer in &mut self.peers {
            let ke: KeyExchange = peer.recv().await;
            assert!(ke.verify_signature(&peer.identity), "key exchange signature");
            assert_eq!(ke.run, self.run);
            kes.push(ke);
        }
        kes
    }

    pub async fn send_key_exchanges(&mut self, kes: &[KeyExchange]) {
        let reply = KeyExchanges {
            kes: kes.iter().cloned().map(Some).collect(),
            br: None,
            err: 0,
        };
        self.broadcast(&reply).await;
    }

    /// Read every peer's ciphertexts, checking signatures and counts.
    pub async fn collect_ciphertexts(&mut self) -> Vec<Ciphertexts> {
        let n = self.peers.len();
        let mut all = Vec::new();
        for peer in &mut self.peers {
            let ct: Ciphertexts = peer.recv().await;
            assert!(ct.verify_signature(&peer.identity), "ciphertexts signature");
            assert_eq!(ct.ciphertexts.len(), n);
            all.push(ct);
        }
        all
    }

    /// Route every ciphertext to the peer it was encapsulated to.
    pub async fn route_ciphertexts(&mut self, all: &[Ciphertexts]) {
        for (i, peer) in self.peers.iter_mut().enumerate() {
            let reply = CiphertextsReply {
                ciphertexts: all.iter().map(|ct| ct.ciphertexts[i].clone()).collect(),
                br: None,
                err: 0,
            };
            peer.send(&reply).await;
        }
    }

    pub async fn ciphertexts(&mut self) -> Vec<Ciphertexts> {
        let all = self.collect_ciphertexts().await;
        self.route_ciphertexts(&all).await;
        all
    }

    /// Read every slot reservation and solve for the reserved values.
    pub async fn slot_reserve(&mut self) -> Vec<BigUint> {
        let mut vectors = Vec::new();
        for peer in &mut self.peers {
            let sr: SlotReserve = peer.recv().await;
            assert!(sr.verify_signature(&peer.identity), "slot reserve signature");
            assert_eq!(sr.run, self.run);
            vectors.extend(sr.dc_mix);
        }
        solve_roots(&add_vectors(&vectors))
    }

    pub async fn recovered(&mut self, roots: Vec<BigUint>) {
        let rm = RecoveredMessages {
            run: self.run,
            roots,
            ..RecoveredMessages::default()
        };
        self.broadcast(&rm).await;
    }

    /// Read every DC-net vector and recover the mixed messages.
    pub async fn dc_net(&mut self) -> Vec<Vec<u8>> {
        let mut vectors = Vec::new();
        for peer in &mut self.peers {
            let dc: DcNet = peer.recv().await;
            assert!(dc.verify_signature(&peer.identity), "dc-net signature");
            assert_eq!(dc.run, self.run);
            vectors.extend(dc.dc_net.into_iter().map(DcVec::from));
        }
        let sum = xor_vectors(&vectors).unwrap();
        (0..sum.n).map(|i| sum.m(i).to_vec()).collect()
    }

    pub fn mix_of(&self, messages: &[Vec<u8>]) -> Mix {
        Mix {
            unmixed: self
                .peers
                .iter()
                .flat_map(|p| p.unmixed.unmixed.clone())
                .collect(),
            messages: messages.iter().map(hex::encode).collect(),
            confirmed: Vec::new(),
        }
    }

    pub async fn publish_mix(&mut self, mix: &Mix) {
        let cm = ConfirmMix {
            mix: serde_json::to_vec(mix).unwrap(),
            ..ConfirmMix::default()
        };
        self.broadcast(&cm).await;
    }

    /// Collect every signed confirmation and merge the confirmed names.
    pub async fn collect_confirmations(&mut self, mix: Mix) -> Mix {
        let mut merged = mix;
        for peer in &mut self.peers {
            let signed: ConfirmMix = peer.recv().await;
            assert!(signed.verify_signature(&peer.identity), "confirm signature");
            let theirs: Mix = serde_json::from_slice(&signed.mix).unwrap();
            for name in theirs.confirmed {
                if !merged.confirmed.contains(&name) {
                    merged.confirmed.push(name);
                }
            }
        }
        merged
    }

    /// Publish the mix, collect every signed confirmation and publish the
    /// merged result.
    pub async fn confirm(&mut self, mix: Mix) -> Mix {
        self.publish_mix(&mix).await;
        let merged = self.collect_confirmations(mix).await;
        self.publish_mix(&merged).await;
        merged
    }

    /// Run from the key exchange through the DC-net and return the mix.
    pub async fn through_dc_net(&mut self) -> Mix {
        let kes = self.key_exchange().await;
        self.send_key_exchanges(&kes).await;
        self.ciphertexts().await;
        let roots = self.slot_reserve().await;
        self.recovered(roots).await;
        let messages = self.dc_net().await;
        self.mix_of(&messages)
    }

    /// Everything after the roster for one successful run.
    pub async fn complete_run(&mut self) -> Mix {
        let mix = self.through_dc_net().await;
        self.confirm(mix).await
    }
}

/// Roots of the polynomial with power sums `sums`, for up to two messages.
///
/// Returned largest first so that clients must sort them.
pub fn solve_roots(sums: &[BigUint]) -> Vec<BigUint> {
    let p = field_prime();
    let half = inverse(&BigUint::from(2u8));
    let roots = match sums {
        [s1] => vec![s1.clone()],
        [s1, s2] => {
            // x^2 - e1 x + e2 with e1 = S1, e2 = (S1^2 - S2) / 2
            let e2 = (s1 * s1 % p + p - s2) % p * &half % p;
            let disc = (s1 * s1 % p + p - (&e2 * 4u8) % p) % p;
            let root = disc.modpow(&((p + 1u8) >> 2usize), p);
            assert_eq!(&root * &root % p, disc, "discriminant is not a square");
            let a = (s1 + &root) * &half % p;
            let b = (s1 + p - &root) * &half % p;
            if a > b { vec![a, b] } else { vec![b, a] }
        }
        _ => panic!("mock coordinator solves at most two messages"),
    };
    let coeffs = coefficients(sums);
    for r in &roots {
        assert!(is_root(r, &coeffs));
    }
    roots
}
