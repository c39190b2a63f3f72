//! Participant runtime and simulator driver. `Participant` holds one node's
//! per-epoch state; `epoch::step` decides what it should do next, and this
//! module is the only place that actually executes those decisions — mining
//! PoW, publishing envelopes to the bus, and appending to the ledger.
//! `Simulator` owns the process-wide port counter, the bus, and drives every
//! participant's state machine one tick at a time.

use std::collections::{HashMap, HashSet};

use log::{info, warn};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

use crate::bus::{Envelope, MessageBus, MessageKind};
use crate::config::Config;
use crate::crypto::{random_bitstring_with, sha256_bytes, Keypair};
use crate::directory::Directory;
use crate::epoch::{step, Action, EpochState, Event};
use crate::error::ElasticoError;
use crate::finality::{FinalityCollector, RandomnessRound};
use crate::identity::{committee_id_from_hash, Identity, PowWitness, SimulatedIp};
use crate::ledger::{FinalBlock, Ledger, LedgerEntry};
use crate::pbft::{digest_payload, select_primary_port, Mode, PbftLog};
use crate::pow::{compute_fake_pow, compute_pow, CancellationToken};
use crate::transaction::Transaction;

/// Hands out distinct simulated ports; each participant keeps the same port
/// as its bus mailbox address across every epoch it runs.
pub struct PortAllocator {
    next: u16,
}

impl PortAllocator {
    pub fn new(start: u16) -> Self {
        PortAllocator { next: start }
    }

    pub fn allocate(&mut self) -> u16 {
        let port = self.next;
        self.next = self.next.checked_add(1).expect("port space exhausted");
        port
    }
}

/// Per-epoch counters for conditions that are recovered locally (the
/// offending message or registrant is dropped and counted) rather than
/// propagated as a hard failure.
#[derive(Debug, Default, Clone, Copy)]
pub struct Diagnostics {
    pub invalid_pow_rejected: u64,
    pub committee_full_rejections: u64,
    pub unknown_senders_dropped: u64,
    pub signature_mismatches_dropped: u64,
    pub pbft_rounds_stalled: u64,
}

/// One simulated participant: its identity, keypair, fault flags, and
/// per-epoch consensus state.
pub struct Participant {
    pub port: u16,
    pub keypair: Keypair,
    /// Mines a forged PoW witness that (by construction) will not pass
    /// `verify_pow`, so this participant never gets a committee seat.
    pub faulty: bool,
    /// Mines a genuine PoW and gets a committee seat like anyone else, but
    /// withholds every outbound PBFT vote it would otherwise send — an
    /// omission fault, once inside a committee rather than at the door.
    pub pbft_byzantine: bool,
    pub identity: Option<Identity>,
    pub epoch_state: EpochState,
}

impl Participant {
    pub fn new(port: u16, faulty: bool) -> Self {
        Participant {
            port,
            keypair: Keypair::generate(),
            faulty,
            pbft_byzantine: false,
            identity: None,
            epoch_state: EpochState::Idle,
        }
    }

    /// Reset per-epoch fields. Keys are not persisted across epochs either,
    /// so a fresh keypair is drawn too. `faulty`/`pbft_byzantine` are
    /// standing configuration, not per-epoch state, and survive the reset.
    pub fn reset_for_new_epoch(&mut self, rng: &mut impl RngCore) {
        self.keypair = Keypair::generate_with(rng);
        self.identity = None;
        self.epoch_state = EpochState::Idle;
    }

    fn identity(&self) -> &Identity {
        self.identity.as_ref().expect("form_identity must run before the identity is used")
    }

    /// Mine (or fake-mine, if faulty) this epoch's PoW, form an identity,
    /// and drive `epoch_state` from `Idle` through to
    /// `RegisteringWithDirectory`.
    fn form_identity(
        &mut self,
        rng: &mut impl RngCore,
        s_bits: u32,
        difficulty: usize,
        epoch_randomness: &str,
        set_of_rs: Vec<String>,
        token: &CancellationToken,
    ) -> Result<(), ElasticoError> {
        let (state, _) = step(self.epoch_state, &[Event::Tick]); // Idle -> GeneratingKeypair
        self.epoch_state = state;
        let (state, _) = step(self.epoch_state, &[Event::Tick]); // GeneratingKeypair -> MiningPow
        self.epoch_state = state;

        let ip = SimulatedIp::random_with(rng);
        let pow = if self.faulty {
            compute_fake_pow(difficulty, self.port, token)
        } else {
            compute_pow(ip, &self.keypair.public_key(), epoch_randomness, difficulty, set_of_rs, 0, self.port, token)
        };
        let pow = match pow {
            Ok(pow) => pow,
            Err(e) => {
                let (state, _) = step(self.epoch_state, &[Event::PowFailed]);
                self.epoch_state = state;
                return Err(e);
            }
        };
        let committee_id = committee_id_from_hash(&pow.hash, s_bits);
        self.identity = Some(Identity {
            ip,
            public_key: self.keypair.public_key(),
            committee_id,
            pow,
            epoch_randomness: epoch_randomness.to_string(),
            port: self.port,
        });
        let (state, _) = step(self.epoch_state, &[Event::PowReady]); // MiningPow -> RegisteringWithDirectory
        self.epoch_state = state;
        Ok(())
    }

    /// Sign `payload` and publish it to `address` under `kind`.
    fn publish<B: MessageBus>(&self, bus: &B, address: u16, kind: MessageKind, payload: Vec<u8>) {
        let signature = self.keypair.sign(&payload);
        bus.publish(address, Envelope::new(kind, payload, self.identity().clone(), signature));
    }
}

/// Validate an incoming envelope's sender and signature, counting and
/// dropping it on failure rather than propagating.
fn accept_envelope(envelope: &Envelope, known_ports: &HashSet<u16>, diagnostics: &mut Diagnostics) -> bool {
    if !known_ports.contains(&envelope.sender.port) {
        diagnostics.unknown_senders_dropped += 1;
        warn!("dropping envelope from unknown port {}", envelope.sender.port);
        return false;
    }
    if !envelope.verify_signature() {
        diagnostics.signature_mismatches_dropped += 1;
        warn!("dropping envelope with bad signature from port {}", envelope.sender.port);
        return false;
    }
    true
}

/// A stand-in identity used only to sign the directory's own broadcasts
/// (`CommitteeRoster`/`TxnShard`), so receivers validate it through the same
/// `verify_signature` path as every other envelope rather than trusting it
/// unchecked.
fn director_identity(keypair: &Keypair) -> Identity {
    Identity {
        ip: SimulatedIp([0, 0, 0, 0]),
        public_key: keypair.public_key(),
        committee_id: u64::MAX,
        pow: PowWitness {
            hash: "0".repeat(64),
            set_of_rs: vec![],
            nonce: 0,
        },
        epoch_randomness: String::new(),
        port: DIRECTORY_ADDRESS,
    }
}

const DIRECTORY_ADDRESS: u16 = 0;
const RANDOMNESS_ADDRESS: u16 = 1;

/// Drives one epoch across every participant: registration, committee
/// roster/shard gossip, intra-committee PBFT, forwarding to the final
/// committee, final PBFT, final-block broadcast, and the randomness
/// commit/reveal round. All inter-participant influence happens by
/// publishing signed envelopes to the bus and validating them on receipt —
/// nothing here reaches into another participant's state directly.
pub struct Simulator<B: MessageBus> {
    pub config: Config,
    pub bus: B,
    pub ports: PortAllocator,
    pub participants: Vec<Participant>,
    pub ledger: Ledger,
    /// Counters from the most recently completed (or attempted) epoch.
    pub last_diagnostics: Diagnostics,
    director_keypair: Keypair,
    rng: StdRng,
}

impl<B: MessageBus> Simulator<B> {
    pub fn new(config: Config, bus: B) -> Self {
        let rng = StdRng::from_rng(rand::rngs::OsRng).expect("OS RNG must be available");
        Self::build(config, bus, rng)
    }

    /// Same as [`new`](Self::new), but every random draw this simulator
    /// makes (keypairs, simulated IPs, randomness-round secrets) comes from
    /// a `seed`-derived RNG instead of the OS, so two runs built with the
    /// same config and seed and driven through the same calls produce
    /// byte-identical ledgers.
    pub fn with_seed(config: Config, bus: B, seed: u64) -> Self {
        Self::build(config, bus, StdRng::seed_from_u64(seed))
    }

    fn build(config: Config, bus: B, mut rng: StdRng) -> Self {
        let mut ports = PortAllocator::new(49152);
        let faulty_count = ((config.n as f64) * config.faulty_fraction).round() as usize;
        let mut participants = Vec::with_capacity(config.n);
        for i in 0..config.n {
            let port = ports.allocate();
            participants.push(Participant::new(port, i < faulty_count));
        }
        let director_keypair = Keypair::generate_with(&mut rng);
        Simulator {
            config,
            bus,
            ports,
            participants,
            ledger: Ledger::new(),
            last_diagnostics: Diagnostics::default(),
            director_keypair,
            rng,
        }
    }

    /// Run a single epoch end to end. Returns `Err(StalledEpoch)` if any
    /// required quorum is never reached — a faulty primary or a Byzantine
    /// replica can stall a committee with no view-change to recover from,
    /// a known liveness gap, not a bug to paper over.
    pub fn run_epoch(&mut self, epoch: u64, txns: Vec<Transaction>, tick_budget: u64) -> Result<(), ElasticoError> {
        let committee_count = self.config.committee_count();
        let difficulty = self.config.d_difficulty;
        let r_bits = self.config.r_bits;
        let f = self.config.f();

        let r_commitment_set = self.ledger.all_commitments();
        let (epoch_randomness, set_of_rs) = match self.ledger.latest() {
            Some(entry) => (entry.next_epoch_randomness.clone(), entry.opened_shares.clone()),
            None => ("0".repeat(r_bits as usize), vec![]),
        };

        // Ports are reused across epochs; clear out anything left over from
        // a previous (possibly stalled) epoch before this one publishes.
        let all_ports: Vec<u16> = self.participants.iter().map(|p| p.port).collect();
        for port in &all_ports {
            let _ = self.bus.drain(*port);
        }
        let _ = self.bus.drain(DIRECTORY_ADDRESS);
        let _ = self.bus.drain(RANDOMNESS_ADDRESS);

        for p in self.participants.iter_mut() {
            p.reset_for_new_epoch(&mut self.rng);
        }

        info!("epoch {epoch} starting with {} participants, {committee_count} committees", self.participants.len());

        let mut diagnostics = Diagnostics::default();
        let token = CancellationToken::new();
        for participant in self.participants.iter_mut() {
            if let Err(e) = participant.form_identity(&mut self.rng, self.config.s, difficulty, &epoch_randomness, set_of_rs.clone(), &token) {
                warn!("participant on port {} failed to form identity: {e}", participant.port);
            }
        }

        let known_ports: HashSet<u16> = self.participants.iter().map(|p| p.port).collect();

        // Registration: every participant publishes NewIdentity to the
        // directory's well-known address; the directory drains and
        // validates them and the participant's state machine is driven by
        // the outcome.
        for participant in self.participants.iter() {
            if let Some(identity) = &participant.identity {
                let payload = bincode::serialize(identity).expect("identity must serialize");
                participant.publish(&self.bus, DIRECTORY_ADDRESS, MessageKind::NewIdentity, payload);
            }
        }

        let mut directory = Directory::new(committee_count, self.config.c, difficulty, r_bits);
        for envelope in self.bus.drain(DIRECTORY_ADDRESS) {
            if !accept_envelope(&envelope, &known_ports, &mut diagnostics) {
                continue;
            }
            let sender_port = envelope.sender.port;
            match directory.register(envelope.sender, &r_commitment_set) {
                Ok(()) => {
                    if let Some(p) = self.participants.iter_mut().find(|p| p.port == sender_port) {
                        let (s, _) = step(p.epoch_state, &[Event::DirectoryAccepted]);
                        p.epoch_state = s;
                    }
                }
                Err(ElasticoError::InvalidPoW { .. }) => diagnostics.invalid_pow_rejected += 1,
                Err(ElasticoError::CommitteeFull { .. }) => {
                    diagnostics.committee_full_rejections += 1;
                    if let Some(p) = self.participants.iter_mut().find(|p| p.port == sender_port) {
                        let (s, _) = step(p.epoch_state, &[Event::DirectoryRejectedFull]);
                        p.epoch_state = s;
                    }
                }
                Err(_) => {}
            }
        }

        let shards = directory.shard_for_committees(&txns);
        let mut final_roster = directory.roster_for(self.config.fin_num);
        final_roster.sort_by_key(|id| id.port);
        let final_ports: HashSet<u16> = final_roster.iter().map(|id| id.port).collect();

        // Gossip: the directory multicasts each filled committee's roster
        // (plus the final roster) and transaction shard to every member,
        // signed under a stand-in directory identity.
        let director_id = director_identity(&self.director_keypair);
        for committee_id in 0..committee_count {
            let roster = directory.roster_for(committee_id);
            if roster.len() < self.config.c {
                continue;
            }
            let shard = shards.get(&committee_id).cloned().unwrap_or_default();
            let roster_payload = bincode::serialize(&(roster.clone(), final_roster.clone())).expect("roster gossip must serialize");
            let shard_payload = bincode::serialize(&shard).expect("shard must serialize");
            for member in &roster {
                let roster_sig = self.director_keypair.sign(&roster_payload);
                self.bus
                    .publish(member.port, Envelope::new(MessageKind::CommitteeRoster, roster_payload.clone(), director_id.clone(), roster_sig));
                let shard_sig = self.director_keypair.sign(&shard_payload);
                self.bus
                    .publish(member.port, Envelope::new(MessageKind::TxnShard, shard_payload.clone(), director_id.clone(), shard_sig));
            }
        }

        // Each registered participant drains its own mailbox for the
        // gossip above and advances itself through to TxnShardReceived.
        for participant in self.participants.iter_mut() {
            if participant.epoch_state != EpochState::AwaitingCommitteeAssignment {
                continue;
            }
            let (s, _) = step(participant.epoch_state, &[Event::Tick]); // -> CommitteeAssigned
            participant.epoch_state = s;
            let (s, _) = step(participant.epoch_state, &[Event::Tick]); // -> AwaitingRoster
            participant.epoch_state = s;

            let mut roster_for_me = None;
            let mut shard_for_me = None;
            for envelope in self.bus.drain(participant.port) {
                if envelope.sender.port != DIRECTORY_ADDRESS || !envelope.verify_signature() {
                    continue;
                }
                match envelope.kind {
                    MessageKind::CommitteeRoster => {
                        if let Ok((roster, _final_roster)) = bincode::deserialize::<(Vec<Identity>, Vec<Identity>)>(&envelope.payload) {
                            roster_for_me = Some(roster);
                        }
                    }
                    MessageKind::TxnShard => {
                        if let Ok(shard) = bincode::deserialize::<Vec<Transaction>>(&envelope.payload) {
                            shard_for_me = Some(shard);
                        }
                    }
                    _ => {}
                }
            }
            let Some(roster) = roster_for_me else { continue };
            let (s, _) = step(participant.epoch_state, &[Event::RosterArrived(roster)]);
            participant.epoch_state = s;
            let (s, _) = step(participant.epoch_state, &[Event::Tick]); // -> AwaitingTxnShard
            participant.epoch_state = s;
            let Some(shard) = shard_for_me else { continue };
            let (s, _) = step(participant.epoch_state, &[Event::TxnShardArrived(shard)]);
            participant.epoch_state = s;
        }

        // Intra-committee PBFT, one committee at a time, followed by the
        // first c/2+1 roster members forwarding their committed shard to
        // the final committee.
        let mut collector = FinalityCollector::new(self.config.c / 2 + 1);
        for committee_id in 0..committee_count {
            let roster = directory.roster_for(committee_id);
            if roster.len() < self.config.c {
                info!("committee {committee_id} never filled, skipping");
                continue;
            }
            let shard = shards.get(&committee_id).cloned().unwrap_or_default();
            let digest = digest_payload(&shard);
            let Some(primary_port) = select_primary_port(&roster) else { continue };

            let committed = Self::run_pbft_round(
                &self.bus,
                &mut self.participants,
                &roster,
                primary_port,
                epoch,
                f,
                false,
                EpochState::TxnShardReceived,
                &digest,
                tick_budget,
            );
            if !committed {
                diagnostics.pbft_rounds_stalled += 1;
                warn!("committee {committee_id} failed to reach consensus this epoch");
                continue;
            }

            for member in roster.iter().take(self.config.c / 2 + 1) {
                let Some(sender) = self.participants.iter().find(|p| p.port == member.port) else { continue };
                if sender.faulty || sender.pbft_byzantine {
                    continue;
                }
                let payload = bincode::serialize(&(committee_id, shard.clone())).expect("forwarded result must serialize");
                for final_member in &final_roster {
                    sender.publish(&self.bus, final_member.port, MessageKind::IntraResultToFinal, payload.clone());
                }
            }
        }

        for final_member in &final_roster {
            for envelope in self.bus.drain(final_member.port) {
                if !accept_envelope(&envelope, &known_ports, &mut diagnostics) {
                    continue;
                }
                if let MessageKind::IntraResultToFinal = envelope.kind {
                    if let Ok((committee_id, shard)) = bincode::deserialize::<(u64, Vec<Transaction>)>(&envelope.payload) {
                        collector.receive(committee_id, shard, envelope.sender.port);
                    }
                }
            }
        }

        for participant in self.participants.iter_mut() {
            if participant.epoch_state != EpochState::IntraCommitted {
                continue;
            }
            let (s, _) = step(participant.epoch_state, &[Event::Tick]); // -> ForwardingResultToFinal
            participant.epoch_state = s;
            let event = if final_ports.contains(&participant.port) {
                Event::SelectedForFinalCommittee
            } else {
                Event::NotSelectedForFinalCommittee
            };
            let (s, _) = step(participant.epoch_state, &[event]);
            participant.epoch_state = s;
        }

        if !collector.all_accepted(committee_count) {
            self.last_diagnostics = diagnostics;
            return Err(ElasticoError::StalledEpoch {
                epoch,
                ticks: tick_budget,
                state: "FinalAwaitingAllCommitteeResults".to_string(),
            });
        }

        for participant in self.participants.iter_mut() {
            if final_ports.contains(&participant.port) && participant.epoch_state == EpochState::FinalAwaitingAllCommitteeResults {
                let (s, _) = step(participant.epoch_state, &[Event::AllCommitteeResultsIn]);
                participant.epoch_state = s;
            }
        }

        let (committee_order, merged) = collector.merge_ascending();
        let final_digest = digest_payload(&merged);
        let Some(final_primary) = select_primary_port(&final_roster) else {
            self.last_diagnostics = diagnostics;
            return Err(ElasticoError::StalledEpoch {
                epoch,
                ticks: tick_budget,
                state: "FinalMerged".to_string(),
            });
        };

        let final_committed = Self::run_pbft_round(
            &self.bus,
            &mut self.participants,
            &final_roster,
            final_primary,
            epoch,
            f,
            true,
            EpochState::FinalMerged,
            &final_digest,
            tick_budget,
        );
        if !final_committed {
            self.last_diagnostics = diagnostics;
            return Err(ElasticoError::StalledEpoch {
                epoch,
                ticks: tick_budget,
                state: "FinalAwaitingCommitQuorum".to_string(),
            });
        }

        for participant in self.participants.iter_mut() {
            if final_ports.contains(&participant.port) && participant.epoch_state == EpochState::FinalCommitted {
                let (s, _) = step(participant.epoch_state, &[Event::Tick]); // -> BroadcastingFinalBlock
                participant.epoch_state = s;
                let (s, _) = step(participant.epoch_state, &[Event::Tick]); // -> GeneratingRandomnessSecret
                participant.epoch_state = s;
            }
        }

        let final_block_payload = bincode::serialize(&FinalBlock {
            epoch,
            committee_order: committee_order.clone(),
            transactions: merged.clone(),
        })
        .expect("final block must serialize");
        if let Some(primary) = self.participants.iter().find(|p| p.port == final_primary) {
            for port in &known_ports {
                primary.publish(&self.bus, *port, MessageKind::FinalBlock, final_block_payload.clone());
            }
        }
        for participant in self.participants.iter_mut() {
            if final_ports.contains(&participant.port) || participant.epoch_state != EpochState::AwaitingFinalBlock {
                continue;
            }
            for envelope in self.bus.drain(participant.port) {
                if !accept_envelope(&envelope, &known_ports, &mut diagnostics) {
                    continue;
                }
                if matches!(envelope.kind, MessageKind::FinalBlock) {
                    let (s, _) = step(participant.epoch_state, &[Event::FinalBlockArrived]);
                    participant.epoch_state = s;
                    break;
                }
            }
        }

        let needed = self.config.c / 2 + 1;
        let round = Self::run_randomness_round(&self.bus, &mut self.participants, &final_roster, r_bits, &mut self.rng, &known_ports, &mut diagnostics, needed);
        if !round.quorum_reached(needed) {
            self.last_diagnostics = diagnostics;
            return Err(ElasticoError::StalledEpoch {
                epoch,
                ticks: tick_budget,
                state: "AwaitingRevealQuorum".to_string(),
            });
        }

        // Non-final participants don't generate real Ri shares, but once
        // the quorum above is a settled fact they can fast-forward through
        // the same bookkeeping states to learn the epoch is done.
        for participant in self.participants.iter_mut() {
            if final_ports.contains(&participant.port) || participant.epoch_state != EpochState::GeneratingRandomnessSecret {
                continue;
            }
            let (s, _) = step(participant.epoch_state, &[Event::Tick]); // -> BroadcastingCommitment
            participant.epoch_state = s;
            let (s, _) = step(participant.epoch_state, &[Event::Tick]); // -> AwaitingCommitmentQuorum
            participant.epoch_state = s;
            let (s, _) = step(participant.epoch_state, &[Event::CommitmentQuorumReached]); // -> RevealingRandomness
            participant.epoch_state = s;
            let (s, _) = step(participant.epoch_state, &[Event::Tick]); // -> AwaitingRevealQuorum
            participant.epoch_state = s;
            let (s, _) = step(participant.epoch_state, &[Event::RevealQuorumReached]); // -> EpochComplete
            participant.epoch_state = s;
        }

        let commitments = round.commitment_digests();
        let commitment_payload = bincode::serialize(&commitments).expect("commitments must serialize");
        if let Some(primary) = self.participants.iter().find(|p| p.port == final_primary) {
            for port in &known_ports {
                primary.publish(&self.bus, *port, MessageKind::RCommitment, commitment_payload.clone());
            }
        }

        let final_block = FinalBlock {
            epoch,
            committee_order,
            transactions: merged,
        };
        self.ledger.append(LedgerEntry {
            epoch,
            final_block,
            commitments,
            next_epoch_randomness: round.derive_next_randomness(r_bits),
            opened_shares: round.opened_values(),
        });

        info!(
            "epoch {epoch} complete: {} committees settled, {} envelopes dropped (unknown sender), {} dropped (bad signature), {} invalid PoW, {} committee-full rejections, {} PBFT rounds stalled",
            collector.accepted_count(),
            diagnostics.unknown_senders_dropped,
            diagnostics.signature_mismatches_dropped,
            diagnostics.invalid_pow_rejected,
            diagnostics.committee_full_rejections,
            diagnostics.pbft_rounds_stalled,
        );
        self.last_diagnostics = diagnostics;
        Ok(())
    }

    /// Drive one PBFT round (pre-prepare/prepare/commit) to completion, one
    /// tick at a time: each tick drains every roster member's mailbox into
    /// that member's own `PbftLog`, advances its `epoch_state` by exactly
    /// one event, and executes whatever `Action` the state machine emits by
    /// publishing a signed envelope to every other roster member. A
    /// participant with `faulty` or `pbft_byzantine` set still advances its
    /// own state machine (it believes it acted) but never actually
    /// publishes — an omission fault, the only kind of Byzantine behavior
    /// this round can't simply reject outright.
    ///
    /// Returns `true` once every non-Byzantine roster member's log reaches
    /// `committed(0, seq, digest)`, or `false` if `tick_budget` elapses
    /// first.
    fn run_pbft_round(
        bus: &B,
        participants: &mut [Participant],
        roster: &[Identity],
        primary_port: u16,
        seq: u64,
        f: usize,
        final_committee: bool,
        entry_state: EpochState,
        digest: &str,
        tick_budget: u64,
    ) -> bool {
        let roster_ports: HashSet<u16> = roster.iter().map(|id| id.port).collect();
        let byzantine_ports: HashSet<u16> = participants
            .iter()
            .filter(|p| roster_ports.contains(&p.port) && (p.faulty || p.pbft_byzantine))
            .map(|p| p.port)
            .collect();
        if byzantine_ports.len() >= roster_ports.len() {
            // no honest member left to drive or witness consensus
            return false;
        }
        let mode = if final_committee { Mode::Final } else { Mode::Intra };
        let mut logs: HashMap<u16, PbftLog> = roster_ports.iter().map(|&p| (p, PbftLog::new(mode, f))).collect();
        let digest_payload_bytes = bincode::serialize(&digest.to_string()).expect("digest must serialize");

        let mut consumed_primary = false;
        let mut consumed_pre_prepare: HashSet<u16> = HashSet::new();
        let mut consumed_prepare_q: HashSet<u16> = HashSet::new();
        let mut consumed_commit_q: HashSet<u16> = HashSet::new();

        for _tick in 0..tick_budget {
            for &port in &roster_ports {
                for envelope in bus.drain(port) {
                    if !roster_ports.contains(&envelope.sender.port) || !envelope.verify_signature() {
                        continue;
                    }
                    let Ok(claimed_digest) = bincode::deserialize::<String>(&envelope.payload) else { continue };
                    let log = logs.get_mut(&port).expect("a log exists for every roster port");
                    match envelope.kind {
                        MessageKind::PrePrepare { final_committee: fc } if fc == final_committee => {
                            let _ = log.log_pre_prepare(0, seq, &claimed_digest, envelope.sender.port);
                        }
                        MessageKind::Prepare { final_committee: fc } if fc == final_committee => {
                            log.log_prepare(0, seq, &claimed_digest, envelope.sender.port);
                        }
                        MessageKind::Commit { final_committee: fc } if fc == final_committee => {
                            log.log_commit(0, seq, &claimed_digest, envelope.sender.port);
                        }
                        _ => {}
                    }
                }
            }

            for participant in participants.iter_mut() {
                if !roster_ports.contains(&participant.port) {
                    continue;
                }
                let log = &logs[&participant.port];
                let event = if participant.port == primary_port && !consumed_primary && participant.epoch_state == entry_state {
                    consumed_primary = true;
                    Event::BecamePrimary
                } else if !consumed_pre_prepare.contains(&participant.port) && log.has_pre_prepare(0, seq, digest) {
                    consumed_pre_prepare.insert(participant.port);
                    Event::PrePrepareArrived
                } else if !consumed_prepare_q.contains(&participant.port) && log.prepared(0, seq, digest) {
                    consumed_prepare_q.insert(participant.port);
                    Event::PrepareQuorumReached
                } else if !consumed_commit_q.contains(&participant.port) && log.committed(0, seq, digest) {
                    consumed_commit_q.insert(participant.port);
                    Event::CommitQuorumReached
                } else {
                    Event::Tick
                };

                let (new_state, actions) = step(participant.epoch_state, &[event]);
                participant.epoch_state = new_state;

                if byzantine_ports.contains(&participant.port) {
                    continue;
                }
                for action in actions {
                    match action {
                        Action::SendPrePrepare => {
                            for &recipient in &roster_ports {
                                participant.publish(bus, recipient, MessageKind::PrePrepare { final_committee }, digest_payload_bytes.clone());
                            }
                        }
                        Action::SendPrepare => {
                            for &recipient in &roster_ports {
                                participant.publish(bus, recipient, MessageKind::Prepare { final_committee }, digest_payload_bytes.clone());
                            }
                        }
                        Action::SendCommit => {
                            for &recipient in &roster_ports {
                                participant.publish(bus, recipient, MessageKind::Commit { final_committee }, digest_payload_bytes.clone());
                            }
                        }
                        _ => {}
                    }
                }
            }

            if roster_ports.iter().filter(|p| !byzantine_ports.contains(p)).all(|p| logs[p].committed(0, seq, digest)) {
                return true;
            }
        }

        roster_ports.iter().filter(|p| !byzantine_ports.contains(p)).any(|p| logs[p].committed(0, seq, digest))
    }

    /// Drive the final committee's epoch-randomness commit/reveal round:
    /// each member commits to a secret `Ri` over `RANDOMNESS_ADDRESS`, then
    /// (once `needed` commitments are in) opens it, with every reveal
    /// validated against its earlier commitment before counting toward
    /// quorum.
    fn run_randomness_round(
        bus: &B,
        participants: &mut [Participant],
        final_roster: &[Identity],
        r_bits: u32,
        rng: &mut impl RngCore,
        known_ports: &HashSet<u16>,
        diagnostics: &mut Diagnostics,
        needed: usize,
    ) -> RandomnessRound {
        let final_ports: HashSet<u16> = final_roster.iter().map(|id| id.port).collect();
        let mut round = RandomnessRound::new();
        let mut secrets: HashMap<u16, String> = HashMap::new();

        for participant in participants.iter_mut() {
            if !final_ports.contains(&participant.port) {
                continue;
            }
            let (s, _) = step(participant.epoch_state, &[Event::Tick]); // GeneratingRandomnessSecret -> BroadcastingCommitment
            participant.epoch_state = s;
            let secret = random_bitstring_with(rng, r_bits);
            let digest = sha256_bytes(secret.as_bytes());
            let payload = bincode::serialize(&digest).expect("commitment digest must serialize");
            participant.publish(bus, RANDOMNESS_ADDRESS, MessageKind::Commitment, payload);
            secrets.insert(participant.port, secret);
        }

        for envelope in bus.drain(RANDOMNESS_ADDRESS) {
            if !accept_envelope(&envelope, known_ports, diagnostics) || !final_ports.contains(&envelope.sender.port) {
                continue;
            }
            if matches!(envelope.kind, MessageKind::Commitment) {
                if let Ok(digest) = bincode::deserialize::<[u8; 32]>(&envelope.payload) {
                    round.add_commitment(envelope.sender.port, digest);
                }
            }
        }

        for participant in participants.iter_mut() {
            if !final_ports.contains(&participant.port) {
                continue;
            }
            let (s, _) = step(participant.epoch_state, &[Event::Tick]); // BroadcastingCommitment -> AwaitingCommitmentQuorum
            participant.epoch_state = s;
        }

        if round.commitment_count() >= needed {
            for participant in participants.iter_mut() {
                if !final_ports.contains(&participant.port) {
                    continue;
                }
                let (s, _) = step(participant.epoch_state, &[Event::CommitmentQuorumReached]); // -> RevealingRandomness
                participant.epoch_state = s;
                if let Some(secret) = secrets.get(&participant.port) {
                    let payload = bincode::serialize(secret).expect("secret must serialize");
                    participant.publish(bus, RANDOMNESS_ADDRESS, MessageKind::RiOpen, payload);
                }
            }
        }

        for envelope in bus.drain(RANDOMNESS_ADDRESS) {
            if !accept_envelope(&envelope, known_ports, diagnostics) || !final_ports.contains(&envelope.sender.port) {
                continue;
            }
            if matches!(envelope.kind, MessageKind::RiOpen) {
                if let Ok(ri) = bincode::deserialize::<String>(&envelope.payload) {
                    round.add_reveal(envelope.sender.port, ri);
                }
            }
        }

        for participant in participants.iter_mut() {
            if !final_ports.contains(&participant.port) || participant.epoch_state != EpochState::RevealingRandomness {
                continue;
            }
            let (s, _) = step(participant.epoch_state, &[Event::Tick]); // -> AwaitingRevealQuorum
            participant.epoch_state = s;
            if round.quorum_reached(needed) {
                let (s, _) = step(participant.epoch_state, &[Event::RevealQuorumReached]); // -> EpochComplete
                participant.epoch_state = s;
            }
        }

        round
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InMemoryBus;

    #[test]
    fn simulator_assigns_distinct_ports() {
        let config = Config::builder().n(10).s(1).c(2).d_difficulty(1).build().unwrap();
        let sim = Simulator::new(config, InMemoryBus::new());
        let ports: HashSet<u16> = sim.participants.iter().map(|p| p.port).collect();
        assert_eq!(ports.len(), 10);
    }

    #[test]
    fn happy_epoch_with_no_byzantine_participants_completes() {
        // n is large relative to committee_count*c so both committees clear
        // capacity with overwhelming probability despite random assignment.
        let config = Config::builder().n(48).s(1).c(4).d_difficulty(1).txns_per_epoch(8).build().unwrap();
        let mut sim = Simulator::new(config, InMemoryBus::new());
        let txns: Vec<Transaction> = (0..8).map(|i| Transaction::new("a", "b", i)).collect();
        let result = sim.run_epoch(0, txns, 100);
        assert!(result.is_ok(), "expected epoch to complete, got {result:?}");
        assert_eq!(sim.ledger.len(), 1);
    }

    #[test]
    fn every_participant_advances_its_own_epoch_state_machine() {
        let config = Config::builder().n(16).s(0).c(4).d_difficulty(1).txns_per_epoch(4).build().unwrap();
        let mut sim = Simulator::new(config, InMemoryBus::new());
        let txns: Vec<Transaction> = (0..4).map(|i| Transaction::new("a", "b", i)).collect();
        sim.run_epoch(0, txns, 100).expect("epoch should complete");
        assert!(sim.participants.iter().any(|p| p.epoch_state == EpochState::EpochComplete));
        assert!(sim.participants.iter().all(|p| p.epoch_state != EpochState::Idle));
    }

    #[test]
    fn a_byzantine_primary_withholding_its_pre_prepare_stalls_the_committee() {
        let config = Config::builder().n(4).s(0).c(4).d_difficulty(1).txns_per_epoch(4).build().unwrap();
        let mut sim = Simulator::new(config, InMemoryBus::new());
        sim.participants[0].pbft_byzantine = true;
        let txns: Vec<Transaction> = (0..4).map(|i| Transaction::new("a", "b", i)).collect();
        let result = sim.run_epoch(0, txns, 20);
        assert!(matches!(result, Err(ElasticoError::StalledEpoch { .. })), "expected a stall, got {result:?}");
    }
}
