//! Shared PBFT engine: pre-prepare/prepare/commit phases with message logs,
//! quorum tests, and the `prepared`/`committed` predicates. One `PbftLog`
//! instance tracks a single participant's view of a single (intra- or
//! final-committee) consensus round; `Mode` only labels which kind of round
//! it is, for logging.

use std::collections::{BTreeSet, HashMap};

use log::{info, warn};
use serde::Serialize;

use crate::crypto::sha256_hex;
use crate::error::ElasticoError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Intra,
    Final,
}

/// PBFT phase a single (view, seq) run moves through. `None` is the entry
/// state before any message has been processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    None,
    PrePrepare,
    PrePrepareSent,
    PrepareSent,
    Prepared,
    CommitSent,
    Committed,
}

/// Signable bytes for a PBFT vote, binding `(view, seq, digest, phase_tag)`
/// together so a vote can't be replayed into a different phase or round.
pub fn signable_bytes(view: u64, seq: u64, digest_hex: &str, phase_tag: &str) -> Vec<u8> {
    format!("{view}:{seq}:{digest_hex}:{phase_tag}").into_bytes()
}

/// Canonical digest of a PBFT payload: bincode gives fixed field order and
/// fixed integer encoding, so the same logical value always hashes the same
/// way regardless of which node computed it.
pub fn digest_payload<P: Serialize>(payload: &P) -> String {
    let bytes = bincode::serialize(payload).expect("PBFT payload must be serializable");
    sha256_hex(&bytes)
}

/// One participant's message log for a single PBFT round, keyed internally
/// by `(view, seq)`. Each participant keeps its own `PbftLog`, fed only by
/// envelopes it has received and validated off the bus — there is no shared
/// log a node can read another's state from.
pub struct PbftLog {
    mode: Mode,
    f: usize,
    phase: Phase,
    pre_prepare: Option<(u64, u64, String)>, // (view, seq, digest) — at most one
    prepares: HashMap<(u64, u64, String), BTreeSet<u16>>,
    commits: HashMap<(u64, u64, String), BTreeSet<u16>>,
}

impl PbftLog {
    pub fn new(mode: Mode, f: usize) -> Self {
        PbftLog {
            mode,
            f,
            phase: Phase::None,
            pre_prepare: None,
            prepares: HashMap::new(),
            commits: HashMap::new(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn set_phase(&mut self, phase: Phase) {
        self.phase = phase;
    }

    /// Log a pre-prepare. A duplicate pre-prepare for the same `(view,
    /// seq)` with a *different* digest is equivocation and is discarded;
    /// the same digest twice is a harmless duplicate.
    pub fn log_pre_prepare(&mut self, view: u64, seq: u64, digest: &str, primary_port: u16) -> Result<(), ElasticoError> {
        match &self.pre_prepare {
            Some((v, n, d)) if *v == view && *n == seq => {
                if d != digest {
                    warn!("{:?} PBFT equivocating pre-prepare from port {primary_port} at (view={view}, seq={seq})", self.mode);
                    return Err(ElasticoError::Equivocation { view, seq, primary_port });
                }
                Ok(())
            }
            _ => {
                self.pre_prepare = Some((view, seq, digest.to_string()));
                info!("{:?} PBFT logged pre-prepare (view={view}, seq={seq}) from port {primary_port}", self.mode);
                Ok(())
            }
        }
    }

    pub fn has_pre_prepare(&self, view: u64, seq: u64, digest: &str) -> bool {
        matches!(&self.pre_prepare, Some((v, n, d)) if *v == view && *n == seq && d == digest)
    }

    /// Log a prepare vote from `sender_port`. Dedupes by sender.
    pub fn log_prepare(&mut self, view: u64, seq: u64, digest: &str, sender_port: u16) {
        self.prepares
            .entry((view, seq, digest.to_string()))
            .or_default()
            .insert(sender_port);
    }

    /// Log a commit vote from `sender_port`. Dedupes by sender.
    pub fn log_commit(&mut self, view: u64, seq: u64, digest: &str, sender_port: u16) {
        self.commits
            .entry((view, seq, digest.to_string()))
            .or_default()
            .insert(sender_port);
    }

    fn prepare_count(&self, view: u64, seq: u64, digest: &str) -> usize {
        self.prepares
            .get(&(view, seq, digest.to_string()))
            .map(|s| s.len())
            .unwrap_or(0)
    }

    fn commit_count(&self, view: u64, seq: u64, digest: &str) -> usize {
        self.commits
            .get(&(view, seq, digest.to_string()))
            .map(|s| s.len())
            .unwrap_or(0)
    }

    /// `prepared(v,n,d)`: logged matching pre-prepare and at least `2f`
    /// distinct prepares for `d`. The primary does not send a prepare in
    /// this design, so `2f` (not `2f+1`) non-primary votes suffice.
    pub fn prepared(&self, view: u64, seq: u64, digest: &str) -> bool {
        self.has_pre_prepare(view, seq, digest) && self.prepare_count(view, seq, digest) >= 2 * self.f
    }

    /// `committed(v,n,d)`: `prepared(v,n,d)` and at least `2f+1` distinct
    /// commits for `d`.
    pub fn committed(&self, view: u64, seq: u64, digest: &str) -> bool {
        self.prepared(view, seq, digest) && self.commit_count(view, seq, digest) >= 2 * self.f + 1
    }

    pub fn quorum_needed_for_commit(&self) -> usize {
        2 * self.f + 1
    }

    pub fn quorum_needed_for_prepare(&self) -> usize {
        2 * self.f
    }
}

/// Primary selection: the identity with the smallest port in the roster is
/// primary of view 0.
pub fn select_primary_port(roster: &[crate::identity::Identity]) -> Option<u16> {
    roster.iter().map(|id| id.port).min()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prepared_fires_exactly_at_2f_distinct_prepares() {
        let mut log = PbftLog::new(Mode::Intra, 1); // f=1, needs 2 prepares
        log.log_pre_prepare(0, 0, "dig", 1).unwrap();
        assert!(!log.prepared(0, 0, "dig"));
        log.log_prepare(0, 0, "dig", 2);
        assert!(!log.prepared(0, 0, "dig"));
        log.log_prepare(0, 0, "dig", 3);
        assert!(log.prepared(0, 0, "dig"));
    }

    #[test]
    fn duplicate_sender_prepare_does_not_double_count() {
        let mut log = PbftLog::new(Mode::Intra, 1);
        log.log_pre_prepare(0, 0, "dig", 1).unwrap();
        log.log_prepare(0, 0, "dig", 2);
        log.log_prepare(0, 0, "dig", 2);
        assert!(!log.prepared(0, 0, "dig"));
    }

    #[test]
    fn committed_requires_prepared_first() {
        let mut log = PbftLog::new(Mode::Intra, 0); // f=0: prepared needs 0 prepares
        log.log_pre_prepare(0, 0, "dig", 1).unwrap();
        assert!(log.prepared(0, 0, "dig"));
        assert!(!log.committed(0, 0, "dig"));
        log.log_commit(0, 0, "dig", 2);
        assert!(log.committed(0, 0, "dig"));
    }

    #[test]
    fn equivocating_pre_prepare_is_rejected_and_discarded() {
        let mut log = PbftLog::new(Mode::Intra, 1);
        log.log_pre_prepare(0, 0, "dig-a", 1).unwrap();
        let err = log.log_pre_prepare(0, 0, "dig-b", 1).unwrap_err();
        assert_eq!(err, ElasticoError::Equivocation { view: 0, seq: 0, primary_port: 1 });
        // original digest is preserved
        assert!(log.has_pre_prepare(0, 0, "dig-a"));
        assert!(!log.has_pre_prepare(0, 0, "dig-b"));
    }

    #[test]
    fn digest_payload_is_deterministic_across_calls() {
        #[derive(Serialize)]
        struct Payload {
            a: u64,
            b: String,
        }
        let p = Payload { a: 1, b: "x".to_string() };
        assert_eq!(digest_payload(&p), digest_payload(&p));
    }
}
