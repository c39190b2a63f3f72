//! Final-committee assembly: collecting each intra committee's consensus
//! result, merging them into one block, running the final PBFT round over
//! the merge, and driving the epoch-randomness commit/reveal protocol that
//! seeds the next epoch's PoW puzzle.

use std::collections::{HashMap, HashSet};

use log::{info, warn};

use crate::crypto::{sha256_bytes, xor_bitstrings};
use crate::pbft::digest_payload;
use crate::transaction::Transaction;

/// Gathers each committee's intra-consensus output as it's forwarded by
/// that committee's members. `needed` (`c/2+1`) matching copies from
/// distinct senders are required before a committee's result is trusted.
pub struct FinalityCollector {
    needed: usize,
    received: HashMap<u64, HashMap<String, HashSet<u16>>>,
    accepted: HashMap<u64, Vec<Transaction>>,
}

impl FinalityCollector {
    pub fn new(needed: usize) -> Self {
        FinalityCollector {
            needed,
            received: HashMap::new(),
            accepted: HashMap::new(),
        }
    }

    /// Record one committee member's forwarded copy of their committee's
    /// committed shard. Idempotent per `(committee_id, sender_port)`.
    pub fn receive(&mut self, committee_id: u64, transactions: Vec<Transaction>, sender_port: u16) {
        if self.accepted.contains_key(&committee_id) {
            return;
        }
        let digest = digest_payload(&transactions);
        let senders = self.received.entry(committee_id).or_default().entry(digest).or_default();
        senders.insert(sender_port);
        if senders.len() >= self.needed {
            info!("final committee accepted committee {committee_id}'s result ({} matching copies)", senders.len());
            self.accepted.insert(committee_id, transactions);
        }
    }

    pub fn is_accepted(&self, committee_id: u64) -> bool {
        self.accepted.contains_key(&committee_id)
    }

    pub fn accepted_count(&self) -> usize {
        self.accepted.len()
    }

    /// True once every committee in `0..committee_count` has an accepted
    /// result; the final committee waits for all of them before merging.
    pub fn all_accepted(&self, committee_count: u64) -> bool {
        (0..committee_count).all(|id| self.accepted.contains_key(&id))
    }

    /// Merge every accepted committee's transactions, concatenated in
    /// ascending committee-id order (see DESIGN.md for why ascending-id was
    /// picked over arrival order).
    pub fn merge_ascending(&self) -> (Vec<u64>, Vec<Transaction>) {
        let mut ids: Vec<u64> = self.accepted.keys().copied().collect();
        ids.sort_unstable();
        let merged = ids.iter().flat_map(|id| self.accepted[id].clone()).collect();
        (ids, merged)
    }
}

/// Epoch-randomness commit/reveal. Each final-committee member picks a
/// secret `Ri`, broadcasts `SHA256(Ri)` first, and only opens `Ri` once it
/// has gathered `needed` digests from others.
#[derive(Default)]
pub struct RandomnessRound {
    commitments: HashMap<u16, [u8; 32]>,
    opened: HashMap<u16, String>,
}

impl RandomnessRound {
    pub fn new() -> Self {
        RandomnessRound::default()
    }

    /// Record a commitment digest from `sender_port`. The reveal for that
    /// sender must later match this digest exactly.
    pub fn add_commitment(&mut self, sender_port: u16, digest: [u8; 32]) {
        self.commitments.entry(sender_port).or_insert(digest);
    }

    pub fn commitment_count(&self) -> usize {
        self.commitments.len()
    }

    /// Record an opened `Ri` from `sender_port`. Rejected if it doesn't
    /// match the commitment already on file for that sender, or if no
    /// commitment was ever recorded.
    pub fn add_reveal(&mut self, sender_port: u16, ri: String) -> bool {
        match self.commitments.get(&sender_port) {
            Some(digest) if *digest == sha256_bytes(ri.as_bytes()) => {
                self.opened.insert(sender_port, ri);
                true
            }
            Some(_) => {
                warn!("reveal from port {sender_port} does not match its earlier commitment, dropped");
                false
            }
            None => {
                warn!("reveal from port {sender_port} with no prior commitment, dropped");
                false
            }
        }
    }

    pub fn opened_count(&self) -> usize {
        self.opened.len()
    }

    pub fn quorum_reached(&self, needed: usize) -> bool {
        self.opened.len() >= needed
    }

    /// XOR of every opened `Ri`, the next epoch's `epoch_randomness`.
    /// Commitment digests feed the *next* epoch's `r_commitment_set`, kept
    /// by the caller via `ledger::LedgerEntry`.
    pub fn derive_next_randomness(&self, r_bits: u32) -> String {
        let values = self.opened_values();
        xor_bitstrings(r_bits, &values)
    }

    /// Sorted by sender port rather than left in hashmap order, so two runs
    /// that open the same set of `Ri`s serialize identically.
    pub fn commitment_digests(&self) -> Vec<[u8; 32]> {
        let mut entries: Vec<_> = self.commitments.iter().collect();
        entries.sort_unstable_by_key(|(port, _)| **port);
        entries.into_iter().map(|(_, digest)| *digest).collect()
    }

    /// Raw opened `Ri` strings, published alongside the final block so every
    /// participant (not only the final committee) can embed them in the
    /// next epoch's PoW witness (`set_of_Rs`). Sorted by sender port for the
    /// same reproducibility reason as `commitment_digests`.
    pub fn opened_values(&self) -> Vec<String> {
        let mut entries: Vec<_> = self.opened.iter().collect();
        entries.sort_unstable_by_key(|(port, _)| **port);
        entries.into_iter().map(|(_, ri)| ri.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn txn(amount: u64) -> Transaction {
        Transaction::new("a", "b", amount)
    }

    #[test]
    fn committee_result_accepted_once_quorum_of_matching_copies_arrives() {
        let mut collector = FinalityCollector::new(2);
        collector.receive(0, vec![txn(1)], 10);
        assert!(!collector.is_accepted(0));
        collector.receive(0, vec![txn(1)], 11);
        assert!(collector.is_accepted(0));
    }

    #[test]
    fn mismatched_copies_do_not_count_toward_each_others_quorum() {
        let mut collector = FinalityCollector::new(2);
        collector.receive(0, vec![txn(1)], 10);
        collector.receive(0, vec![txn(2)], 11);
        assert!(!collector.is_accepted(0));
    }

    #[test]
    fn merge_concatenates_in_ascending_committee_id_order() {
        let mut collector = FinalityCollector::new(1);
        collector.receive(1, vec![txn(9)], 1);
        collector.receive(0, vec![txn(5)], 2);
        let (ids, merged) = collector.merge_ascending();
        assert_eq!(ids, vec![0, 1]);
        assert_eq!(merged, vec![txn(5), txn(9)]);
    }

    #[test]
    fn randomness_round_rejects_reveal_not_matching_commitment() {
        let mut round = RandomnessRound::new();
        round.add_commitment(1, sha256_bytes(b"secret-a"));
        assert!(!round.add_reveal(1, "secret-b".to_string()));
        assert!(round.add_reveal(1, "secret-a".to_string()));
        assert_eq!(round.opened_count(), 1);
    }

    #[test]
    fn randomness_derivation_is_xor_of_opened_values() {
        let mut round = RandomnessRound::new();
        round.add_commitment(1, sha256_bytes(b"1010"));
        round.add_commitment(2, sha256_bytes(b"0110"));
        round.add_reveal(1, "1010".to_string());
        round.add_reveal(2, "0110".to_string());
        assert!(round.quorum_reached(2));
        assert_eq!(round.derive_next_randomness(4), xor_bitstrings(4, &["1010".to_string(), "0110".to_string()]));
    }
}
