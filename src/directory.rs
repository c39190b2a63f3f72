//! Directory committee: accepts registrations, partitions them by committee
//! id, and produces the rosters + transaction shards that get multicast
//! once every committee is full.
//!
//! This struct is the *logic* every directory member runs identically on
//! the same registration stream; the underlying multicast fan-out is
//! transport plumbing, wired up to the bus by the driver (see `node.rs`),
//! not this module.

use std::collections::{HashMap, HashSet};

use log::{info, warn};

use crate::error::ElasticoError;
use crate::identity::{self, Identity};
use crate::transaction::{shard_transactions, Transaction};

pub struct Directory {
    committee_count: u64,
    capacity: usize,
    difficulty: usize,
    r_bits: u32,
    committee_list: HashMap<u64, Vec<Identity>>,
    seen_ports: HashSet<u16>,
}

impl Directory {
    pub fn new(committee_count: u64, capacity: usize, difficulty: usize, r_bits: u32) -> Self {
        Directory {
            committee_count,
            capacity,
            difficulty,
            r_bits,
            committee_list: HashMap::new(),
            seen_ports: HashSet::new(),
        }
    }

    /// Accept a `NewIdentity` registration. Verifies the PoW, then appends
    /// to that identity's committee if there's room.
    ///
    /// `InvalidPoW` and `CommitteeFull` are both locally recoverable: they
    /// are returned so the caller can count them, never panics.
    pub fn register(&mut self, identity: Identity, r_commitment_set: &HashSet<[u8; 32]>) -> Result<(), ElasticoError> {
        if self.seen_ports.contains(&identity.port) {
            // Idempotent under the bus's FIFO-but-possibly-duplicated model.
            return Ok(());
        }
        if !identity::verify_pow(&identity, self.difficulty, self.r_bits, r_commitment_set) {
            warn!("directory rejected identity on port {} with invalid PoW", identity.port);
            return Err(ElasticoError::InvalidPoW {
                port: identity.port,
                reason: "PoW failed verification".to_string(),
            });
        }
        let expected_committee = identity::committee_id_from_hash(&identity.pow.hash, self.committee_count.trailing_zeros());
        debug_assert_eq!(expected_committee, identity.committee_id);

        let bucket = self.committee_list.entry(identity.committee_id).or_default();
        if bucket.len() >= self.capacity {
            warn!("committee {} full, rejecting port {}", identity.committee_id, identity.port);
            return Err(ElasticoError::CommitteeFull {
                committee_id: identity.committee_id,
                port: identity.port,
            });
        }
        self.seen_ports.insert(identity.port);
        info!("directory registered port {} into committee {}", identity.port, identity.committee_id);
        bucket.push(identity);
        Ok(())
    }

    /// True once every committee (0..committee_count) has reached capacity.
    pub fn all_committees_full(&self) -> bool {
        (0..self.committee_count).all(|id| {
            self.committee_list
                .get(&id)
                .map(|m| m.len() == self.capacity)
                .unwrap_or(false)
        })
    }

    pub fn roster_for(&self, committee_id: u64) -> Vec<Identity> {
        self.committee_list.get(&committee_id).cloned().unwrap_or_default()
    }

    pub fn all_rosters(&self) -> HashMap<u64, Vec<Identity>> {
        self.committee_list.clone()
    }

    /// Split `txns` into one contiguous shard per committee.
    pub fn shard_for_committees(&self, txns: &[Transaction]) -> HashMap<u64, Vec<Transaction>> {
        let shards = shard_transactions(txns, self.committee_count);
        shards.into_iter().enumerate().map(|(id, shard)| (id as u64, shard)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Keypair;
    use crate::identity::SimulatedIp;
    use crate::pow::{compute_pow, CancellationToken};

    fn mined_identity(committee_count: u64, difficulty: usize, port: u16) -> Identity {
        let kp = Keypair::generate();
        let ip = SimulatedIp::random();
        let token = CancellationToken::new();
        let mut nonce = 0;
        loop {
            let witness = compute_pow(ip, &kp.public_key(), "0000", difficulty, vec![], nonce, port, &token).unwrap();
            let committee_id = identity::committee_id_from_hash(&witness.hash, committee_count.trailing_zeros());
            return Identity {
                ip,
                public_key: kp.public_key(),
                committee_id,
                pow: witness,
                epoch_randomness: "0000".to_string(),
                port,
            };
            #[allow(unreachable_code)]
            {
                nonce += 1;
            }
        }
    }

    #[test]
    fn committee_closes_exactly_at_capacity_and_rejects_overflow() {
        let mut dir = Directory::new(1, 2, 1, 4);
        let commitments = HashSet::new();
        let a = mined_identity(1, 1, 1);
        let b = mined_identity(1, 1, 2);
        let c = mined_identity(1, 1, 3);
        dir.register(a, &commitments).unwrap();
        dir.register(b, &commitments).unwrap();
        let err = dir.register(c, &commitments).unwrap_err();
        assert!(matches!(err, ElasticoError::CommitteeFull { .. }));
        assert_eq!(dir.roster_for(0).len(), 2);
    }

    #[test]
    fn rejects_invalid_pow() {
        let mut dir = Directory::new(1, 4, 1, 4);
        let mut bad = mined_identity(1, 1, 1);
        bad.pow.hash = "f".repeat(64);
        let commitments = HashSet::new();
        let err = dir.register(bad, &commitments).unwrap_err();
        assert!(matches!(err, ElasticoError::InvalidPoW { .. }));
    }

    #[test]
    fn all_committees_full_waits_for_every_committee() {
        let mut dir = Directory::new(2, 1, 1, 4);
        let commitments = HashSet::new();
        // Fill committee 0 only, by retrying until we mine an identity that lands there.
        let mut filled_zero = false;
        for port in 1..50u16 {
            let id = mined_identity(2, 1, port);
            if id.committee_id == 0 && !filled_zero {
                dir.register(id, &commitments).unwrap();
                filled_zero = true;
            }
            if filled_zero {
                break;
            }
        }
        assert!(!dir.all_committees_full());
    }
}
