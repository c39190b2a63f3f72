//! Sharded Byzantine consensus simulator core.
//!
//! A participant mines an identity-binding PoW puzzle to join one of
//! `2^s` committees, each committee runs intra-committee PBFT over its
//! transaction shard, a designated final committee merges and re-commits
//! every committee's result into one block, and the final committee's
//! epoch-randomness commit/reveal round seeds the next epoch's puzzle.
//!
//! `node::Simulator` is the entry point for running epochs end to end;
//! the other modules are the pieces it composes.

pub mod bus;
pub mod config;
pub mod crypto;
pub mod directory;
pub mod epoch;
pub mod error;
pub mod finality;
pub mod identity;
pub mod ledger;
pub mod node;
pub mod pbft;
pub mod pow;
pub mod transaction;

pub use config::Config;
pub use error::{ElasticoError, Result};
pub use node::Simulator;

/// Install `env_logger` from `RUST_LOG` (or `info` if unset), the usual
/// convention for binaries that embed this crate.
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InMemoryBus;
    use crate::transaction::Transaction;

    #[test]
    fn two_epochs_chain_their_randomness() {
        let config = Config::builder().n(48).s(1).c(4).d_difficulty(1).txns_per_epoch(4).build().unwrap();
        let mut sim = Simulator::new(config, InMemoryBus::new());

        let epoch0_txns: Vec<Transaction> = (0..4).map(|i| Transaction::new("a", "b", i)).collect();
        sim.run_epoch(0, epoch0_txns, 100).expect("epoch 0 should complete");
        let randomness_for_epoch1 = sim.ledger.get(0).unwrap().next_epoch_randomness.clone();

        let epoch1_txns: Vec<Transaction> = (0..4).map(|i| Transaction::new("c", "d", i)).collect();
        sim.run_epoch(1, epoch1_txns, 100).expect("epoch 1 should complete using epoch 0's randomness");

        assert_eq!(sim.ledger.len(), 2);
        assert_eq!(randomness_for_epoch1.len(), 4);
    }
}
