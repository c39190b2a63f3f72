//! End-to-end epoch scenarios, exercised through the public `Simulator` API
//! rather than any single module's internals — mirrors `bleep-consensus`'s
//! own `tests/phase1_integration_test.rs` placement.

use elastico_core::bus::InMemoryBus;
use elastico_core::node::Simulator;
use elastico_core::transaction::Transaction;
use elastico_core::{Config, ElasticoError};

fn txns(n: usize) -> Vec<Transaction> {
    (0..n).map(|i| Transaction::new("alice", "bob", i as u64)).collect()
}

#[test_log::test]
fn happy_epoch_with_generous_committee_headroom_completes() {
    let config = Config::builder().n(60).s(1).c(4).d_difficulty(1).txns_per_epoch(10).build().unwrap();
    let mut sim = Simulator::new(config, InMemoryBus::new());
    let result = sim.run_epoch(0, txns(10), 100);
    assert!(result.is_ok(), "expected epoch to complete, got {result:?}");
    let entry = sim.ledger.get(0).expect("epoch 0 recorded");
    let total: usize = entry.final_block.transactions.len();
    assert_eq!(total, 10, "every transaction should appear exactly once in the merged block");
}

#[test_log::test]
fn an_entirely_byzantine_population_cannot_form_any_committee() {
    // Every participant mines a fake PoW, which `verify_pow` rejects with
    // overwhelming probability (it recomputes the real preimage hash and
    // compares, so a fabricated digest essentially never matches). No
    // committee ever fills, so the epoch stalls rather than silently
    // producing a block with no real consensus behind it.
    let config = Config::builder().n(20).s(1).c(4).d_difficulty(1).faulty_fraction(1.0).build().unwrap();
    let mut sim = Simulator::new(config, InMemoryBus::new());
    let result = sim.run_epoch(0, txns(4), 50);
    assert!(matches!(result, Err(ElasticoError::StalledEpoch { .. })), "expected a stall, got {result:?}");
    assert!(sim.ledger.is_empty(), "a stalled epoch must not be appended to the ledger");
}

#[test]
fn two_epochs_in_sequence_each_append_exactly_one_ledger_entry() {
    let config = Config::builder().n(60).s(1).c(4).d_difficulty(1).txns_per_epoch(6).build().unwrap();
    let mut sim = Simulator::new(config, InMemoryBus::new());
    sim.run_epoch(0, txns(6), 100).expect("epoch 0 should complete");
    sim.run_epoch(1, txns(6), 100).expect("epoch 1 should complete, chained off epoch 0's randomness");
    assert_eq!(sim.ledger.len(), 2);
    assert_eq!(sim.ledger.get(0).unwrap().epoch, 0);
    assert_eq!(sim.ledger.get(1).unwrap().epoch, 1);
}

#[test_log::test]
fn a_byzantine_primary_withholding_its_pre_prepare_stalls_the_committee() {
    // Single committee (s=0) so every registrant lands in the same roster
    // and the primary is deterministically the smallest port. Marking that
    // participant `pbft_byzantine` lets it win a real committee seat (PoW
    // mining is unaffected) while it silently withholds the pre-prepare it
    // owes the rest of the committee as primary.
    let config = Config::builder().n(4).s(0).c(4).d_difficulty(1).txns_per_epoch(4).build().unwrap();
    let mut sim = Simulator::new(config, InMemoryBus::new());
    let primary_port = sim.participants.iter().map(|p| p.port).min().unwrap();
    sim.participants.iter_mut().find(|p| p.port == primary_port).unwrap().pbft_byzantine = true;

    let result = sim.run_epoch(0, txns(4), 50);
    assert!(matches!(result, Err(ElasticoError::StalledEpoch { .. })), "expected a stall, got {result:?}");
    assert!(sim.ledger.is_empty(), "a stalled epoch must not be appended to the ledger");
}

#[test_log::test]
fn replaying_the_same_seed_produces_a_byte_identical_ledger() {
    let config = Config::builder().n(40).s(1).c(4).d_difficulty(1).txns_per_epoch(6).build().unwrap();

    let mut sim_a = Simulator::with_seed(config, InMemoryBus::new(), 42);
    sim_a.run_epoch(0, txns(6), 100).expect("epoch 0 should complete");

    let mut sim_b = Simulator::with_seed(config, InMemoryBus::new(), 42);
    sim_b.run_epoch(0, txns(6), 100).expect("epoch 0 should complete");

    let entry_a = bincode::serialize(sim_a.ledger.get(0).unwrap()).unwrap();
    let entry_b = bincode::serialize(sim_b.ledger.get(0).unwrap()).unwrap();
    assert_eq!(entry_a, entry_b, "identical seeds must replay to a byte-identical ledger entry");
}

#[test_log::test]
fn excess_registrants_in_a_full_committee_are_rejected_not_silently_dropped() {
    // s=0 forces every registrant into the single committee of capacity c,
    // so with n well past c, the late registrants must be turned away with
    // `CommitteeFull` rather than quietly vanishing from the roster.
    let config = Config::builder().n(20).s(0).c(4).d_difficulty(1).txns_per_epoch(4).build().unwrap();
    let mut sim = Simulator::new(config, InMemoryBus::new());
    let result = sim.run_epoch(0, txns(4), 100);
    assert!(result.is_ok(), "expected epoch to complete, got {result:?}");
    assert!(
        sim.last_diagnostics.committee_full_rejections > 0,
        "expected some registrants to be rejected once the only committee filled"
    );
}
