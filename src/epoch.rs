//! Epoch state machine: one `EpochState` per participant per epoch, advanced
//! by `step()` — a pure function from `(state, events)` to `(state,
//! actions)`. `node.rs` owns the side effects (`Action` execution: bus
//! publishes, PoW mining, ledger writes); this module only decides what
//! should happen next.

use serde::{Deserialize, Serialize};

use crate::identity::Identity;
use crate::transaction::Transaction;

/// A participant's position in the epoch lifecycle. Ordered roughly as the
/// happy path visits them; Byzantine/failure paths can also land in
/// `Stalled` from anywhere via the driver's tick budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EpochState {
    Idle,
    GeneratingKeypair,
    MiningPow,
    PowAbortedRetry,
    RegisteringWithDirectory,
    AwaitingCommitteeAssignment,
    CommitteeAssigned,
    AwaitingRoster,
    RosterReceived,
    AwaitingTxnShard,
    TxnShardReceived,
    IntraAwaitingPrePrepare,
    IntraSendingPrePrepare,
    IntraAwaitingPrepareQuorum,
    IntraPrepared,
    IntraSendingCommit,
    IntraAwaitingCommitQuorum,
    IntraCommitted,
    ForwardingResultToFinal,
    FinalAwaitingAllCommitteeResults,
    FinalMerged,
    FinalAwaitingPrePrepare,
    FinalSendingPrePrepare,
    FinalAwaitingPrepareQuorum,
    FinalPrepared,
    FinalSendingCommit,
    FinalAwaitingCommitQuorum,
    FinalCommitted,
    BroadcastingFinalBlock,
    AwaitingFinalBlock,
    GeneratingRandomnessSecret,
    BroadcastingCommitment,
    AwaitingCommitmentQuorum,
    RevealingRandomness,
    AwaitingRevealQuorum,
    EpochComplete,
    Stalled,
}

/// Inbound events the driver hands to `step()` on each tick. The machine
/// itself never polls anything; it only reacts to what it's told arrived.
#[derive(Debug, Clone)]
pub enum Event {
    /// No state-specific signal this tick; only relevant to states whose
    /// transition doesn't depend on which event arrived.
    Tick,
    PowReady,
    PowFailed,
    DirectoryAccepted,
    DirectoryRejectedFull,
    RosterArrived(Vec<Identity>),
    TxnShardArrived(Vec<Transaction>),
    BecamePrimary,
    PrePrepareArrived,
    PrepareQuorumReached,
    CommitQuorumReached,
    AllCommitteeResultsIn,
    SelectedForFinalCommittee,
    NotSelectedForFinalCommittee,
    FinalBlockArrived,
    CommitmentQuorumReached,
    RevealQuorumReached,
    TickBudgetExhausted,
}

/// Outbound side effects `node.rs` is responsible for executing. `step()`
/// only ever returns these; it never performs them itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    StartMiningPow,
    PublishNewIdentity,
    RetryRegistration,
    AwaitRoster,
    AwaitTxnShard,
    SendPrePrepare,
    SendPrepare,
    SendCommit,
    ForwardResultToFinalCommittee,
    AssembleMergedBlock,
    RunFinalPbft,
    BroadcastFinalBlock,
    ValidateFinalBlock,
    GenerateRandomnessSecret,
    BroadcastCommitment,
    RevealRandomness,
    WriteLedgerEntry,
    None,
}

/// Advance one participant's epoch state given a batch of events observed
/// this tick. Unrecognized `(state, event)` pairs are no-ops — most ticks
/// see no relevant event for a given state and should leave it unchanged
/// rather than stall.
pub fn step(state: EpochState, events: &[Event]) -> (EpochState, Vec<Action>) {
    use EpochState::*;
    use Event::*;

    let mut next = state;
    let mut actions = Vec::new();

    for event in events {
        let (new_state, mut action) = match (next, event) {
            (Idle, _) => (GeneratingKeypair, vec![Action::None]),
            (GeneratingKeypair, _) => (MiningPow, vec![Action::StartMiningPow]),
            (MiningPow, PowReady) => (RegisteringWithDirectory, vec![Action::PublishNewIdentity]),
            (MiningPow, PowFailed) => (PowAbortedRetry, vec![Action::RetryRegistration]),
            (PowAbortedRetry, _) => (MiningPow, vec![Action::StartMiningPow]),
            (RegisteringWithDirectory, DirectoryAccepted) => (AwaitingCommitteeAssignment, vec![Action::None]),
            (RegisteringWithDirectory, DirectoryRejectedFull) => (MiningPow, vec![Action::StartMiningPow]),
            (AwaitingCommitteeAssignment, _) => (CommitteeAssigned, vec![Action::None]),
            (CommitteeAssigned, _) => (AwaitingRoster, vec![Action::AwaitRoster]),
            (AwaitingRoster, RosterArrived(_)) => (RosterReceived, vec![Action::None]),
            (RosterReceived, _) => (AwaitingTxnShard, vec![Action::AwaitTxnShard]),
            (AwaitingTxnShard, TxnShardArrived(_)) => (TxnShardReceived, vec![Action::None]),
            (TxnShardReceived, BecamePrimary) => (IntraSendingPrePrepare, vec![Action::SendPrePrepare]),
            (TxnShardReceived, _) => (IntraAwaitingPrePrepare, vec![Action::None]),
            (IntraAwaitingPrePrepare, PrePrepareArrived) => (IntraAwaitingPrepareQuorum, vec![Action::SendPrepare]),
            (IntraSendingPrePrepare, _) => (IntraAwaitingPrepareQuorum, vec![Action::None]),
            (IntraAwaitingPrepareQuorum, PrepareQuorumReached) => (IntraPrepared, vec![Action::SendCommit]),
            (IntraPrepared, _) => (IntraSendingCommit, vec![Action::None]),
            (IntraSendingCommit, _) => (IntraAwaitingCommitQuorum, vec![Action::None]),
            (IntraAwaitingCommitQuorum, CommitQuorumReached) => (IntraCommitted, vec![Action::None]),
            (IntraCommitted, _) => (ForwardingResultToFinal, vec![Action::ForwardResultToFinalCommittee]),
            (ForwardingResultToFinal, SelectedForFinalCommittee) => (FinalAwaitingAllCommitteeResults, vec![Action::None]),
            (ForwardingResultToFinal, NotSelectedForFinalCommittee) => (AwaitingFinalBlock, vec![Action::None]),
            (FinalAwaitingAllCommitteeResults, AllCommitteeResultsIn) => (FinalMerged, vec![Action::AssembleMergedBlock]),
            (FinalMerged, BecamePrimary) => (FinalSendingPrePrepare, vec![Action::RunFinalPbft, Action::SendPrePrepare]),
            (FinalMerged, _) => (FinalAwaitingPrePrepare, vec![Action::RunFinalPbft]),
            (FinalAwaitingPrePrepare, PrePrepareArrived) => (FinalAwaitingPrepareQuorum, vec![Action::SendPrepare]),
            (FinalSendingPrePrepare, _) => (FinalAwaitingPrepareQuorum, vec![Action::None]),
            (FinalAwaitingPrepareQuorum, PrepareQuorumReached) => (FinalPrepared, vec![Action::SendCommit]),
            (FinalPrepared, _) => (FinalSendingCommit, vec![Action::None]),
            (FinalSendingCommit, _) => (FinalAwaitingCommitQuorum, vec![Action::None]),
            (FinalAwaitingCommitQuorum, CommitQuorumReached) => (FinalCommitted, vec![Action::None]),
            (FinalCommitted, _) => (BroadcastingFinalBlock, vec![Action::BroadcastFinalBlock, Action::GenerateRandomnessSecret]),
            (BroadcastingFinalBlock, _) => (GeneratingRandomnessSecret, vec![Action::BroadcastCommitment]),
            (AwaitingFinalBlock, FinalBlockArrived) => (GeneratingRandomnessSecret, vec![Action::ValidateFinalBlock]),
            (GeneratingRandomnessSecret, _) => (BroadcastingCommitment, vec![Action::None]),
            (BroadcastingCommitment, _) => (AwaitingCommitmentQuorum, vec![Action::None]),
            (AwaitingCommitmentQuorum, CommitmentQuorumReached) => (RevealingRandomness, vec![Action::RevealRandomness]),
            (RevealingRandomness, _) => (AwaitingRevealQuorum, vec![Action::None]),
            (AwaitingRevealQuorum, RevealQuorumReached) => (EpochComplete, vec![Action::WriteLedgerEntry]),
            (EpochComplete, _) => (EpochComplete, vec![Action::None]),
            (_, TickBudgetExhausted) => (Stalled, vec![Action::None]),
            (s, _) => (s, vec![Action::None]),
        };
        next = new_state;
        actions.append(&mut action);
    }

    if actions.is_empty() {
        actions.push(Action::None);
    }
    (next, actions)
}
