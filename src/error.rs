//! Error kinds for the simulator core: one variant per failure mode, each
//! carrying enough context to log meaningfully, with a hand-written
//! `Display` (via `thiserror`) rather than a bare string.

use thiserror::Error;

/// Errors produced while validating or running a single participant.
///
/// Most of these are *recovered locally* by the caller (the offending
/// message is dropped and counted) rather than bubbled up as a hard
/// failure. `PoWAborted`, `BusUnavailable`, and `StalledEpoch` are the
/// exceptions that can reach the driver.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ElasticoError {
    #[error("PoW computation aborted for participant on port {port}")]
    PoWAborted { port: u16 },

    #[error("PoW verification failed for identity on port {port}: {reason}")]
    InvalidPoW { port: u16, reason: String },

    #[error("signature mismatch from sender on port {sender_port}")]
    SignatureMismatch { sender_port: u16 },

    #[error("message from unknown sender on port {sender_port}")]
    UnknownSender { sender_port: u16 },

    #[error("committee {committee_id} is full, rejecting registrant on port {port}")]
    CommitteeFull { committee_id: u64, port: u16 },

    #[error("equivocating pre-prepare for (view={view}, seq={seq}) from primary on port {primary_port}")]
    Equivocation { view: u64, seq: u64, primary_port: u16 },

    #[error("quorum not reached: {have} of {need} required in view={view} seq={seq}")]
    QuorumFailed { view: u64, seq: u64, have: usize, need: usize },

    #[error("message bus unavailable after {attempts} attempts publishing to address {address}")]
    BusUnavailable { address: u16, attempts: u32 },

    #[error("epoch {epoch} stalled after {ticks} ticks in state {state}")]
    StalledEpoch { epoch: u64, ticks: u64, state: String },

    #[error("key generation failed for participant: {reason}")]
    KeyGenerationFailed { reason: String },
}

pub type Result<T> = std::result::Result<T, ElasticoError>;
