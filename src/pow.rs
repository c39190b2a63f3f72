//! PoW engine, shaped like a typical `compute_pow`/`verify_pow` pair but
//! generalized to an identity-binding puzzle: the digest binds IP, public
//! key, and epoch randomness, not just block data.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{info, warn};
use rand::Rng;

use crate::crypto::{leading_hex_zeros, random_bitstring, sha256_hex};
use crate::error::ElasticoError;
use crate::identity::{Identity, PowWitness, SimulatedIp};

/// Yield-and-check granularity: the loop must check the cancellation token
/// at least this often to stay responsive to an epoch-level abort.
const CANCEL_CHECK_INTERVAL: u64 = 1024;

/// Cooperative cancellation token for a running PoW computation. Cloning
/// shares the same underlying flag.
#[derive(Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        CancellationToken(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Iterate nonces until a digest with `difficulty` leading hex zeros is
/// found. Deterministic given `(ip, public_key_bytes, epoch_randomness,
/// starting nonce)`; interruptible via `token`.
pub fn compute_pow(
    ip: SimulatedIp,
    public_key: &crate::crypto::PublicKey,
    epoch_randomness: &str,
    difficulty: usize,
    set_of_rs: Vec<String>,
    starting_nonce: u64,
    port: u16,
    token: &CancellationToken,
) -> Result<PowWitness, ElasticoError> {
    let mut nonce = starting_nonce;
    loop {
        for _ in 0..CANCEL_CHECK_INTERVAL {
            if token.is_cancelled() {
                warn!("PoW aborted for port {port} at nonce {nonce}");
                return Err(ElasticoError::PoWAborted { port });
            }
            let preimage = Identity::pow_preimage(ip, public_key, epoch_randomness, nonce);
            let digest = sha256_hex(&preimage);
            if leading_hex_zeros(&digest) >= difficulty {
                info!("PoW found for port {port}: nonce={nonce} hash={digest}");
                return Ok(PowWitness {
                    hash: digest,
                    set_of_rs,
                    nonce,
                });
            }
            nonce += 1;
        }
    }
}

/// One of three Byzantine PoW strategies a faulty participant picks from
/// uniformly at random, none of which produce a witness that passes
/// `verify_pow`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakePowStrategy {
    /// (a) Random hash with `D` leading zeros, unrelated to real inputs.
    UnrelatedHash,
    /// (b) Digest computed over the nonce only.
    NonceOnlyDigest,
    /// (c) Random hash that does not satisfy the difficulty.
    BelowDifficulty,
}

impl FakePowStrategy {
    pub fn choose_uniform() -> Self {
        match rand::thread_rng().gen_range(0..3) {
            0 => FakePowStrategy::UnrelatedHash,
            1 => FakePowStrategy::NonceOnlyDigest,
            _ => FakePowStrategy::BelowDifficulty,
        }
    }
}

/// Bound on nonce attempts for strategy (b), so a faulty node that can't
/// find a qualifying nonce-only hash emits `PoWAborted` instead of hanging.
const FAKE_POW_NONCE_BOUND: u64 = 1 << 20;

/// Byzantine PoW: produces a witness that will usually fail `verify_pow`,
/// used only when `faulty = true`.
pub fn compute_fake_pow(difficulty: usize, port: u16, token: &CancellationToken) -> Result<PowWitness, ElasticoError> {
    match FakePowStrategy::choose_uniform() {
        FakePowStrategy::UnrelatedHash => {
            let zeros = "0".repeat(difficulty);
            let suffix_len = 64usize.saturating_sub(difficulty);
            let suffix = sha256_hex(format!("unrelated-{port}-{}", random_bitstring(32)).as_bytes());
            let hash = format!("{zeros}{}", &suffix[..suffix_len]);
            warn!("faulty port {port} computed fake PoW (unrelated hash)");
            Ok(PowWitness {
                hash,
                set_of_rs: vec![],
                nonce: 0,
            })
        }
        FakePowStrategy::NonceOnlyDigest => {
            let zero_string = "0".repeat(difficulty);
            for nonce in 0..FAKE_POW_NONCE_BOUND {
                if token.is_cancelled() {
                    return Err(ElasticoError::PoWAborted { port });
                }
                let digest = sha256_hex(nonce.to_string().as_bytes());
                if digest.starts_with(&zero_string) {
                    warn!("faulty port {port} computed fake PoW (nonce-only digest)");
                    return Ok(PowWitness {
                        hash: digest,
                        set_of_rs: vec![],
                        nonce,
                    });
                }
            }
            Err(ElasticoError::PoWAborted { port })
        }
        FakePowStrategy::BelowDifficulty => {
            let hash = sha256_hex(random_bitstring(32).as_bytes());
            warn!("faulty port {port} computed fake PoW (below-difficulty hash)");
            Ok(PowWitness {
                hash,
                set_of_rs: vec![],
                nonce: 0,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Keypair;

    #[test]
    fn compute_pow_finds_matching_difficulty() {
        let kp = Keypair::generate();
        let ip = SimulatedIp([1, 1, 1, 1]);
        let token = CancellationToken::new();
        let witness = compute_pow(ip, &kp.public_key(), "0000", 1, vec![], 0, 49153, &token).unwrap();
        assert!(leading_hex_zeros(&witness.hash) >= 1);
        assert_eq!(witness.hash.len(), 64);
    }

    #[test]
    fn compute_pow_is_deterministic_given_fixed_inputs() {
        let kp = Keypair::generate();
        let ip = SimulatedIp([2, 2, 2, 2]);
        let token = CancellationToken::new();
        let w1 = compute_pow(ip, &kp.public_key(), "0101", 1, vec![], 0, 1, &token).unwrap();
        let w2 = compute_pow(ip, &kp.public_key(), "0101", 1, vec![], 0, 1, &token).unwrap();
        assert_eq!(w1, w2);
    }

    #[test]
    fn cancellation_aborts_pow_with_error() {
        let kp = Keypair::generate();
        let ip = SimulatedIp([3, 3, 3, 3]);
        let token = CancellationToken::new();
        token.cancel();
        let result = compute_pow(ip, &kp.public_key(), "0000", 64, vec![], 0, 1, &token);
        assert_eq!(result, Err(ElasticoError::PoWAborted { port: 1 }));
    }

    #[test]
    fn fake_pow_strategies_never_hang() {
        let token = CancellationToken::new();
        for _ in 0..20 {
            let _ = compute_fake_pow(6, 1, &token);
        }
    }
}
