//! Identity and PoW witness. `Identity` is the immutable record published
//! to rosters; `PowWitness` is the proof a participant attaches to it.
//! Equality is field-wise, with the public key compared by its canonical
//! byte encoding rather than by reference.

use std::collections::HashSet;

use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::crypto::{self, PublicKey};

/// Simulated IPv4 address: 4 random bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SimulatedIp(pub [u8; 4]);

impl SimulatedIp {
    pub fn random() -> Self {
        Self::random_with(&mut rand::rngs::OsRng)
    }

    /// Same as [`random`](Self::random), but drawing from a caller-supplied
    /// RNG. Lets a driver seed one RNG per run for reproducible replays.
    pub fn random_with(rng: &mut impl RngCore) -> Self {
        let mut bytes = [0u8; 4];
        rng.fill_bytes(&mut bytes);
        SimulatedIp(bytes)
    }

    /// Dotted-decimal bytes, the exact representation hashed into the PoW
    /// digest.
    pub fn to_ascii(self) -> Vec<u8> {
        format!("{}.{}.{}.{}", self.0[0], self.0[1], self.0[2], self.0[3]).into_bytes()
    }
}

/// PoW witness: {hash, set_of_Rs, nonce}.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PowWitness {
    /// 64-hex-char SHA-256 digest with `D` leading hex zeros.
    pub hash: String,
    /// The `c/2+1` randomness shares drawn from the previous epoch; empty
    /// in epoch 0.
    pub set_of_rs: Vec<String>,
    /// Nonce that produced `hash`.
    pub nonce: u64,
}

/// Immutable per-epoch identity. Published once a participant forms it;
/// never mutated afterward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub ip: SimulatedIp,
    pub public_key: PublicKey,
    pub committee_id: u64,
    pub pow: PowWitness,
    pub epoch_randomness: String,
    pub port: u16,
}

impl Identity {
    /// Canonical bytes this identity's PoW digest was computed over, used
    /// both to mine and to re-verify the PoW.
    pub fn pow_preimage(ip: SimulatedIp, public_key: &PublicKey, epoch_randomness: &str, nonce: u64) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&ip.to_ascii());
        buf.extend_from_slice(&public_key.0);
        buf.extend_from_slice(epoch_randomness.as_bytes());
        buf.extend_from_slice(nonce.to_string().as_bytes());
        buf
    }
}

/// `verify_pow(identity)`: true iff the hash is well-formed, meets the
/// difficulty, recomputes to the claimed hash, every `Ri` in `set_of_Rs` has
/// a digest present in `r_commitment_set`, and `epoch_randomness` equals the
/// XOR of `set_of_Rs` (the epoch-0 convention is the empty set XORs to
/// all-zero bits). The randomness is always *recomputed*, never trusted as
/// claimed.
pub fn verify_pow(identity: &Identity, difficulty: usize, r_bits: u32, r_commitment_set: &HashSet<[u8; 32]>) -> bool {
    if identity.pow.hash.len() != 64 {
        return false;
    }
    if crypto::leading_hex_zeros(&identity.pow.hash) < difficulty {
        return false;
    }
    for ri in &identity.pow.set_of_rs {
        let digest = crypto::sha256_bytes(ri.as_bytes());
        if !r_commitment_set.contains(&digest) {
            return false;
        }
    }
    let expected_randomness = if identity.pow.set_of_rs.is_empty() {
        "0".repeat(r_bits as usize)
    } else {
        crypto::xor_bitstrings(r_bits, &identity.pow.set_of_rs)
    };
    if identity.epoch_randomness != expected_randomness {
        return false;
    }
    let preimage = Identity::pow_preimage(identity.ip, &identity.public_key, &identity.epoch_randomness, identity.pow.nonce);
    crypto::sha256_hex(&preimage) == identity.pow.hash
}

/// Low-`s`-bit committee id extraction: each hex nibble expands to 4 bits
/// before the low `s` bits are read off. Deterministic and
/// machine-independent.
pub fn committee_id_from_hash(hash_hex: &str, s: u32) -> u64 {
    if s == 0 {
        return 0;
    }
    let mut bindigest = String::with_capacity(hash_hex.len() * 4);
    for c in hash_hex.chars() {
        let nibble = c.to_digit(16).expect("PoW hash must be valid hex");
        bindigest.push_str(&format!("{:04b}", nibble));
    }
    let low_bits = &bindigest[bindigest.len() - s as usize..];
    u64::from_str_radix(low_bits, 2).expect("binary string must parse")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Keypair;

    #[test]
    fn committee_id_is_reproducible() {
        let hash = "0000ab34".to_string() + &"0".repeat(56);
        let id1 = committee_id_from_hash(&hash, 2);
        let id2 = committee_id_from_hash(&hash, 2);
        assert_eq!(id1, id2);
    }

    #[test]
    fn committee_id_uses_low_s_bits() {
        // last hex nibble is 'b' = 1011; low 2 bits = 11 = 3
        let hash = format!("{}b", "0".repeat(63));
        assert_eq!(committee_id_from_hash(&hash, 2), 0b11);
        // low 1 bit = 1
        assert_eq!(committee_id_from_hash(&hash, 1), 1);
    }

    #[test]
    fn identity_equality_is_field_wise() {
        let kp = Keypair::generate();
        let base = Identity {
            ip: SimulatedIp([1, 2, 3, 4]),
            public_key: kp.public_key(),
            committee_id: 0,
            pow: PowWitness {
                hash: "0".repeat(64),
                set_of_rs: vec![],
                nonce: 0,
            },
            epoch_randomness: "0000".to_string(),
            port: 49153,
        };
        let mut other = base.clone();
        assert_eq!(base, other);
        other.port = 49154;
        assert_ne!(base, other);
    }

    #[test]
    fn simulated_ip_ascii_is_dotted_decimal() {
        let ip = SimulatedIp([10, 0, 0, 1]);
        assert_eq!(ip.to_ascii(), b"10.0.0.1");
    }

    fn mined_identity(difficulty: usize, set_of_rs: Vec<String>, epoch_randomness: String) -> Identity {
        let kp = Keypair::generate();
        let ip = SimulatedIp([7, 7, 7, 7]);
        let token = crate::pow::CancellationToken::new();
        let witness = crate::pow::compute_pow(ip, &kp.public_key(), &epoch_randomness, difficulty, set_of_rs, 0, 1, &token).unwrap();
        let committee_id = committee_id_from_hash(&witness.hash, 1);
        Identity {
            ip,
            public_key: kp.public_key(),
            committee_id,
            pow: witness,
            epoch_randomness,
            port: 1,
        }
    }

    #[test]
    fn verify_pow_accepts_genuine_epoch_zero_identity() {
        let identity = mined_identity(1, vec![], "0000".to_string());
        let commitments = HashSet::new();
        assert!(verify_pow(&identity, 1, 4, &commitments));
    }

    #[test]
    fn verify_pow_rejects_tampered_hash() {
        let mut identity = mined_identity(1, vec![], "0000".to_string());
        identity.pow.hash = "f".repeat(64);
        let commitments = HashSet::new();
        assert!(!verify_pow(&identity, 1, 4, &commitments));
    }

    #[test]
    fn verify_pow_recomputes_randomness_rather_than_trusting_claim() {
        let mut identity = mined_identity(1, vec![], "0000".to_string());
        // claim a different randomness than what set_of_Rs (empty) implies
        identity.epoch_randomness = "1111".to_string();
        let commitments = HashSet::new();
        assert!(!verify_pow(&identity, 1, 4, &commitments));
    }

    #[test]
    fn verify_pow_checks_r_commitments_are_known() {
        let expected_randomness = crypto::xor_bitstrings(4, &["1010".to_string()]);
        let identity = mined_identity(1, vec!["1010".to_string()], expected_randomness);
        // Ri digest not in the commitment set: rejected
        let empty = HashSet::new();
        assert!(!verify_pow(&identity, 1, 4, &empty));
        // Ri digest known: accepted
        let mut known = HashSet::new();
        known.insert(crypto::sha256_bytes(b"1010"));
        assert!(verify_pow(&identity, 1, 4, &known));
    }
}
