//! Hashing, asymmetric keypairs, and randomness primitives shared by every
//! other module. Kept deliberately small: the core depends on SHA-256 and
//! Ed25519 only, the way `bleep-consensus` leans on `sha2` directly rather
//! than re-deriving digests through a generic trait.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::RngCore;
use sha2::{Digest, Sha256};

/// SHA-256 digest of arbitrary bytes, returned as lowercase hex.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// SHA-256 digest of arbitrary bytes, returned raw.
pub fn sha256_bytes(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// Number of leading hex-zero digits in a hex string.
pub fn leading_hex_zeros(hex_digest: &str) -> usize {
    hex_digest.chars().take_while(|c| *c == '0').count()
}

/// A per-epoch asymmetric keypair. Identities are not persisted across
/// epochs: a fresh keypair is generated every reset.
#[derive(Debug)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    /// Generate a fresh keypair from the OS RNG.
    pub fn generate() -> Self {
        Self::generate_with(&mut rand::rngs::OsRng)
    }

    /// Same as [`generate`](Self::generate), but drawing from a caller-supplied
    /// RNG. Lets a driver seed one RNG per run for reproducible replays.
    pub fn generate_with(rng: &mut impl RngCore) -> Self {
        let mut seed = [0u8; 32];
        rng.fill_bytes(&mut seed);
        Keypair {
            signing_key: SigningKey::from_bytes(&seed),
        }
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.signing_key.verifying_key().to_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }
}

/// A public key, stored by its canonical byte encoding so that `Identity`
/// equality is structural rather than comparing by reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct PublicKey(pub [u8; 32]);

impl PublicKey {
    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        match VerifyingKey::from_bytes(&self.0) {
            Ok(vk) => vk.verify(message, signature).is_ok(),
            Err(_) => false,
        }
    }
}

/// Draw a cryptographically strong random integer in `[0, 2^bits)`,
/// formatted as a zero-padded binary string of exactly `bits` characters.
pub fn random_bitstring(bits: u32) -> String {
    random_bitstring_with(&mut rand::rngs::OsRng, bits)
}

/// Same as [`random_bitstring`], but drawing from a caller-supplied RNG.
pub fn random_bitstring_with(rng: &mut impl RngCore, bits: u32) -> String {
    assert!(bits <= 64, "bitstring width beyond u64 is not supported");
    let mut buf = [0u8; 8];
    rng.fill_bytes(&mut buf);
    let raw = u64::from_le_bytes(buf);
    let mask: u64 = if bits == 64 { u64::MAX } else { (1u64 << bits) - 1 };
    format!("{:0width$b}", raw & mask, width = bits as usize)
}

/// Parse a binary string (as produced by [`random_bitstring`]) back to an
/// integer.
pub fn bitstring_to_u64(s: &str) -> Option<u64> {
    u64::from_str_radix(s, 2).ok()
}

/// XOR a set of equal-length bitstrings, returning a bitstring of the same
/// width. Used to derive the next epoch's randomness.
pub fn xor_bitstrings(bits: u32, values: &[String]) -> String {
    let xored = values
        .iter()
        .filter_map(|v| bitstring_to_u64(v))
        .fold(0u64, |acc, v| acc ^ v);
    format!("{:0width$b}", xored, width = bits as usize)
}
