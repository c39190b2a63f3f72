//! Message bus adapter. The core depends only on the `MessageBus` trait;
//! `InMemoryBus` is test scaffolding, not a production transport — a
//! deployment is expected to supply its own adapter over whatever real
//! transport it has.
//!
//! Contract: per (sender -> receiver) pair, FIFO; across senders, arbitrary
//! order. `InMemoryBus` satisfies this by queuing per destination address
//! and never reordering within a single `publish` call sequence from the
//! same caller.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use ed25519_dalek::Signature;
use serde::{Deserialize, Serialize};

use crate::identity::Identity;

/// Envelope type tags. The `final_committee` flag on the PBFT variants
/// shares the same wire shape between the intra-committee and final-committee
/// rounds; the receiver uses it to route the vote into the right PBFT log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    NewIdentity,
    CommitteeRoster,
    TxnShard,
    PrePrepare { final_committee: bool },
    Prepare { final_committee: bool },
    Commit { final_committee: bool },
    IntraResultToFinal,
    Commitment,
    FinalBlock,
    RCommitment,
    RiOpen,
}

/// Opaque envelope carried over the bus. `payload` is the bincode-serialized
/// message body; deserializing it is the receiver's job, keyed by `kind`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub kind: MessageKind,
    pub payload: Vec<u8>,
    pub sender: Identity,
    #[serde(with = "signature_bytes")]
    pub signature: Signature,
}

impl Envelope {
    pub fn new(kind: MessageKind, payload: Vec<u8>, sender: Identity, signature: Signature) -> Self {
        Envelope {
            kind,
            payload,
            sender,
            signature,
        }
    }

    /// Verify the envelope's signature covers its payload and was produced
    /// by the claimed sender's public key.
    pub fn verify_signature(&self) -> bool {
        self.sender.public_key.verify(&self.payload, &self.signature)
    }
}

mod signature_bytes {
    use ed25519_dalek::Signature;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(sig: &Signature, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_bytes(&sig.to_bytes())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Signature, D::Error> {
        let bytes: Vec<u8> = Deserialize::deserialize(d)?;
        let arr: [u8; 64] = bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("signature must be 64 bytes"))?;
        Ok(Signature::from_bytes(&arr))
    }
}

/// Abstract publish/consume bus. Addresses are integer ports.
pub trait MessageBus: Send + Sync {
    /// Publish an envelope to `address`. May fail with `BusUnavailable`-style
    /// errors at the caller's discretion; `InMemoryBus` never fails.
    fn publish(&self, address: u16, envelope: Envelope);

    /// Drain every envelope currently queued for `address`, in arrival
    /// order. Non-blocking: returns an empty vec if nothing is queued.
    fn drain(&self, address: u16) -> Vec<Envelope>;
}

/// Reliable, per-address FIFO, channel-free in-memory bus used by this
/// crate's own tests.
#[derive(Default)]
pub struct InMemoryBus {
    queues: Mutex<HashMap<u16, VecDeque<Envelope>>>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        InMemoryBus::default()
    }
}

impl MessageBus for InMemoryBus {
    fn publish(&self, address: u16, envelope: Envelope) {
        let mut queues = self.queues.lock().expect("bus mutex poisoned");
        queues.entry(address).or_default().push_back(envelope);
    }

    fn drain(&self, address: u16) -> Vec<Envelope> {
        let mut queues = self.queues.lock().expect("bus mutex poisoned");
        queues
            .get_mut(&address)
            .map(|q| q.drain(..).collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Keypair;
    use crate::identity::{PowWitness, SimulatedIp};

    fn dummy_identity(port: u16, kp: &Keypair) -> Identity {
        Identity {
            ip: SimulatedIp([0, 0, 0, 1]),
            public_key: kp.public_key(),
            committee_id: 0,
            pow: PowWitness {
                hash: "0".repeat(64),
                set_of_rs: vec![],
                nonce: 0,
            },
            epoch_randomness: "0000".to_string(),
            port,
        }
    }

    #[test]
    fn publish_then_drain_is_fifo_per_address() {
        let bus = InMemoryBus::new();
        let kp = Keypair::generate();
        let sender = dummy_identity(1, &kp);
        for i in 0..3u8 {
            let payload = vec![i];
            let sig = kp.sign(&payload);
            bus.publish(100, Envelope::new(MessageKind::NewIdentity, payload, sender.clone(), sig));
        }
        let drained = bus.drain(100);
        assert_eq!(drained.len(), 3);
        assert_eq!(drained[0].payload, vec![0]);
        assert_eq!(drained[2].payload, vec![2]);
        assert!(bus.drain(100).is_empty());
    }

    #[test]
    fn envelope_signature_verification_rejects_tampering() {
        let kp = Keypair::generate();
        let sender = dummy_identity(1, &kp);
        let payload = vec![1, 2, 3];
        let sig = kp.sign(&payload);
        let mut envelope = Envelope::new(MessageKind::NewIdentity, payload, sender, sig);
        assert!(envelope.verify_signature());
        envelope.payload = vec![9, 9, 9];
        assert!(!envelope.verify_signature());
    }
}
