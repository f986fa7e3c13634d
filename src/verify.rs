//! Signature verification as an injectable capability.
//!
//! BIP-340 Schnorr verification is treated as an external collaborator
//! rather than core logic: `LocalStore::save` depends on a `Verifier` trait
//! object, not on any particular crypto crate, so callers can substitute a
//! faster or hardware-backed verifier, and tests can substitute a fake.

use k256::schnorr::signature::Verifier as _;
use k256::schnorr::{Signature, VerifyingKey};
use nostr::{EventId, PublicKey};

/// Verifies that a signature over an event id was produced by the holder
/// of the given public key.
pub trait Verifier: Send + Sync {
    fn verify(&self, pubkey: &PublicKey, id: &EventId, sig: &str) -> bool;
}

/// Default implementation: BIP-340 Schnorr over secp256k1, matching the
/// Nostr event-signing contract.
#[derive(Debug, Default, Clone, Copy)]
pub struct Secp256k1Verifier;

impl Verifier for Secp256k1Verifier {
    fn verify(&self, pubkey: &PublicKey, id: &EventId, sig: &str) -> bool {
        let verifying_key = match VerifyingKey::from_bytes(&pubkey.to_bytes()) {
            Ok(k) => k,
            Err(_) => return false,
        };

        let sig_bytes = match hex::decode(sig) {
            Ok(b) => b,
            Err(_) => return false,
        };

        let signature = match Signature::try_from(sig_bytes.as_slice()) {
            Ok(s) => s,
            Err(_) => return false,
        };

        verifying_key.verify(&id.to_bytes(), &signature).is_ok()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Accepts every event; used to isolate store tests from crypto.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct AlwaysValid;

    impl Verifier for AlwaysValid {
        fn verify(&self, _pubkey: &PublicKey, _id: &EventId, _sig: &str) -> bool {
            true
        }
    }

    /// Rejects every event whose id is in the given deny-list, otherwise
    /// accepts. Used to exercise the "drop the bad one, keep the rest of
    /// the batch" path without needing a real signature on the good event.
    #[derive(Debug, Default, Clone)]
    pub struct DenyIds(pub std::collections::HashSet<EventId>);

    impl Verifier for DenyIds {
        fn verify(&self, _pubkey: &PublicKey, id: &EventId, _sig: &str) -> bool {
            !self.0.contains(id)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::AlwaysValid;
    use super::*;

    #[test]
    fn always_valid_accepts_anything() {
        let v = AlwaysValid;
        let pubkey = PublicKey::from_hex("a".repeat(64)).unwrap();
        let id = EventId::from_hex("b".repeat(64)).unwrap();
        assert!(v.verify(&pubkey, &id, "not-a-real-signature"));
    }

    #[test]
    fn secp256k1_verifier_rejects_garbage() {
        let v = Secp256k1Verifier;
        let pubkey = PublicKey::from_hex("a".repeat(64)).unwrap();
        let id = EventId::from_hex("b".repeat(64)).unwrap();
        assert!(!v.verify(&pubkey, &id, "00"));
    }
}
