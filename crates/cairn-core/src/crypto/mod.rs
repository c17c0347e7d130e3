pub mod keys;
pub mod sealed;

use cairn_types::object_id::ObjectId;

use crate::error::Result;

/// Trait for the repository's cryptographic operations.
///
/// `object_id` is a deterministic keyed MAC over plaintext payloads and
/// needs only the MAC key. `seal` is nondeterministic public-key encryption
/// and needs only the public key, so backup and prune can run unattended.
/// `open` needs the passphrase-unlocked private key.
pub trait CryptoProvider: Send + Sync {
    /// Compute the content address of a plaintext payload.
    fn object_id(&self, payload: &[u8]) -> ObjectId;

    /// Encrypt a payload for the repository. Self-authenticating; decrypting
    /// with `open` fails on any tampering.
    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>>;

    /// Decrypt data produced by `seal`. Fails with `AuthFail` when the
    /// integrity check fails and `KeyLocked` when the private key is absent.
    fn open(&self, ciphertext: &[u8]) -> Result<Vec<u8>>;

    /// Whether `open` can succeed (the private key is available).
    fn can_open(&self) -> bool;
}

/// No-encryption provider for trusted repositories and tests. Object IDs
/// are still keyed MACs, so deduplication behaves identically.
pub struct PlaintextProvider {
    mac_key: [u8; 32],
}

impl PlaintextProvider {
    pub fn new(mac_key: &[u8; 32]) -> Self {
        Self { mac_key: *mac_key }
    }
}

impl CryptoProvider for PlaintextProvider {
    fn object_id(&self, payload: &[u8]) -> ObjectId {
        ObjectId::compute(&self.mac_key, payload)
    }

    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        Ok(plaintext.to_vec())
    }

    fn open(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        Ok(ciphertext.to_vec())
    }

    fn can_open(&self) -> bool {
        true
    }
}
