use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};

use cairn_types::object_id::ObjectId;

use crate::crypto::keys::LocalKeys;
use crate::crypto::CryptoProvider;
use crate::error::{CairnError, Result};

/// Sealed-box layout: `ephemeral_pub(32) || nonce(12) || ciphertext+tag`.
const EPHEMERAL_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const HKDF_INFO: &[u8] = b"cairn:seal:v1";

/// Public-key sealed encryption over X25519 + HKDF-SHA256 + AES-256-GCM.
///
/// Sealing generates a fresh ephemeral keypair per payload, so output is
/// nondeterministic; opening needs the long-lived private key. The MAC key
/// for object IDs is carried here too so one provider serves the whole
/// engine.
pub struct SealedBoxProvider {
    mac_key: [u8; 32],
    public_key: PublicKey,
    secret_key: Option<StaticSecret>,
}

impl SealedBoxProvider {
    /// Build from unattended local key material (no private key).
    pub fn new(local: &LocalKeys) -> Result<Self> {
        let mac_key = local.mac_key_array()?;
        let public: [u8; 32] = local
            .public_key
            .as_deref()
            .ok_or_else(|| CairnError::Config("local keys carry no public key".into()))?
            .try_into()
            .map_err(|_| CairnError::CacheCorruption("stored public key has wrong length".into()))?;
        Ok(Self {
            mac_key,
            public_key: PublicKey::from(public),
            secret_key: None,
        })
    }

    /// Attach the unlocked private key, enabling `open`.
    pub fn with_secret(mut self, secret_key: StaticSecret) -> Self {
        self.secret_key = Some(secret_key);
        self
    }

    /// Derive the AEAD key for one sealed payload. The salt binds both
    /// public keys so a transplanted ephemeral half cannot decrypt.
    fn derive_aead_key(&self, ephemeral_pub: &PublicKey, shared: &[u8; 32]) -> Result<[u8; 32]> {
        let mut salt = Vec::with_capacity(64);
        salt.extend_from_slice(ephemeral_pub.as_bytes());
        salt.extend_from_slice(self.public_key.as_bytes());
        let hk = Hkdf::<Sha256>::new(Some(&salt), shared);
        let mut okm = [0u8; 32];
        hk.expand(HKDF_INFO, &mut okm)
            .map_err(|e| CairnError::KeyDerivation(format!("hkdf expand: {e}")))?;
        Ok(okm)
    }
}

impl CryptoProvider for SealedBoxProvider {
    fn object_id(&self, payload: &[u8]) -> ObjectId {
        ObjectId::compute(&self.mac_key, payload)
    }

    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let ephemeral_secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let ephemeral_pub = PublicKey::from(&ephemeral_secret);
        let shared = ephemeral_secret.diffie_hellman(&self.public_key);

        let aead_key = self.derive_aead_key(&ephemeral_pub, shared.as_bytes())?;
        let cipher = Aes256Gcm::new_from_slice(&aead_key)
            .map_err(|e| CairnError::KeyDerivation(format!("cipher init: {e}")))?;
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| CairnError::KeyDerivation(format!("seal: {e}")))?;

        let mut out = Vec::with_capacity(EPHEMERAL_LEN + NONCE_LEN + ciphertext.len());
        out.extend_from_slice(ephemeral_pub.as_bytes());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn open(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let secret = self.secret_key.as_ref().ok_or(CairnError::KeyLocked)?;
        if ciphertext.len() < EPHEMERAL_LEN + NONCE_LEN + TAG_LEN {
            return Err(CairnError::AuthFail);
        }
        let (eph_bytes, rest) = ciphertext.split_at(EPHEMERAL_LEN);
        let (nonce_bytes, body) = rest.split_at(NONCE_LEN);

        let eph_arr: [u8; 32] = eph_bytes.try_into().expect("split length");
        let ephemeral_pub = PublicKey::from(eph_arr);
        let shared = secret.diffie_hellman(&ephemeral_pub);

        let aead_key = self.derive_aead_key(&ephemeral_pub, shared.as_bytes())?;
        let cipher = Aes256Gcm::new_from_slice(&aead_key).map_err(|_| CairnError::AuthFail)?;
        let nonce = Nonce::from_slice(nonce_bytes);
        cipher.decrypt(nonce, body).map_err(|_| CairnError::AuthFail)
    }

    fn can_open(&self) -> bool {
        self.secret_key.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_provider() -> SealedBoxProvider {
        let secret = StaticSecret::from([7u8; 32]);
        let public = PublicKey::from(&secret);
        let local = LocalKeys {
            mac_key: vec![0xAA; 32],
            public_key: Some(public.as_bytes().to_vec()),
        };
        SealedBoxProvider::new(&local).unwrap().with_secret(secret)
    }

    #[test]
    fn seal_open_roundtrip() {
        let provider = test_provider();
        let plaintext = b"the quick brown fox";
        let sealed = provider.seal(plaintext).unwrap();
        assert_eq!(provider.open(&sealed).unwrap(), plaintext);
    }

    #[test]
    fn seal_is_nondeterministic() {
        let provider = test_provider();
        let a = provider.seal(b"same input").unwrap();
        let b = provider.seal(b"same input").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn open_without_secret_is_locked() {
        let provider = test_provider();
        let sealed = provider.seal(b"payload").unwrap();

        let secret = StaticSecret::from([7u8; 32]);
        let public = PublicKey::from(&secret);
        let locked = SealedBoxProvider::new(&LocalKeys {
            mac_key: vec![0xAA; 32],
            public_key: Some(public.as_bytes().to_vec()),
        })
        .unwrap();
        assert!(!locked.can_open());
        assert!(matches!(locked.open(&sealed), Err(CairnError::KeyLocked)));
    }

    #[test]
    fn tampered_ciphertext_fails_auth() {
        let provider = test_provider();
        let mut sealed = provider.seal(b"payload").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(matches!(provider.open(&sealed), Err(CairnError::AuthFail)));
    }

    #[test]
    fn truncated_ciphertext_fails_auth() {
        let provider = test_provider();
        assert!(matches!(
            provider.open(&[0u8; 40]),
            Err(CairnError::AuthFail)
        ));
    }

    #[test]
    fn wrong_recipient_fails_auth() {
        let provider = test_provider();
        let sealed = provider.seal(b"payload").unwrap();

        let other_secret = StaticSecret::from([9u8; 32]);
        let other_public = PublicKey::from(&other_secret);
        let other = SealedBoxProvider::new(&LocalKeys {
            mac_key: vec![0xAA; 32],
            public_key: Some(other_public.as_bytes().to_vec()),
        })
        .unwrap()
        .with_secret(other_secret);
        assert!(matches!(other.open(&sealed), Err(CairnError::AuthFail)));
    }

    #[test]
    fn object_id_uses_mac_key() {
        let provider = test_provider();
        let id = provider.object_id(b"payload");
        assert_eq!(id, ObjectId::compute(&[0xAA; 32], b"payload"));
    }
}
