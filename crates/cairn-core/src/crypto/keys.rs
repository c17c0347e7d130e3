use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use argon2::Argon2;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::{CairnError, Result};

/// Key material available without the passphrase: enough to scan, back up,
/// and prune, but not to read anything back. Persisted in the local cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalKeys {
    /// Distinct keyed-MAC key for object IDs. Never the public key.
    pub mac_key: Vec<u8>,
    /// X25519 public key for sealing, absent in plaintext mode.
    pub public_key: Option<Vec<u8>>,
}

/// Secret material wrapped inside the encrypted key blob.
/// Zeroized on drop so key bytes do not linger in memory.
#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct SecretBundle {
    mac_key: Vec<u8>,
    secret_key: Vec<u8>,
}

/// KDF parameters stored alongside the encrypted key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KdfParams {
    pub algorithm: String,
    pub time_cost: u32,
    pub memory_cost: u32,
    pub parallelism: u32,
    pub salt: Vec<u8>,
}

/// On-repository format stored at `meta/keys`. Everything needed to recover
/// full access from the passphrase alone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyFile {
    pub kdf: KdfParams,
    pub nonce: Vec<u8>,
    pub encrypted_bundle: Vec<u8>,
    pub public_key: Vec<u8>,
}

/// The full key triple after unlocking.
pub struct UnlockedKeys {
    pub mac_key: [u8; 32],
    pub secret_key: StaticSecret,
}

// Acceptable KDF parameter ranges. `meta/keys` comes from the repository,
// so a tampered blob must not be able to pin gigabytes of memory or
// minutes of CPU before the auth tag is ever checked. The upper ends sit
// a factor of a few above what `generate` writes.
const TIME_COST_RANGE: std::ops::RangeInclusive<u32> = 1..=8;
const PARALLELISM_RANGE: std::ops::RangeInclusive<u32> = 1..=8;
const MEMORY_KIB_RANGE: std::ops::RangeInclusive<u32> = 8 * 1024..=256 * 1024;
const SALT_LEN_RANGE: std::ops::RangeInclusive<usize> = 16..=128;

fn validate_kdf_params(kdf: &KdfParams) -> Result<()> {
    let acceptable = kdf.algorithm == "argon2id"
        && TIME_COST_RANGE.contains(&kdf.time_cost)
        && PARALLELISM_RANGE.contains(&kdf.parallelism)
        && MEMORY_KIB_RANGE.contains(&kdf.memory_cost)
        && SALT_LEN_RANGE.contains(&kdf.salt.len());
    if acceptable {
        Ok(())
    } else {
        Err(CairnError::AuthFail)
    }
}

impl KeyFile {
    /// Generate fresh key material and wrap the secret half with the
    /// passphrase using Argon2id + AES-256-GCM.
    pub fn generate(passphrase: &str) -> Result<(KeyFile, LocalKeys)> {
        let mut mac_key = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut mac_key);
        let secret_key = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let public_key = PublicKey::from(&secret_key);

        let mut salt = vec![0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut salt);
        let kdf = KdfParams {
            algorithm: "argon2id".to_string(),
            time_cost: 2,
            memory_cost: 128 * 1024,
            parallelism: 2,
            salt,
        };
        let wrapping_key = stretch_passphrase(passphrase, &kdf)?;

        let bundle = SecretBundle {
            mac_key: mac_key.to_vec(),
            secret_key: secret_key.to_bytes().to_vec(),
        };
        let plaintext = Zeroizing::new(rmp_serde::to_vec(&bundle)?);

        // Bind KDF params as AAD to prevent parameter substitution on the blob.
        let aad = kdf_params_aad(&kdf);
        let cipher = Aes256Gcm::new_from_slice(wrapping_key.as_ref())
            .map_err(|e| CairnError::KeyDerivation(format!("cipher init: {e}")))?;
        let mut nonce_bytes = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = cipher
            .encrypt(
                nonce,
                Payload {
                    msg: plaintext.as_ref(),
                    aad: &aad,
                },
            )
            .map_err(|e| CairnError::KeyDerivation(format!("encrypt: {e}")))?;

        let key_file = KeyFile {
            kdf,
            nonce: nonce_bytes.to_vec(),
            encrypted_bundle: ciphertext,
            public_key: public_key.as_bytes().to_vec(),
        };
        let local = LocalKeys {
            mac_key: mac_key.to_vec(),
            public_key: Some(public_key.as_bytes().to_vec()),
        };
        mac_key.zeroize();
        Ok((key_file, local))
    }

    /// Decrypt the secret bundle with the passphrase.
    pub fn unlock(&self, passphrase: &str) -> Result<UnlockedKeys> {
        if self.nonce.len() != 12 {
            return Err(CairnError::AuthFail);
        }
        validate_kdf_params(&self.kdf)?;

        let wrapping_key = stretch_passphrase(passphrase, &self.kdf)?;
        let cipher =
            Aes256Gcm::new_from_slice(wrapping_key.as_ref()).map_err(|_| CairnError::AuthFail)?;
        let nonce = Nonce::from_slice(&self.nonce);
        let aad = kdf_params_aad(&self.kdf);
        let plaintext = cipher
            .decrypt(
                nonce,
                Payload {
                    msg: self.encrypted_bundle.as_ref(),
                    aad: &aad,
                },
            )
            .map_err(|_| CairnError::AuthFail)?;
        let plaintext = Zeroizing::new(plaintext);

        let bundle: SecretBundle =
            rmp_serde::from_slice(&plaintext).map_err(|_| CairnError::AuthFail)?;
        if bundle.mac_key.len() != 32 || bundle.secret_key.len() != 32 {
            return Err(CairnError::AuthFail);
        }
        let mut mac_key = [0u8; 32];
        mac_key.copy_from_slice(&bundle.mac_key);
        let mut secret_bytes = [0u8; 32];
        secret_bytes.copy_from_slice(&bundle.secret_key);
        let secret_key = StaticSecret::from(secret_bytes);
        secret_bytes.zeroize();

        Ok(UnlockedKeys {
            mac_key,
            secret_key,
        })
    }

    /// The local (unattended) view of this key file, used when attaching a
    /// fresh machine to an existing repository.
    pub fn to_local_keys(&self, unlocked: &UnlockedKeys) -> LocalKeys {
        LocalKeys {
            mac_key: unlocked.mac_key.to_vec(),
            public_key: Some(self.public_key.clone()),
        }
    }
}

impl LocalKeys {
    /// Plaintext-mode key material: a MAC key and no encryption keypair.
    pub fn generate_plaintext() -> Self {
        let mut mac_key = vec![0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut mac_key);
        LocalKeys {
            mac_key,
            public_key: None,
        }
    }

    pub fn mac_key_array(&self) -> Result<[u8; 32]> {
        self.mac_key
            .as_slice()
            .try_into()
            .map_err(|_| CairnError::CacheCorruption("stored MAC key has wrong length".into()))
    }
}

/// Stable AAD bytes from KDF parameters: prefix || field widths || salt.
fn kdf_params_aad(kdf: &KdfParams) -> Vec<u8> {
    let prefix = b"cairn:kdf-aad:v1\0";
    let algo_bytes = kdf.algorithm.as_bytes();
    let mut buf =
        Vec::with_capacity(prefix.len() + 4 + algo_bytes.len() + 4 + 4 + 4 + 4 + kdf.salt.len());
    buf.extend_from_slice(prefix);
    buf.extend_from_slice(&(algo_bytes.len() as u32).to_le_bytes());
    buf.extend_from_slice(algo_bytes);
    buf.extend_from_slice(&kdf.time_cost.to_le_bytes());
    buf.extend_from_slice(&kdf.memory_cost.to_le_bytes());
    buf.extend_from_slice(&kdf.parallelism.to_le_bytes());
    buf.extend_from_slice(&(kdf.salt.len() as u32).to_le_bytes());
    buf.extend_from_slice(&kdf.salt);
    buf
}

/// Stretch the passphrase into a 32-byte wrapping key with Argon2id.
fn stretch_passphrase(passphrase: &str, kdf: &KdfParams) -> Result<Zeroizing<[u8; 32]>> {
    let mut key = Zeroizing::new([0u8; 32]);
    let params =
        argon2::Params::new(kdf.memory_cost, kdf.time_cost, kdf.parallelism, Some(key.len()))
            .map_err(|e| CairnError::KeyDerivation(format!("bad argon2 parameters: {e}")))?;
    Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, params)
        .hash_password_into(passphrase.as_bytes(), &kdf.salt, key.as_mut())
        .map_err(|e| CairnError::KeyDerivation(format!("argon2: {e}")))?;
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_PASSPHRASE: &str = "test-passphrase-123";

    #[test]
    fn generate_unlock_roundtrip() {
        let (key_file, local) = KeyFile::generate(TEST_PASSPHRASE).unwrap();
        let unlocked = key_file.unlock(TEST_PASSPHRASE).unwrap();
        assert_eq!(unlocked.mac_key.to_vec(), local.mac_key);
        let public = PublicKey::from(&unlocked.secret_key);
        assert_eq!(public.as_bytes().to_vec(), key_file.public_key);
    }

    #[test]
    fn wrong_passphrase_rejected() {
        let (key_file, _) = KeyFile::generate(TEST_PASSPHRASE).unwrap();
        let result = key_file.unlock("not-the-passphrase");
        assert!(matches!(result, Err(CairnError::AuthFail)));
    }

    #[test]
    fn mac_key_is_not_the_public_key() {
        let (key_file, local) = KeyFile::generate(TEST_PASSPHRASE).unwrap();
        assert_ne!(local.mac_key, key_file.public_key);
    }

    #[test]
    fn generated_params_sit_inside_the_accepted_ranges() {
        let (key_file, _) = KeyFile::generate(TEST_PASSPHRASE).unwrap();
        assert!(validate_kdf_params(&key_file.kdf).is_ok());
    }

    #[test]
    fn wrong_nonce_length_rejected() {
        let (mut key_file, _) = KeyFile::generate(TEST_PASSPHRASE).unwrap();
        key_file.nonce = vec![0u8; 8];
        assert!(matches!(
            key_file.unlock(TEST_PASSPHRASE),
            Err(CairnError::AuthFail)
        ));
    }

    #[test]
    fn kdf_excessive_memory_rejected() {
        let (mut key_file, _) = KeyFile::generate(TEST_PASSPHRASE).unwrap();
        key_file.kdf.memory_cost = u32::MAX;
        assert!(matches!(
            key_file.unlock(TEST_PASSPHRASE),
            Err(CairnError::AuthFail)
        ));
    }

    #[test]
    fn kdf_bad_algorithm_rejected() {
        let (mut key_file, _) = KeyFile::generate(TEST_PASSPHRASE).unwrap();
        key_file.kdf.algorithm = "scrypt".into();
        assert!(matches!(
            key_file.unlock(TEST_PASSPHRASE),
            Err(CairnError::AuthFail)
        ));
    }

    #[test]
    fn kdf_short_salt_rejected() {
        let (mut key_file, _) = KeyFile::generate(TEST_PASSPHRASE).unwrap();
        key_file.kdf.salt = vec![0u8; 8];
        assert!(matches!(
            key_file.unlock(TEST_PASSPHRASE),
            Err(CairnError::AuthFail)
        ));
    }

    #[test]
    fn tampered_kdf_params_fail_aad_check() {
        // Parameters stay within bounds but no longer match the AAD the
        // bundle was sealed with.
        let (mut key_file, _) = KeyFile::generate(TEST_PASSPHRASE).unwrap();
        key_file.kdf.time_cost = 4;
        assert!(matches!(
            key_file.unlock(TEST_PASSPHRASE),
            Err(CairnError::AuthFail)
        ));
    }

    #[test]
    fn serde_roundtrip() {
        let (key_file, _) = KeyFile::generate(TEST_PASSPHRASE).unwrap();
        let bytes = rmp_serde::to_vec(&key_file).unwrap();
        let restored: KeyFile = rmp_serde::from_slice(&bytes).unwrap();
        assert!(restored.unlock(TEST_PASSPHRASE).is_ok());
    }
}
