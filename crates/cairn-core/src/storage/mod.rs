pub mod local_backend;
pub mod retry;

use cairn_types::object_id::ObjectId;

use crate::error::Result;

/// Reserved key spaces in the repository.
pub const META_KEYS_KEY: &str = "meta/keys";
pub const META_CONFIG_KEY: &str = "meta/config";
pub const OBJECTS_PREFIX: &str = "objects/";
pub const SNAPSHOTS_PREFIX: &str = "snapshots/";

/// Storage key for a content-addressed object.
pub fn object_key(oid: &ObjectId) -> String {
    format!("{OBJECTS_PREFIX}{}", oid.to_hex())
}

/// Storage key for a named snapshot metadata object.
pub fn snapshot_key(name: &str) -> String {
    format!("{SNAPSHOTS_PREFIX}{name}")
}

/// Abstract key-value storage for repository objects.
/// Keys are `/`-separated string paths (e.g. "objects/ab01cd02...").
///
/// `put` must be idempotent: re-putting a key with identical bytes
/// succeeds. Putting different bytes under an existing key is a violated
/// caller invariant, since object keys are content addresses.
pub trait StorageBackend: Send + Sync {
    /// Write an object.
    fn put(&self, key: &str, data: &[u8]) -> Result<()>;

    /// Read an object by key. Fails with `NotFound` when the key is absent.
    fn get(&self, key: &str) -> Result<Vec<u8>>;

    /// Delete an object. Deleting a missing key is not an error.
    fn delete(&self, key: &str) -> Result<()>;

    /// Lazily enumerate all keys under a prefix.
    fn list(&self, prefix: &str) -> Result<Box<dyn Iterator<Item = Result<String>> + '_>>;

    /// Check whether a key exists without reading its contents.
    fn exists(&self, key: &str) -> Result<bool> {
        match self.get(key) {
            Ok(_) => Ok(true),
            Err(crate::error::CairnError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}
