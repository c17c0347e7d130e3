use std::path::Path;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::backup::{self, BackupContext, BackupStats};
use crate::cache::snapshots::SnapshotRow;
use crate::cache::CacheDb;
use crate::cancel::CancelToken;
use crate::compress::Compression;
use crate::config::{CompressionAlgorithm, EngineConfig};
use crate::crypto::keys::{KeyFile, LocalKeys};
use crate::crypto::sealed::SealedBoxProvider;
use crate::crypto::{CryptoProvider, PlaintextProvider};
use crate::error::{CairnError, Result};
use crate::gc::{self, GcStats};
use crate::restore::{self, RestoreStats};
use crate::scanner::{self, ScanStats};
use crate::snapshot::SnapshotMeta;
use crate::storage::{snapshot_key, StorageBackend, META_CONFIG_KEY, META_KEYS_KEY};

/// Repository-level configuration persisted (unencrypted) at `meta/config`.
/// Chunker parameters must be shared by every client of a repository or
/// deduplication degrades to nothing.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RepoMeta {
    version: u32,
    chunker: crate::config::ChunkerConfig,
    compression: String,
    zstd_level: i32,
}

const REPO_VERSION: u32 = 1;
const LOCAL_KEYS_SETTING: &str = "keys.local";

/// A handle to an opened repository: storage backend, crypto provider, and
/// the local cache database. One logical backup runs at a time; the
/// repository is treated as single-writer per backup set.
pub struct Repository {
    storage: Box<dyn StorageBackend>,
    crypto: Box<dyn CryptoProvider>,
    cache: CacheDb,
    config: EngineConfig,
}

impl std::fmt::Debug for Repository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository").finish_non_exhaustive()
    }
}

impl Repository {
    /// Initialize a new repository. With a passphrase, key material is
    /// generated and the wrapped private key lands at `meta/keys`; without
    /// one the repository stores plaintext (MAC-keyed dedup still works).
    pub fn init(
        storage: Box<dyn StorageBackend>,
        cache: CacheDb,
        passphrase: Option<&str>,
        config: EngineConfig,
    ) -> Result<Self> {
        if storage.exists(META_CONFIG_KEY)? {
            return Err(CairnError::RepoAlreadyExists);
        }

        let local = match passphrase {
            Some(pass) => {
                let (key_file, local) = KeyFile::generate(pass)?;
                storage.put(META_KEYS_KEY, &rmp_serde::to_vec(&key_file)?)?;
                local
            }
            None => LocalKeys::generate_plaintext(),
        };

        let meta = RepoMeta {
            version: REPO_VERSION,
            chunker: config.chunker,
            compression: config.compression.as_str().to_string(),
            zstd_level: config.zstd_level,
        };
        storage.put(META_CONFIG_KEY, &rmp_serde::to_vec(&meta)?)?;
        cache.put_setting(LOCAL_KEYS_SETTING, &rmp_serde::to_vec(&local)?)?;

        let crypto = build_provider(&local)?;
        info!(version = meta.version, "repository initialized");
        Ok(Self {
            storage,
            crypto,
            cache,
            config,
        })
    }

    /// Open an existing repository using local key material. Scan, backup,
    /// and GC all work in this state; restore needs `unlock` first.
    pub fn open(storage: Box<dyn StorageBackend>, cache: CacheDb) -> Result<Self> {
        let config = load_engine_config(storage.as_ref())?;
        let local_blob = cache.get_setting(LOCAL_KEYS_SETTING)?.ok_or_else(|| {
            CairnError::Config(
                "no local key material; attach this machine with the passphrase first".into(),
            )
        })?;
        let local: LocalKeys = rmp_serde::from_slice(&local_blob)?;
        let crypto = build_provider(&local)?;
        Ok(Self {
            storage,
            crypto,
            cache,
            config,
        })
    }

    /// Attach a machine with an empty cache to an existing repository:
    /// recover key material from `meta/keys` using the passphrase.
    pub fn attach(
        storage: Box<dyn StorageBackend>,
        cache: CacheDb,
        passphrase: &str,
    ) -> Result<Self> {
        let config = load_engine_config(storage.as_ref())?;
        let key_file: KeyFile = rmp_serde::from_slice(&storage.get(META_KEYS_KEY)?)?;
        let unlocked = key_file.unlock(passphrase)?;
        let local = key_file.to_local_keys(&unlocked);
        cache.put_setting(LOCAL_KEYS_SETTING, &rmp_serde::to_vec(&local)?)?;

        let crypto: Box<dyn CryptoProvider> =
            Box::new(SealedBoxProvider::new(&local)?.with_secret(unlocked.secret_key));
        Ok(Self {
            storage,
            crypto,
            cache,
            config,
        })
    }

    /// Unlock the private key for restore and verify flows.
    pub fn unlock(&mut self, passphrase: &str) -> Result<()> {
        if self.crypto.can_open() {
            return Ok(());
        }
        let key_file: KeyFile = rmp_serde::from_slice(&self.storage.get(META_KEYS_KEY)?)?;
        let unlocked = key_file.unlock(passphrase)?;
        let local = key_file.to_local_keys(&unlocked);
        self.crypto = Box::new(SealedBoxProvider::new(&local)?.with_secret(unlocked.secret_key));
        Ok(())
    }

    /// Register a directory subtree as a backup set. The first scan
    /// bootstraps it.
    pub fn add_root(&self, backup_set: &str, path: &Path) -> Result<i64> {
        let abs = std::fs::canonicalize(path).map_err(|e| CairnError::Fs {
            path: path.to_path_buf(),
            source: e,
        })?;
        self.cache.fs_add_root(backup_set, &abs)
    }

    /// Detect filesystem changes across all backup sets.
    pub fn scan(&self, cancel: &CancelToken) -> Result<ScanStats> {
        scanner::scan(&self.cache, cancel)
    }

    /// Materialize a snapshot of one backup set. Requires a prior scan
    /// with no new entries pending.
    pub fn backup(
        &self,
        backup_set: &str,
        snapshot_name: &str,
        cancel: &CancelToken,
    ) -> Result<BackupStats> {
        backup::validate_snapshot_name(snapshot_name)?;
        if self.cache.fs_has_new()? {
            return Err(CairnError::Config(
                "files cache has unscanned entries; run a scan first".into(),
            ));
        }
        if self.cache.snap_get(snapshot_name)?.is_some() {
            return Err(CairnError::SnapshotAlreadyExists(snapshot_name.to_string()));
        }
        let root = self.cache.fs_root(backup_set)?.ok_or_else(|| {
            CairnError::Config(format!("unknown backup set '{backup_set}'"))
        })?;

        let ctx = BackupContext {
            storage: self.storage.as_ref(),
            crypto: self.crypto.as_ref(),
            cache: &self.cache,
            compression: self.compression(),
            chunker: self.config.chunker,
            pool: backup::build_upload_pool(self.config.upload_threads)?,
            cancel,
        };

        let mut stats = BackupStats::default();
        let root_oid = backup::backup_tree(&ctx, root.entry_id, &mut stats)?;

        let created_at = Utc::now();
        let meta = SnapshotMeta {
            name: snapshot_name.to_string(),
            root_path: root.path.to_string_lossy().into_owned(),
            root_oid,
            created_at,
            stats: stats.clone(),
        };
        self.storage.put(
            &snapshot_key(snapshot_name),
            &meta.to_wire(self.compression(), self.crypto.as_ref())?,
        )?;
        self.cache.snap_create(
            snapshot_name,
            &root_oid,
            &meta.root_path,
            created_at.timestamp(),
        )?;

        info!(
            snapshot = snapshot_name,
            files = stats.files,
            uploaded = stats.objects_uploaded(),
            deduped = stats.objects_deduped,
            errors = stats.soft_errors,
            "backup committed"
        );
        Ok(stats)
    }

    pub fn snapshots(&self) -> Result<Vec<SnapshotRow>> {
        self.cache.snap_list()
    }

    /// Remove a snapshot from the registry and the repository. The objects
    /// it referenced stay until the next garbage collection.
    pub fn remove_snapshot(&self, name: &str) -> Result<()> {
        if self.cache.snap_get(name)?.is_none() {
            return Err(CairnError::SnapshotNotFound(name.to_string()));
        }
        self.storage.delete(&snapshot_key(name))?;
        self.cache.snap_remove(name)?;
        info!(snapshot = name, "snapshot removed");
        Ok(())
    }

    /// Delete objects unreachable from any live snapshot.
    pub fn collect_garbage(&self, cancel: &CancelToken) -> Result<GcStats> {
        gc::collect_garbage(self.storage.as_ref(), &self.cache, cancel)
    }

    /// Restore a snapshot into a fresh target directory. Requires the
    /// unlocked private key.
    pub fn restore_snapshot(
        &self,
        name: &str,
        target: &Path,
        cancel: &CancelToken,
    ) -> Result<RestoreStats> {
        let row = self
            .cache
            .snap_get(name)?
            .ok_or_else(|| CairnError::SnapshotNotFound(name.to_string()))?;
        restore::restore_tree(
            self.storage.as_ref(),
            self.crypto.as_ref(),
            &row.root_oid,
            target,
            cancel,
        )
    }

    pub fn set_upload_threads(&mut self, threads: usize) {
        self.config.upload_threads = threads;
    }

    fn compression(&self) -> Compression {
        Compression::from_algorithm(self.config.compression, self.config.zstd_level)
    }

    pub fn cache(&self) -> &CacheDb {
        &self.cache
    }

    pub fn storage(&self) -> &dyn StorageBackend {
        self.storage.as_ref()
    }

    pub fn crypto(&self) -> &dyn CryptoProvider {
        self.crypto.as_ref()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

fn load_engine_config(storage: &dyn StorageBackend) -> Result<EngineConfig> {
    let meta: RepoMeta = match storage.get(META_CONFIG_KEY) {
        Ok(bytes) => rmp_serde::from_slice(&bytes)?,
        Err(CairnError::NotFound(_)) => {
            return Err(CairnError::Config(
                "no repository found at this location".into(),
            ));
        }
        Err(e) => return Err(e),
    };
    if meta.version != REPO_VERSION {
        return Err(CairnError::Config(format!(
            "unsupported repository version: {}",
            meta.version
        )));
    }
    Ok(EngineConfig {
        chunker: meta.chunker,
        compression: CompressionAlgorithm::from_config(&meta.compression)?,
        zstd_level: meta.zstd_level,
        ..EngineConfig::default()
    })
}

fn build_provider(local: &LocalKeys) -> Result<Box<dyn CryptoProvider>> {
    match local.public_key {
        Some(_) => Ok(Box::new(SealedBoxProvider::new(local)?)),
        None => Ok(Box::new(PlaintextProvider::new(&local.mac_key_array()?))),
    }
}
