use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CairnError>;

#[derive(Debug, Error)]
pub enum CairnError {
    #[error("storage I/O error: {0}")]
    Storage(String),

    #[error("not found in repository: '{0}'")]
    NotFound(String),

    #[error("filesystem error at '{}': {source}", path.display())]
    Fs {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("decryption failed: wrong key or corrupted data")]
    AuthFail,

    #[error("private key is locked; unlock with the passphrase first")]
    KeyLocked,

    #[error("key derivation error: {0}")]
    KeyDerivation(String),

    #[error("local cache corruption: {0}")]
    CacheCorruption(String),

    #[error("repository object corrupted: {0}")]
    CorruptObject(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("repository already exists")]
    RepoAlreadyExists,

    #[error("invalid object format: {0}")]
    InvalidFormat(String),

    #[error("unknown object type tag: {0:#04x}")]
    UnknownObjectType(u8),

    #[error("unknown compression tag: {0}")]
    UnknownCompressionTag(u8),

    #[error("decompression error: {0}")]
    Decompression(String),

    #[error("snapshot not found: '{0}'")]
    SnapshotNotFound(String),

    #[error("snapshot already exists: '{0}'")]
    SnapshotAlreadyExists(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] rmp_serde::encode::Error),

    #[error("deserialization error: {0}")]
    Deserialization(#[from] rmp_serde::decode::Error),

    #[error("cache store error: {0}")]
    Cache(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CairnError {
    /// Per-entry filesystem errors are recovered locally (logged, entry
    /// skipped); every other kind aborts the operation that hit it.
    pub fn is_soft_fs_error(&self) -> bool {
        matches!(self, CairnError::Fs { .. })
    }
}

/// Returns `true` for I/O errors safe to skip per entry (permission denied,
/// entry vanished between listdir and stat).
pub fn is_soft_io_error(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::PermissionDenied
            | std::io::ErrorKind::NotFound
            | std::io::ErrorKind::NotADirectory
    )
}

/// Returns `true` when a path no longer exists. `NotADirectory` counts: a
/// stat through a parent that stopped being a directory means the entry's
/// path is gone even though the name at the end never changed.
pub fn is_vanished_io_error(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::NotFound | std::io::ErrorKind::NotADirectory
    )
}
