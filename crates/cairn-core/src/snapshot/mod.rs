use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use cairn_types::object_id::ObjectId;

use crate::backup::BackupStats;
use crate::compress::Compression;
use crate::crypto::CryptoProvider;
use crate::error::{CairnError, Result};
use crate::object::codec;

/// Snapshot metadata as stored in the repository at `snapshots/<name>`.
///
/// Unlike tree/inode/blob objects a snapshot is named, not
/// content-addressed, but it goes through the same compress-then-seal
/// envelope. It is the only object a recovering client needs to find the
/// DAG root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub name: String,
    pub root_path: String,
    pub root_oid: ObjectId,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub stats: BackupStats,
}

impl SnapshotMeta {
    /// Serialize, compress, and seal for upload.
    pub fn to_wire(&self, compression: Compression, crypto: &dyn CryptoProvider) -> Result<Vec<u8>> {
        let plain = rmp_serde::to_vec(self)?;
        codec::pack_payload(&plain, compression, crypto)
    }

    /// Open, decompress, and deserialize a snapshot fetched from the
    /// repository. Requires the unlocked private key.
    pub fn from_wire(data: &[u8], crypto: &dyn CryptoProvider) -> Result<Self> {
        let plain = codec::unpack_payload(data, crypto)?;
        let meta: SnapshotMeta = rmp_serde::from_slice(&plain)
            .map_err(|e| CairnError::CorruptObject(format!("snapshot metadata: {e}")))?;
        Ok(meta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::PlaintextProvider;

    fn sample() -> SnapshotMeta {
        SnapshotMeta {
            name: "nightly".into(),
            root_path: "/home/user".into(),
            root_oid: ObjectId([0x42; 32]),
            created_at: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
            stats: BackupStats {
                files: 10,
                dirs: 3,
                ..BackupStats::default()
            },
        }
    }

    #[test]
    fn wire_roundtrip() {
        let crypto = PlaintextProvider::new(&[0xAA; 32]);
        let wire = sample().to_wire(Compression::Lz4, &crypto).unwrap();
        let back = SnapshotMeta::from_wire(&wire, &crypto).unwrap();
        assert_eq!(back.name, "nightly");
        assert_eq!(back.root_oid, ObjectId([0x42; 32]));
        assert_eq!(back.stats.files, 10);
        assert_eq!(back.created_at.timestamp(), 1_700_000_000);
    }

    #[test]
    fn garbage_wire_is_rejected() {
        let crypto = PlaintextProvider::new(&[0xAA; 32]);
        assert!(SnapshotMeta::from_wire(&[0x00, 0x01, 0x02], &crypto).is_err());
    }
}
