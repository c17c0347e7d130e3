pub mod codec;

use cairn_types::object_id::ObjectId;

use crate::error::{CairnError, Result};

/// Object kind tags as they appear on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ObjectKind {
    Tree = 0x74,
    Inode = 0x69,
    Blob = 0x62,
}

impl ObjectKind {
    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            0x74 => Ok(ObjectKind::Tree),
            0x69 => Ok(ObjectKind::Inode),
            0x62 => Ok(ObjectKind::Blob),
            other => Err(CairnError::UnknownObjectType(other)),
        }
    }

    /// Kind name as stored in the object cache.
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::Tree => "tree",
            ObjectKind::Inode => "inode",
            ObjectKind::Blob => "blob",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "tree" => Ok(ObjectKind::Tree),
            "inode" => Ok(ObjectKind::Inode),
            "blob" => Ok(ObjectKind::Blob),
            other => Err(CairnError::CacheCorruption(format!(
                "unknown object kind in cache: '{other}'"
            ))),
        }
    }
}

/// A directory entry inside a tree payload. Names are raw bytes so
/// non-UTF-8 filenames survive a backup/restore cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    pub name: Vec<u8>,
    pub child: ObjectId,
}

/// Payload of a directory object. Encoding sorts entries by name, so two
/// trees with the same entries always produce the same bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeObject {
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub entries: Vec<TreeEntry>,
}

/// One data chunk of a regular file: byte offset plus the blob holding it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRef {
    pub offset: u64,
    pub blob: ObjectId,
}

/// Payload of a regular-file object. The chunk list is sorted by offset and
/// covers the file contents contiguously; an empty file has no chunks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InodeObject {
    pub size: u64,
    pub inode: u64,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub ctime_ns: i64,
    pub mtime_ns: i64,
    pub chunks: Vec<ChunkRef>,
}

/// A decoded object payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectPayload {
    Tree(TreeObject),
    Inode(InodeObject),
    Blob(Vec<u8>),
}

impl ObjectPayload {
    pub fn kind(&self) -> ObjectKind {
        match self {
            ObjectPayload::Tree(_) => ObjectKind::Tree,
            ObjectPayload::Inode(_) => ObjectKind::Inode,
            ObjectPayload::Blob(_) => ObjectKind::Blob,
        }
    }
}
