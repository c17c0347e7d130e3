use serde::{Deserialize, Serialize};

use crate::error::{CairnError, Result};

/// Fixed-size chunker parameters.
///
/// Files shorter than `min_chunkable` are stored as a single chunk; longer
/// files are split into `chunk_size` pieces. Persisted in the repository
/// config so every client of a repository chunks identically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkerConfig {
    pub chunk_size: u64,
    pub min_chunkable: u64,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            chunk_size: 10 * 1024 * 1024,
            min_chunkable: 30 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum CompressionAlgorithm {
    None,
    Lz4,
    #[default]
    Zstd,
}

impl CompressionAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompressionAlgorithm::None => "none",
            CompressionAlgorithm::Lz4 => "lz4",
            CompressionAlgorithm::Zstd => "zstd",
        }
    }

    /// Parse from a config string like "zstd", "lz4", "none".
    pub fn from_config(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(CompressionAlgorithm::None),
            "lz4" => Ok(CompressionAlgorithm::Lz4),
            "zstd" => Ok(CompressionAlgorithm::Zstd),
            other => Err(CairnError::Config(format!(
                "unknown compression algorithm: {other}"
            ))),
        }
    }
}

/// Engine tunables. Chunker and compression settings are written to the
/// repository at init time; the rest are purely local.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub chunker: ChunkerConfig,
    #[serde(default)]
    pub compression: CompressionAlgorithm,
    #[serde(default = "default_zstd_level")]
    pub zstd_level: i32,
    /// Worker threads for blob encode/encrypt/upload. 1 means sequential.
    #[serde(default = "default_upload_threads")]
    pub upload_threads: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunker: ChunkerConfig::default(),
            compression: CompressionAlgorithm::default(),
            zstd_level: default_zstd_level(),
            upload_threads: default_upload_threads(),
        }
    }
}

fn default_zstd_level() -> i32 {
    3
}

fn default_upload_threads() -> usize {
    4
}
