use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::cache::CacheDb;
use crate::config::{ChunkerConfig, CompressionAlgorithm, EngineConfig};
use crate::error::{CairnError, Result};
use crate::repo::Repository;
use crate::storage::StorageBackend;

/// In-memory storage backend for tests. Thread-safe via Mutex.
pub(crate) struct MemoryBackend {
    data: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryBackend {
    pub(crate) fn new() -> Self {
        Self {
            data: Mutex::new(HashMap::new()),
        }
    }
}

impl StorageBackend for MemoryBackend {
    fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        self.data
            .lock()
            .unwrap()
            .insert(key.to_string(), data.to_vec());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.data
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| CairnError::NotFound(key.to_string()))
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.data.lock().unwrap().remove(key);
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Box<dyn Iterator<Item = Result<String>> + '_>> {
        let keys: Vec<String> = self
            .data
            .lock()
            .unwrap()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        Ok(Box::new(keys.into_iter().map(Ok)))
    }

    fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.data.lock().unwrap().contains_key(key))
    }
}

/// Shared control block for `FaultyBackend`: a put budget for fault
/// injection plus a put counter for dedup assertions.
#[derive(Debug)]
pub(crate) struct FaultState {
    /// Successful puts allowed before failing; negative means unlimited.
    puts_remaining: AtomicI64,
    puts_total: AtomicU64,
    deletes_failing: AtomicBool,
}

impl FaultState {
    pub(crate) fn unlimited() -> Arc<Self> {
        Arc::new(Self {
            puts_remaining: AtomicI64::new(-1),
            puts_total: AtomicU64::new(0),
            deletes_failing: AtomicBool::new(false),
        })
    }

    pub(crate) fn set_deletes_failing(&self, failing: bool) {
        self.deletes_failing.store(failing, Ordering::SeqCst);
    }

    pub(crate) fn set_put_budget(&self, budget: i64) {
        self.puts_remaining.store(budget, Ordering::SeqCst);
    }

    pub(crate) fn put_count(&self) -> u64 {
        self.puts_total.load(Ordering::SeqCst)
    }

    fn consume(&self) -> Result<()> {
        loop {
            let current = self.puts_remaining.load(Ordering::SeqCst);
            if current < 0 {
                return Ok(());
            }
            if current == 0 {
                return Err(CairnError::Storage("injected upload failure".into()));
            }
            if self
                .puts_remaining
                .compare_exchange(current, current - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return Ok(());
            }
        }
    }
}

/// Memory backend whose puts fail once a configured budget runs out.
/// Drives the crash-mid-backup scenarios.
pub(crate) struct FaultyBackend {
    inner: MemoryBackend,
    state: Arc<FaultState>,
}

impl FaultyBackend {
    pub(crate) fn new(state: Arc<FaultState>) -> Self {
        Self {
            inner: MemoryBackend::new(),
            state,
        }
    }
}

impl StorageBackend for FaultyBackend {
    fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        self.state.consume()?;
        self.state.puts_total.fetch_add(1, Ordering::SeqCst);
        self.inner.put(key, data)
    }

    fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.inner.get(key)
    }

    fn delete(&self, key: &str) -> Result<()> {
        if self.state.deletes_failing.load(Ordering::SeqCst) {
            return Err(CairnError::Storage("injected delete failure".into()));
        }
        self.inner.delete(key)
    }

    fn list(&self, prefix: &str) -> Result<Box<dyn Iterator<Item = Result<String>> + '_>> {
        self.inner.list(prefix)
    }

    fn exists(&self, key: &str) -> Result<bool> {
        self.inner.exists(key)
    }
}

/// Chunker settings small enough to exercise multi-chunk files in tests.
pub(crate) fn test_chunker_config() -> ChunkerConfig {
    ChunkerConfig {
        chunk_size: 8,
        min_chunkable: 16,
    }
}

pub(crate) fn test_engine_config() -> EngineConfig {
    EngineConfig {
        chunker: test_chunker_config(),
        compression: CompressionAlgorithm::Lz4,
        zstd_level: 3,
        upload_threads: 1,
    }
}

/// Plaintext repository over an in-memory backend.
pub(crate) fn test_repo() -> Repository {
    let storage = Box::new(MemoryBackend::new());
    let cache = CacheDb::open_in_memory().expect("in-memory cache");
    Repository::init(storage, cache, None, test_engine_config()).expect("init test repo")
}

/// Plaintext repository over a fault-injectable backend.
pub(crate) fn test_repo_faulty() -> (Repository, Arc<FaultState>) {
    let state = FaultState::unlimited();
    let storage = Box::new(FaultyBackend::new(state.clone()));
    let cache = CacheDb::open_in_memory().expect("in-memory cache");
    let repo =
        Repository::init(storage, cache, None, test_engine_config()).expect("init test repo");
    (repo, state)
}
