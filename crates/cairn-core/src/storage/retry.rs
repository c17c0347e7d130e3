use std::time::Duration;

use crate::error::{CairnError, Result};
use crate::storage::StorageBackend;

/// Retry policy for transient storage failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub retry_max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 200,
            retry_max_delay_ms: 5_000,
        }
    }
}

/// Whether an I/O error is transient and worth retrying.
pub fn is_retryable_io(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::TimedOut
            | std::io::ErrorKind::Interrupted
    )
}

fn is_retryable(err: &CairnError) -> bool {
    match err {
        CairnError::Storage(_) => true,
        CairnError::Io(e) => is_retryable_io(e),
        _ => false,
    }
}

/// Retry a storage operation on transient errors with exponential backoff
/// plus jitter. Terminal failures surface the last error unchanged.
fn retry_op<T>(policy: &RetryPolicy, op_name: &str, f: impl Fn() -> Result<T>) -> Result<T> {
    let mut delay_ms = policy.retry_delay_ms;
    let mut last_err = None;

    for attempt in 0..=policy.max_retries {
        if attempt > 0 {
            let jitter = rand::random::<u64>() % delay_ms.max(1);
            std::thread::sleep(Duration::from_millis(delay_ms + jitter));
            delay_ms = (delay_ms * 2).min(policy.retry_max_delay_ms);
        }
        match f() {
            Ok(val) => return Ok(val),
            Err(e) if is_retryable(&e) && attempt < policy.max_retries => {
                tracing::warn!(
                    "storage {op_name}: transient error (attempt {}/{}), retrying: {e}",
                    attempt + 1,
                    policy.max_retries,
                );
                last_err = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_err.expect("retry loop exhausted without an error"))
}

/// Wraps any backend with the retry policy. `list` is not retried: its
/// iterator is lazy and callers drive it incrementally.
pub struct RetryBackend<B: StorageBackend> {
    inner: B,
    policy: RetryPolicy,
}

impl<B: StorageBackend> RetryBackend<B> {
    pub fn new(inner: B, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

impl<B: StorageBackend> StorageBackend for RetryBackend<B> {
    fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        retry_op(&self.policy, "put", || self.inner.put(key, data))
    }

    fn get(&self, key: &str) -> Result<Vec<u8>> {
        retry_op(&self.policy, "get", || self.inner.get(key))
    }

    fn delete(&self, key: &str) -> Result<()> {
        retry_op(&self.policy, "delete", || self.inner.delete(key))
    }

    fn list(&self, prefix: &str) -> Result<Box<dyn Iterator<Item = Result<String>> + '_>> {
        self.inner.list(prefix)
    }

    fn exists(&self, key: &str) -> Result<bool> {
        retry_op(&self.policy, "exists", || self.inner.exists(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Backend that fails the first N calls with a transient error.
    struct FlakyBackend {
        failures_left: AtomicU32,
        data: Mutex<std::collections::HashMap<String, Vec<u8>>>,
    }

    impl FlakyBackend {
        fn new(failures: u32) -> Self {
            Self {
                failures_left: AtomicU32::new(failures),
                data: Mutex::new(std::collections::HashMap::new()),
            }
        }

        fn maybe_fail(&self) -> Result<()> {
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(CairnError::Storage("simulated transient failure".into()));
            }
            Ok(())
        }
    }

    impl StorageBackend for FlakyBackend {
        fn put(&self, key: &str, data: &[u8]) -> Result<()> {
            self.maybe_fail()?;
            self.data
                .lock()
                .unwrap()
                .insert(key.to_string(), data.to_vec());
            Ok(())
        }

        fn get(&self, key: &str) -> Result<Vec<u8>> {
            self.maybe_fail()?;
            self.data
                .lock()
                .unwrap()
                .get(key)
                .cloned()
                .ok_or_else(|| CairnError::NotFound(key.to_string()))
        }

        fn delete(&self, key: &str) -> Result<()> {
            self.maybe_fail()?;
            self.data.lock().unwrap().remove(key);
            Ok(())
        }

        fn list(&self, _prefix: &str) -> Result<Box<dyn Iterator<Item = Result<String>> + '_>> {
            Ok(Box::new(std::iter::empty()))
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            retry_delay_ms: 1,
            retry_max_delay_ms: 2,
        }
    }

    #[test]
    fn transient_failures_are_retried() {
        let backend = RetryBackend::new(FlakyBackend::new(2), fast_policy());
        backend.put("k", b"v").unwrap();
        assert_eq!(backend.get("k").unwrap(), b"v");
    }

    #[test]
    fn exhausted_retries_surface_the_error() {
        let backend = RetryBackend::new(FlakyBackend::new(10), fast_policy());
        assert!(matches!(
            backend.put("k", b"v"),
            Err(CairnError::Storage(_))
        ));
    }

    #[test]
    fn not_found_is_not_retried() {
        let backend = RetryBackend::new(FlakyBackend::new(0), fast_policy());
        assert!(matches!(
            backend.get("missing"),
            Err(CairnError::NotFound(_))
        ));
    }
}
