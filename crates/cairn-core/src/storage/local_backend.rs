use std::fs;
use std::path::PathBuf;

use crate::error::{CairnError, Result};
use crate::storage::StorageBackend;

/// Storage backend writing repository objects as plain files under a root
/// directory.
pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self { root: root.into() })
    }

    /// Parse a storage key into its path segments.
    ///
    /// The engine only ever generates keys from a closed vocabulary (hex
    /// digests, snapshot names, the fixed `meta/` entries), so the parser
    /// is strict rather than permissive: every `/`-separated segment must
    /// be a plain name. Anything that reads like a filesystem hop — empty
    /// segments, dot entries, backslashes, NULs — is refused, and the
    /// final path is assembled segment by segment under the root, never
    /// joined from the raw key.
    fn key_segments(key: &str) -> Result<Vec<&str>> {
        let malformed = || CairnError::Config(format!("malformed storage key: '{key}'"));
        if key.is_empty() {
            return Err(malformed());
        }
        let mut segments = Vec::new();
        for segment in key.split('/') {
            match segment {
                "" | "." | ".." => return Err(malformed()),
                s if s.contains('\\') || s.contains('\0') => return Err(malformed()),
                s => segments.push(s),
            }
        }
        Ok(segments)
    }

    fn resolve(&self, key: &str) -> Result<PathBuf> {
        let mut path = self.root.clone();
        for segment in Self::key_segments(key)? {
            path.push(segment);
        }
        Ok(path)
    }

    fn key_for(&self, path: &std::path::Path) -> Option<String> {
        let rel = path.strip_prefix(&self.root).ok()?;
        Some(
            rel.components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/"),
        )
    }
}

impl StorageBackend for LocalBackend {
    fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, data)?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.resolve(key)?;
        match fs::read(&path) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(CairnError::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn delete(&self, key: &str) -> Result<()> {
        let path = self.resolve(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn list(&self, prefix: &str) -> Result<Box<dyn Iterator<Item = Result<String>> + '_>> {
        let dir = self.resolve(prefix.trim_end_matches('/'))?;
        match fs::metadata(&dir) {
            Ok(meta) if meta.is_dir() => Ok(Box::new(ListIter {
                backend: self,
                stack: vec![fs::read_dir(&dir)?],
            })),
            Ok(_) => Ok(Box::new(std::iter::empty())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Ok(Box::new(std::iter::empty()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn exists(&self, key: &str) -> Result<bool> {
        let path = self.resolve(key)?;
        match fs::metadata(&path) {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// Depth-first lazy walk over files under a prefix directory.
struct ListIter<'a> {
    backend: &'a LocalBackend,
    stack: Vec<fs::ReadDir>,
}

impl Iterator for ListIter<'_> {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let dir = self.stack.last_mut()?;
            let entry = match dir.next() {
                Some(Ok(entry)) => entry,
                Some(Err(e)) => return Some(Err(e.into())),
                None => {
                    self.stack.pop();
                    continue;
                }
            };
            let file_type = match entry.file_type() {
                Ok(ft) => ft,
                Err(e) => return Some(Err(e.into())),
            };
            if file_type.is_dir() {
                match fs::read_dir(entry.path()) {
                    Ok(rd) => self.stack.push(rd),
                    Err(e) => return Some(Err(e.into())),
                }
            } else if file_type.is_file() {
                if let Some(key) = self.backend.key_for(&entry.path()) {
                    return Some(Ok(key));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn well_formed_keys_parse_into_segments() {
        assert_eq!(LocalBackend::key_segments("meta/config").unwrap(), vec!["meta", "config"]);
        assert_eq!(
            LocalBackend::key_segments("objects/00ff00ff").unwrap(),
            vec!["objects", "00ff00ff"]
        );
        assert_eq!(LocalBackend::key_segments("snapshots/nightly-1").unwrap().len(), 2);
    }

    #[test]
    fn keys_with_path_hops_are_refused() {
        let hostile = [
            "",
            "/objects/aa",
            "objects/aa/",
            "objects//aa",
            "objects/.",
            "objects/..",
            "../secrets",
            "meta/../../passwd",
            "objects\\aa",
            "objects/a\0b",
        ];
        for key in hostile {
            assert!(
                LocalBackend::key_segments(key).is_err(),
                "key {key:?} must be refused"
            );
        }
    }

    #[test]
    fn hostile_keys_never_touch_the_filesystem() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path()).unwrap();
        assert!(backend.get("../../sibling").is_err());
        assert!(backend.put("..", b"nope").is_err());
        assert!(backend.delete("/rooted").is_err());
        assert!(backend.exists("snapshots/../escape").is_err());
    }

    #[test]
    fn get_missing_key_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path()).unwrap();
        assert!(matches!(
            backend.get("objects/absent"),
            Err(CairnError::NotFound(_))
        ));
    }

    #[test]
    fn put_get_delete_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path()).unwrap();
        backend.put("objects/abcd", b"hello").unwrap();
        assert!(backend.exists("objects/abcd").unwrap());
        assert_eq!(backend.get("objects/abcd").unwrap(), b"hello");
        backend.delete("objects/abcd").unwrap();
        assert!(!backend.exists("objects/abcd").unwrap());
    }

    #[test]
    fn delete_missing_key_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path()).unwrap();
        assert!(backend.delete("objects/never-written").is_ok());
    }

    #[test]
    fn put_is_idempotent_for_identical_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path()).unwrap();
        backend.put("objects/k", b"same").unwrap();
        backend.put("objects/k", b"same").unwrap();
        assert_eq!(backend.get("objects/k").unwrap(), b"same");
    }

    #[test]
    fn list_missing_prefix_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path()).unwrap();
        assert_eq!(backend.list("objects").unwrap().count(), 0);
    }

    #[test]
    fn list_yields_nested_keys() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path()).unwrap();
        backend.put("objects/aa", b"1").unwrap();
        backend.put("objects/sub/bb", b"2").unwrap();
        backend.put("snapshots/s1", b"3").unwrap();

        let mut keys: Vec<String> = backend
            .list("objects/")
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap();
        keys.sort();
        assert_eq!(keys, vec!["objects/aa", "objects/sub/bb"]);
    }
}
