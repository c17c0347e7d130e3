use std::ffi::OsString;
use std::fs::Metadata;
use std::path::Path;

/// The stat fields the engine cares about, in one flat struct.
///
/// `(mode, mtime_ns, size)` is the change-detection tuple; the rest feed
/// inode payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatSummary {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub mtime_ns: i64,
    pub ctime_ns: i64,
    pub inode: u64,
    pub size: u64,
    pub is_dir: bool,
    pub is_file: bool,
}

pub fn summarize_metadata(metadata: &Metadata) -> StatSummary {
    let file_type = metadata.file_type();

    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;

        StatSummary {
            mode: metadata.mode(),
            uid: metadata.uid(),
            gid: metadata.gid(),
            mtime_ns: metadata.mtime() * 1_000_000_000 + metadata.mtime_nsec(),
            ctime_ns: metadata.ctime() * 1_000_000_000 + metadata.ctime_nsec(),
            inode: metadata.ino(),
            size: metadata.len(),
            is_dir: file_type.is_dir(),
            is_file: file_type.is_file(),
        }
    }

    #[cfg(not(unix))]
    {
        let mode = if file_type.is_dir() { 0o40755 } else { 0o100644 };
        let mtime_ns = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::SystemTime::UNIX_EPOCH).ok())
            .map(|d| d.as_nanos() as i64)
            .unwrap_or(0);
        StatSummary {
            mode,
            uid: 0,
            gid: 0,
            mtime_ns,
            ctime_ns: mtime_ns,
            inode: 0,
            size: metadata.len(),
            is_dir: file_type.is_dir(),
            is_file: file_type.is_file(),
        }
    }
}

/// Whether a cached st_mode value describes a directory.
pub fn mode_is_dir(mode: u32) -> bool {
    mode & 0o170000 == 0o040000
}

/// Whether a cached st_mode value describes a regular file.
pub fn mode_is_file(mode: u32) -> bool {
    mode & 0o170000 == 0o100000
}

pub fn apply_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode & 0o7777))
    }

    #[cfg(not(unix))]
    {
        let _ = (path, mode);
        Ok(())
    }
}

/// Filesystem names are carried as raw bytes end to end so non-UTF-8 names
/// survive the cache and the tree payloads.
pub fn os_to_bytes(name: &std::ffi::OsStr) -> Vec<u8> {
    #[cfg(unix)]
    {
        use std::os::unix::ffi::OsStrExt;
        name.as_bytes().to_vec()
    }

    #[cfg(not(unix))]
    {
        name.to_string_lossy().into_owned().into_bytes()
    }
}

pub fn bytes_to_os(bytes: &[u8]) -> OsString {
    #[cfg(unix)]
    {
        use std::os::unix::ffi::OsStringExt;
        OsString::from_vec(bytes.to_vec())
    }

    #[cfg(not(unix))]
    {
        OsString::from(String::from_utf8_lossy(bytes).into_owned())
    }
}
