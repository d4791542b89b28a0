//! A flat, mtime-addressed cache on disk. No index file, no eviction: the
//! only metadata an entry carries is its own modification time.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};

use crate::digest::url_cache_key;
use crate::error::CacheInitError;

pub static CACHE_DIR_NAME: &str = "para";

/// A handle to the cache root. Cheap to clone; all operations are plain path
/// arithmetic plus best-effort filesystem calls.
#[derive(Debug, Clone)]
pub struct Cache {
    root: PathBuf,
}

impl Cache {
    /// Resolve the cache root as the first of: `explicit_override`;
    /// `<user-cache-dir>/para` if it already exists; otherwise
    /// `<temp-dir>/para-<euid>`, creating it with mode `0744` if absent.
    pub fn discover(explicit_override: Option<PathBuf>) -> Result<Self, CacheInitError> {
        if let Some(root) = explicit_override {
            create_with_mode(&root)?;
            return Ok(Self { root });
        }

        if let Some(dirs) = directories::BaseDirs::new() {
            let candidate = dirs.cache_dir().join(CACHE_DIR_NAME);
            if candidate.is_dir() {
                return Ok(Self { root: candidate });
            }
        }

        let euid = nix::unistd::Uid::effective();
        let fallback = std::env::temp_dir().join(format!("{CACHE_DIR_NAME}-{euid}"));
        create_with_mode(&fallback)?;

        Ok(Self { root: fallback })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Deterministic path for a remote resource's cache entry, content-addressed by URL.
    pub fn index_path(&self, url: &str) -> PathBuf {
        self.root.join("index").join(url_cache_key(url))
    }

    /// Deterministic path for a plugin binary's cache entry.
    pub fn plugin_path(&self, kind: &str, name: &str, version: &str, platform: &str) -> PathBuf {
        self.root
            .join("plugins")
            .join(kind)
            .join(name)
            .join(version)
            .join(platform)
    }

    /// Read an entry's bytes and mtime, if it exists and is readable.
    pub fn read(&self, path: &Path) -> io::Result<Option<(Vec<u8>, DateTime<Utc>)>> {
        match fs::read(path) {
            Ok(bytes) => {
                let modified = fs::metadata(path)?.modified()?;
                Ok(Some((bytes, system_time_to_utc(modified))))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// The mtime of an entry, if present.
    pub fn mtime(&self, path: &Path) -> Option<DateTime<Utc>> {
        fs::metadata(path)
            .and_then(|m| m.modified())
            .ok()
            .map(system_time_to_utc)
    }

    /// Best-effort write: a failure here is never fatal to the caller. Returns
    /// `true` on success so callers can log, but never returns an `Err`.
    pub fn write_best_effort(&self, path: &Path, data: &[u8]) -> bool {
        let Some(parent) = path.parent() else {
            return false;
        };
        if fs::create_dir_all(parent).is_err() {
            return false;
        }
        fs::write(path, data).is_ok()
    }

    /// Whether an entry at `path` exists and is newer than `now - refresh`.
    pub fn is_fresh(&self, path: &Path, refresh: chrono::Duration, now: DateTime<Utc>) -> bool {
        match self.mtime(path) {
            Some(mtime) => mtime > now - refresh,
            None => false,
        }
    }
}

fn system_time_to_utc(t: SystemTime) -> DateTime<Utc> {
    DateTime::<Utc>::from(t)
}

#[cfg(unix)]
fn create_with_mode(path: &Path) -> Result<(), CacheInitError> {
    use std::os::unix::fs::PermissionsExt;

    fs::create_dir_all(path).map_err(|cause| CacheInitError { cause })?;
    let perms = fs::Permissions::from_mode(0o744);
    fs::set_permissions(path, perms).map_err(|cause| CacheInitError { cause })?;
    Ok(())
}

#[cfg(not(unix))]
fn create_with_mode(path: &Path) -> Result<(), CacheInitError> {
    fs::create_dir_all(path).map_err(|cause| CacheInitError { cause })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discover_with_explicit_override_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let override_path = dir.path().join("my-cache");
        let cache = Cache::discover(Some(override_path.clone())).unwrap();
        assert_eq!(cache.root(), override_path.as_path());
        assert!(override_path.is_dir());
    }

    #[test]
    fn index_path_is_content_addressed() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::discover(Some(dir.path().to_owned())).unwrap();
        let a = cache.index_path("https://example.com/index.yaml");
        let b = cache.index_path("https://example.com/index.yaml");
        let c = cache.index_path("https://example.com/other.yaml");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::discover(Some(dir.path().to_owned())).unwrap();
        let path = cache.index_path("https://example.com/index.yaml");

        assert!(cache.write_best_effort(&path, b"hello"));
        let (bytes, _mtime) = cache.read(&path).unwrap().unwrap();
        assert_eq!(bytes, b"hello");
    }

    #[test]
    fn missing_entry_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::discover(Some(dir.path().to_owned())).unwrap();
        let path = cache.index_path("https://example.com/missing.yaml");
        assert!(cache.read(&path).unwrap().is_none());
    }

    #[test]
    fn freshness_respects_refresh_interval() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::discover(Some(dir.path().to_owned())).unwrap();
        let path = cache.index_path("https://example.com/index.yaml");
        cache.write_best_effort(&path, b"hello");

        let now = Utc::now();
        assert!(cache.is_fresh(&path, chrono::Duration::hours(1), now));
        assert!(!cache.is_fresh(&path, chrono::Duration::seconds(-1), now));
    }
}
