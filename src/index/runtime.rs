//! The runtime index: a platform-keyed compilation of the loading index, plus
//! the open-file and reference-count tables it owns.

use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use indexmap::IndexMap;

use crate::artifact::DownloadableFile;
use crate::cache::Cache;
use crate::error::{ArtifactError, FilenameCollision, OpenError, SizeMismatch};
use crate::index::descriptor::Descriptor;
use crate::index::loading::LoadingIndex;
use crate::reporter::{OpenState, Reporter};

struct RuntimeIndexState {
    open_files: HashMap<PathBuf, File>,
    ref_counts: HashMap<PathBuf, usize>,
    reported: HashSet<PathBuf>,
}

/// Compiled, platform-keyed view of the loading index with mutable
/// open-file/ref-count bookkeeping. One write lock guards all cache paths
/// (a deliberate simplicity choice, not a scalability claim).
pub struct RuntimeIndex {
    host_tool: String,
    cache: Cache,
    refresh: chrono::Duration,
    reporter: Arc<dyn Reporter>,
    platforms: IndexMap<String, IndexMap<String, Descriptor>>,
    state: RwLock<RuntimeIndexState>,
}

impl RuntimeIndex {
    /// Fan out every descriptor in `loading` into `platform -> filename ->
    /// descriptor`. Returns [`FilenameCollision`] if two descriptors from
    /// different `(kind, name)` pairs would produce the same
    /// `(platform, filename)` (see the fan-out-collision Open Question: this
    /// implementation enforces uniqueness rather than silently overwriting).
    pub fn build(
        loading: &LoadingIndex,
        host_tool: impl Into<String>,
        cache: Cache,
        refresh: chrono::Duration,
        reporter: Arc<dyn Reporter>,
    ) -> Result<Self, FilenameCollision> {
        let host_tool = host_tool.into();
        let mut platforms: IndexMap<String, IndexMap<String, Descriptor>> = IndexMap::new();
        let mut owners: HashMap<(String, String), (String, String)> = HashMap::new();

        for names in loading.entries.values() {
            for descriptors in names.values() {
                for descriptor in descriptors {
                    let filename = descriptor.filename(&host_tool);
                    let owner_key = (descriptor.platform.clone(), filename.clone());
                    let owner = (descriptor.kind.clone(), descriptor.name.clone());

                    match owners.get(&owner_key) {
                        Some(existing) if *existing != owner => {
                            return Err(FilenameCollision {
                                platform: descriptor.platform.clone(),
                                filename,
                                first: format!("{}/{}", existing.0, existing.1),
                                second: format!("{}/{}", owner.0, owner.1),
                            });
                        }
                        _ => {
                            owners.insert(owner_key, owner);
                        }
                    }

                    platforms
                        .entry(descriptor.platform.clone())
                        .or_default()
                        .insert(filename, descriptor.clone());
                }
            }
        }

        Ok(Self {
            host_tool,
            cache,
            refresh,
            reporter,
            platforms,
            state: RwLock::new(RuntimeIndexState {
                open_files: HashMap::new(),
                ref_counts: HashMap::new(),
                reported: HashSet::new(),
            }),
        })
    }

    pub fn list_platforms(&self) -> Vec<String> {
        self.platforms.keys().cloned().collect()
    }

    pub fn list_plugins(&self, platform: &str) -> Vec<String> {
        self.platforms
            .get(platform)
            .map(|filenames| filenames.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn lookup(&self, platform: &str, filename: &str) -> Option<&Descriptor> {
        self.platforms.get(platform)?.get(filename)
    }

    fn cache_path(&self, descriptor: &Descriptor) -> PathBuf {
        self.cache
            .plugin_path(&descriptor.kind, &descriptor.name, &descriptor.version, &descriptor.platform)
    }

    /// Ensure `descriptor`'s cache path is present and verified, emit the
    /// first-open status line for it, and increment its reference count.
    ///
    /// The write lock is held across the already-cached check, the download
    /// and verify, and the handle open, so two concurrent callers for the
    /// same descriptor never download the same cache path at once: the
    /// second caller blocks until the first has finished and then observes
    /// an already-cached file.
    pub fn open(&self, descriptor: &Descriptor) -> Result<(), OpenError> {
        let cache_path = self.cache_path(descriptor);
        let mut guard = self.state.write().unwrap();

        let already_cached = fs::metadata(&cache_path)
            .map(|m| m.len() == descriptor.size)
            .unwrap_or(false);

        let state = if already_cached {
            OpenState::Cached
        } else {
            OpenState::Downloading
        };

        if guard.reported.insert(cache_path.clone()) {
            self.reporter.report(
                &self.host_tool,
                &descriptor.kind,
                &descriptor.name,
                &descriptor.version,
                &descriptor.platform,
                state,
            );
        }
        *guard.ref_counts.entry(cache_path.clone()).or_insert(0) += 1;

        if !already_cached {
            if let Err(e) = self.download(descriptor, &cache_path) {
                if let Some(count) = guard.ref_counts.get_mut(&cache_path) {
                    *count -= 1;
                }
                return Err(e);
            }
        }

        if !guard.open_files.contains_key(&cache_path) {
            let handle =
                File::open(&cache_path).map_err(|e| OpenError::CacheIo(cache_path.clone(), e))?;
            guard.open_files.insert(cache_path.clone(), handle);
        }

        Ok(())
    }

    fn download(&self, descriptor: &Descriptor, cache_path: &PathBuf) -> Result<(), OpenError> {
        let digest = descriptor
            .digest_spec()
            .map_err(|e| OpenError::Artifact(ArtifactError::from(e)))?;

        let fetchable = DownloadableFile {
            url: descriptor.url.clone(),
            digest: Some(digest),
            extract_pattern: Some(format!("{}-*", self.host_tool)),
        };

        fetchable.save_to(cache_path)?;

        let actual = fs::metadata(cache_path)
            .map_err(|e| OpenError::CacheIo(cache_path.clone(), e))?
            .len();

        if actual != descriptor.size {
            let _ = fs::remove_file(cache_path);
            return Err(SizeMismatch {
                expected: descriptor.size,
                actual,
            }
            .into());
        }

        Ok(())
    }

    /// Read `size` bytes at `offset` from `descriptor`'s open handle. Short
    /// reads near EOF return fewer bytes than requested; reads at or past
    /// EOF return zero bytes. Fails if `open` has not succeeded for this
    /// descriptor.
    pub fn read_at(&self, descriptor: &Descriptor, offset: u64, size: u32) -> std::io::Result<Vec<u8>> {
        let cache_path = self.cache_path(descriptor);
        let guard = self.state.read().unwrap();

        let Some(file) = guard.open_files.get(&cache_path) else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "descriptor is not open",
            ));
        };

        read_at_offset(file, offset, size as usize)
    }

    /// Decrement the reference count for `descriptor`'s cache path; close
    /// and remove the handle once it reaches zero.
    pub fn close(&self, descriptor: &Descriptor) {
        let cache_path = self.cache_path(descriptor);
        let mut guard = self.state.write().unwrap();

        let Some(count) = guard.ref_counts.get_mut(&cache_path) else {
            return;
        };

        *count = count.saturating_sub(1);
        if *count == 0 {
            guard.ref_counts.remove(&cache_path);
            guard.open_files.remove(&cache_path);
        }
    }
}

#[cfg(unix)]
fn read_at_offset(file: &File, offset: u64, size: usize) -> std::io::Result<Vec<u8>> {
    use std::os::unix::fs::FileExt;
    let mut buf = vec![0u8; size];
    let n = file.read_at(&mut buf, offset)?;
    buf.truncate(n);
    Ok(buf)
}

#[cfg(not(unix))]
fn read_at_offset(file: &File, offset: u64, size: usize) -> std::io::Result<Vec<u8>> {
    use std::io::{Read, Seek, SeekFrom};
    let mut file = file.try_clone()?;
    file.seek(SeekFrom::Start(offset))?;
    let mut buf = vec![0u8; size];
    let n = file.read(&mut buf)?;
    buf.truncate(n);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reporter::NullReporter;

    fn build_loading(descriptor: Descriptor) -> LoadingIndex {
        let mut entries = IndexMap::new();
        let mut names = IndexMap::new();
        names.insert(descriptor.name.clone(), vec![descriptor.clone()]);
        entries.insert(descriptor.kind.clone(), names);

        LoadingIndex {
            entries,
            source: "test".to_owned(),
            loaded_at: chrono::Utc::now(),
        }
    }

    fn local_descriptor(dir: &std::path::Path, contents: &[u8]) -> Descriptor {
        let src = dir.join("terraform-provider-aws_v1.0.0");
        fs::write(&src, contents).unwrap();

        let digest = {
            use sha2::{Digest, Sha256};
            let mut hasher = Sha256::new();
            hasher.update(contents);
            hasher.finalize()
        };
        let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();

        Descriptor {
            kind: "provider".to_owned(),
            name: "aws".to_owned(),
            version: "v1.0.0".to_owned(),
            platform: "linux_amd64".to_owned(),
            size: contents.len() as u64,
            digest: format!("sha256:{hex}"),
            url: src.to_string_lossy().into_owned(),
        }
    }

    #[test]
    fn open_then_read_then_close() {
        let src_dir = tempfile::tempdir().unwrap();
        let cache_dir = tempfile::tempdir().unwrap();
        let descriptor = local_descriptor(src_dir.path(), b"plugin payload");
        let loading = build_loading(descriptor.clone());

        let cache = Cache::discover(Some(cache_dir.path().to_owned())).unwrap();
        let runtime = RuntimeIndex::build(
            &loading,
            "terraform",
            cache,
            chrono::Duration::hours(1),
            Arc::new(NullReporter),
        )
        .unwrap();

        assert_eq!(runtime.list_platforms(), vec!["linux_amd64".to_owned()]);
        assert_eq!(
            runtime.list_plugins("linux_amd64"),
            vec!["terraform-provider-aws_v1.0.0".to_owned()]
        );

        runtime.open(&descriptor).unwrap();
        let bytes = runtime.read_at(&descriptor, 0, 100).unwrap();
        assert_eq!(bytes, b"plugin payload");

        runtime.close(&descriptor);
    }

    #[test]
    fn read_past_eof_returns_empty() {
        let src_dir = tempfile::tempdir().unwrap();
        let cache_dir = tempfile::tempdir().unwrap();
        let descriptor = local_descriptor(src_dir.path(), b"short");
        let loading = build_loading(descriptor.clone());

        let cache = Cache::discover(Some(cache_dir.path().to_owned())).unwrap();
        let runtime = RuntimeIndex::build(
            &loading,
            "terraform",
            cache,
            chrono::Duration::hours(1),
            Arc::new(NullReporter),
        )
        .unwrap();

        runtime.open(&descriptor).unwrap();
        let bytes = runtime.read_at(&descriptor, 1000, 10).unwrap();
        assert!(bytes.is_empty());
    }

    #[test]
    fn concurrent_open_on_cold_cache_converges() {
        let src_dir = tempfile::tempdir().unwrap();
        let cache_dir = tempfile::tempdir().unwrap();
        let descriptor = local_descriptor(src_dir.path(), b"plugin payload");
        let loading = build_loading(descriptor.clone());

        let cache = Cache::discover(Some(cache_dir.path().to_owned())).unwrap();
        let runtime = Arc::new(
            RuntimeIndex::build(&loading, "terraform", cache, chrono::Duration::hours(1), Arc::new(NullReporter))
                .unwrap(),
        );

        // Two threads racing `open` on a cold cache path both succeed; the
        // write lock spanning the download means the second thread only ever
        // observes the first thread's already-verified file, never a partial
        // download racing its own.
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let runtime = Arc::clone(&runtime);
                let descriptor = descriptor.clone();
                std::thread::spawn(move || runtime.open(&descriptor))
            })
            .collect();

        for handle in handles {
            handle.join().unwrap().unwrap();
        }

        let bytes = runtime.read_at(&descriptor, 0, 100).unwrap();
        assert_eq!(bytes, b"plugin payload");

        runtime.close(&descriptor);
        runtime.close(&descriptor);
    }

    #[test]
    fn unknown_platform_yields_empty_list() {
        let src_dir = tempfile::tempdir().unwrap();
        let cache_dir = tempfile::tempdir().unwrap();
        let descriptor = local_descriptor(src_dir.path(), b"short");
        let loading = build_loading(descriptor);

        let cache = Cache::discover(Some(cache_dir.path().to_owned())).unwrap();
        let runtime = RuntimeIndex::build(
            &loading,
            "terraform",
            cache,
            chrono::Duration::hours(1),
            Arc::new(NullReporter),
        )
        .unwrap();

        assert!(runtime.list_plugins("darwin_arm64").is_empty());
    }

    #[test]
    fn size_mismatch_fails_open_and_removes_partial_file() {
        let src_dir = tempfile::tempdir().unwrap();
        let cache_dir = tempfile::tempdir().unwrap();
        let mut descriptor = local_descriptor(src_dir.path(), b"plugin payload");
        descriptor.size = descriptor.size + 1;
        let loading = build_loading(descriptor.clone());

        let cache = Cache::discover(Some(cache_dir.path().to_owned())).unwrap();
        let runtime = RuntimeIndex::build(
            &loading,
            "terraform",
            cache,
            chrono::Duration::hours(1),
            Arc::new(NullReporter),
        )
        .unwrap();

        assert!(runtime.open(&descriptor).is_err());
    }

    #[test]
    fn distinct_kinds_with_distinct_names_build_cleanly() {
        let src_dir = tempfile::tempdir().unwrap();
        let a = local_descriptor(src_dir.path(), b"x");
        let mut b = a.clone();
        b.kind = "provisioner".to_owned();

        let mut names_a = IndexMap::new();
        names_a.insert(a.name.clone(), vec![a.clone()]);
        let mut entries = IndexMap::new();
        entries.insert(a.kind.clone(), names_a);

        let mut names_b = IndexMap::new();
        names_b.insert(b.name.clone(), vec![b.clone()]);
        entries.insert(b.kind.clone(), names_b);

        let loading = LoadingIndex {
            entries,
            source: "test".to_owned(),
            loaded_at: chrono::Utc::now(),
        };

        let cache_dir = tempfile::tempdir().unwrap();
        let cache = Cache::discover(Some(cache_dir.path().to_owned())).unwrap();
        let runtime = RuntimeIndex::build(
            &loading,
            "terraform",
            cache,
            chrono::Duration::hours(1),
            Arc::new(NullReporter),
        )
        .unwrap();

        assert_eq!(runtime.list_plugins("linux_amd64").len(), 2);
    }

    #[test]
    fn fan_out_collision_is_rejected() {
        // Two distinct (kind, name) pairs whose "<kind>-<name>_<version>"
        // renderings happen to produce the identical string once the
        // hyphen placement differs: ("a", "b-c") and ("a-b", "c") both
        // yield "a-b-c_v1".
        let mut a = local_descriptor(&tempfile::tempdir().unwrap().keep(), b"x");
        a.kind = "a".to_owned();
        a.name = "b-c".to_owned();
        a.version = "v1".to_owned();

        let mut b = a.clone();
        b.kind = "a-b".to_owned();
        b.name = "c".to_owned();

        assert_eq!(
            a.filename("terraform"),
            b.filename("terraform"),
            "test setup must produce a genuine collision"
        );

        let mut names_a = IndexMap::new();
        names_a.insert(a.name.clone(), vec![a.clone()]);
        let mut entries = IndexMap::new();
        entries.insert(a.kind.clone(), names_a);

        let mut names_b = IndexMap::new();
        names_b.insert(b.name.clone(), vec![b.clone()]);
        entries.insert(b.kind.clone(), names_b);

        let loading = LoadingIndex {
            entries,
            source: "test".to_owned(),
            loaded_at: chrono::Utc::now(),
        };

        let cache_dir = tempfile::tempdir().unwrap();
        let cache = Cache::discover(Some(cache_dir.path().to_owned())).unwrap();
        let result = RuntimeIndex::build(
            &loading,
            "terraform",
            cache,
            chrono::Duration::hours(1),
            Arc::new(NullReporter),
        );

        assert!(matches!(result, Err(FilenameCollision { .. })));
    }
}
