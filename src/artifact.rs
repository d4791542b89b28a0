//! Fetch a URL (local or HTTP[S]), verify its digest, optionally extract a
//! single archive entry, and expose the result as a readable file.

use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::archive;
use crate::cache::Cache;
use crate::digest::DigestSpec;
use crate::error::{ArtifactError, DigestMismatch, RemoteFetchError};
use crate::util::expand_tilde;

/// A file to be fetched, optionally verified and optionally narrowed to a
/// single archive entry.
#[derive(Debug, Clone)]
pub struct DownloadableFile {
    pub url: String,
    pub digest: Option<DigestSpec>,
    pub extract_pattern: Option<String>,
}

/// A temp file that deletes itself when dropped. Mirrors the source's
/// volatile-temp-file convention: best-effort cleanup, never panics if the
/// file is already gone.
pub struct VolatileTempFile {
    path: PathBuf,
    file: File,
}

impl VolatileTempFile {
    fn create(basename: &str) -> io::Result<Self> {
        let named = tempfile::Builder::new()
            .prefix("para.raw.")
            .suffix(&format!(".{basename}"))
            .tempfile()?;
        let (file, path) = named.keep().map_err(|e| e.error)?;
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn rewind(&mut self) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(0)).map(|_| ())
    }
}

impl Read for VolatileTempFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl Drop for VolatileTempFile {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn basename_of(url: &str) -> String {
    url.rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or("artifact")
        .to_owned()
}

impl DownloadableFile {
    /// Open the artifact: fetch, verify digest, extract an archive entry if
    /// requested, and return a readable, self-deleting temp file positioned
    /// at the start.
    pub fn open(&self) -> Result<VolatileTempFile, ArtifactError> {
        let basename = basename_of(&self.url);
        let mut raw = VolatileTempFile::create(&basename)
            .map_err(|e| RemoteFetchError::LocalIo(self.url.clone().into(), e))?;

        self.fetch_into(&mut raw)?;
        raw.rewind()
            .map_err(|e| RemoteFetchError::LocalIo(raw.path.clone(), e))?;

        if let Some(digest) = &self.digest {
            let matches = digest
                .verify(&mut raw)
                .map_err(|e| RemoteFetchError::LocalIo(raw.path.clone(), e))?;
            raw.rewind()
                .map_err(|e| RemoteFetchError::LocalIo(raw.path.clone(), e))?;

            if !matches {
                let computed = digest
                    .compute(&mut raw)
                    .unwrap_or_else(|_| "<unreadable>".to_owned());
                return Err(DigestMismatch {
                    expected: digest.as_descriptor_string(),
                    computed,
                }
                .into());
            }
        }

        if let Some(pattern) = &self.extract_pattern {
            if archive::is_supported(Path::new(&basename)) {
                let mut extracted = VolatileTempFile::create(&basename)
                    .map_err(|e| RemoteFetchError::LocalIo(self.url.clone().into(), e))?;

                archive::extract_matching(raw.path(), pattern, &mut extracted)?;

                extracted
                    .rewind()
                    .map_err(|e| RemoteFetchError::LocalIo(extracted.path.clone(), e))?;
                return Ok(extracted);
            }
        }

        Ok(raw)
    }

    /// Fetch this file's bytes into `dest`, local or remote.
    fn fetch_into(&self, dest: &mut impl Write) -> Result<(), RemoteFetchError> {
        if self.url.starts_with("http://") || self.url.starts_with("https://") {
            let response =
                reqwest::blocking::get(&self.url).map_err(|cause| RemoteFetchError::Transport {
                    url: self.url.clone(),
                    cause,
                })?;

            let status = response.status();
            if !status.is_success() {
                return Err(RemoteFetchError::UnexpectedStatus {
                    url: self.url.clone(),
                    status,
                });
            }

            let bytes = response.bytes().map_err(|cause| RemoteFetchError::Transport {
                url: self.url.clone(),
                cause,
            })?;

            dest.write_all(&bytes)
                .map_err(|e| RemoteFetchError::LocalIo(PathBuf::from(&self.url), e))?;
        } else {
            let raw_path = self.url.strip_prefix("file://").unwrap_or(&self.url);
            let local_path = expand_tilde(raw_path);

            let mut source =
                File::open(&local_path).map_err(|e| RemoteFetchError::LocalIo(local_path.clone(), e))?;
            io::copy(&mut source, dest).map_err(|e| RemoteFetchError::LocalIo(local_path.clone(), e))?;
        }

        Ok(())
    }

    /// Open, then copy to `path` (creating parent directories with mode
    /// `0755`), truncating if present. Final mode is `0755`.
    pub fn save_to(&self, path: &Path) -> Result<(), ArtifactError> {
        let mut opened = self.open()?;

        if let Some(parent) = path.parent() {
            create_dir_mode(parent, 0o755)
                .map_err(|e| RemoteFetchError::LocalIo(parent.to_owned(), e))?;
        }

        let mut out =
            File::create(path).map_err(|e| RemoteFetchError::LocalIo(path.to_owned(), e))?;
        io::copy(&mut opened, &mut out).map_err(|e| RemoteFetchError::LocalIo(path.to_owned(), e))?;

        set_mode(path, 0o755).map_err(|e| RemoteFetchError::LocalIo(path.to_owned(), e))?;

        Ok(())
    }

    /// Read the opened stream to completion.
    pub fn read_all(&self) -> Result<Vec<u8>, ArtifactError> {
        let mut opened = self.open()?;
        let mut buf = Vec::new();
        let path = opened.path.clone();
        opened
            .read_to_end(&mut buf)
            .map_err(|e| RemoteFetchError::LocalIo(path, e))?;
        Ok(buf)
    }

    /// Cached variant of [`DownloadableFile::read_all`], applicable only to remote URLs.
    ///
    /// - Fresh cache: return cached bytes and mtime.
    /// - Stale or absent cache: fetch; on success, cache (best-effort) and return fresh bytes with `now`.
    /// - Fetch failure with a readable cache: return the stale cache (graceful degradation).
    /// - Fetch failure without a cache: propagate the fetch error.
    pub fn read_all_with_cache(
        &self,
        cache: &Cache,
        refresh: chrono::Duration,
    ) -> Result<(Vec<u8>, DateTime<Utc>), ArtifactError> {
        let cache_path = cache.index_path(&self.url);
        let now = Utc::now();

        if cache.is_fresh(&cache_path, refresh, now) {
            if let Ok(Some((bytes, mtime))) = cache.read(&cache_path) {
                return Ok((bytes, mtime));
            }
        }

        match self.read_all() {
            Ok(bytes) => {
                cache.write_best_effort(&cache_path, &bytes);
                Ok((bytes, now))
            }
            Err(fetch_err) => match cache.read(&cache_path) {
                Ok(Some((bytes, mtime))) => Ok((bytes, mtime)),
                _ => Err(fetch_err),
            },
        }
    }
}

#[cfg(unix)]
fn create_dir_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::create_dir_all(path)?;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn create_dir_mode(path: &Path, _mode: u32) -> io::Result<()> {
    fs::create_dir_all(path)
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}
