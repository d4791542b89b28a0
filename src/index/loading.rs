//! The loading index: a loading-time aggregate parsed from a primary catalog
//! plus extension overrides.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::Deserialize;

use crate::artifact::DownloadableFile;
use crate::cache::Cache;
use crate::error::{ExtensionNameError, IndexNotFoundError, IndexParseError};
use crate::index::descriptor::Descriptor;

/// `kind -> name -> descriptors` plus provenance.
#[derive(Debug, Clone)]
pub struct LoadingIndex {
    pub entries: IndexMap<String, IndexMap<String, Vec<Descriptor>>>,
    pub source: String,
    pub loaded_at: DateTime<Utc>,
}

/// The two structurally distinct shapes a catalog's `versions` value can take:
/// an inline `version -> platform -> spec` map, or a URL string pointing at one.
/// Platform specs are kept as raw `Value`s here and deserialized individually
/// in [`resolve_versions`], so one malformed platform entry doesn't take its
/// siblings down with it.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum VersionsSpec {
    Inline(IndexMap<String, IndexMap<String, serde_yaml::Value>>),
    Remote(String),
}

#[derive(Debug, Deserialize)]
struct RawSpec {
    url: String,
    #[serde(deserialize_with = "deserialize_tolerant_size")]
    size: u64,
    digest: String,
}

fn deserialize_tolerant_size<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum SizeRepr {
        Number(u64),
        Text(String),
    }

    match SizeRepr::deserialize(deserializer)? {
        SizeRepr::Number(n) => Ok(n),
        SizeRepr::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

impl LoadingIndex {
    /// Try each candidate location in order (local path or URL, fetched
    /// through the cached pipeline when remote); return the first that
    /// resolves to a parseable document.
    pub fn discover(
        candidates: &[String],
        cache: &Cache,
        refresh: chrono::Duration,
    ) -> Result<Self, IndexNotFoundError> {
        for candidate in candidates {
            if let Ok(index) = Self::load_one(candidate, cache, refresh) {
                return Ok(index);
            }
        }

        Err(IndexNotFoundError {
            candidates: candidates.to_vec(),
        })
    }

    fn load_one(
        source: &str,
        cache: &Cache,
        refresh: chrono::Duration,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let fetchable = DownloadableFile {
            url: source.to_owned(),
            digest: None,
            extract_pattern: None,
        };

        let (bytes, loaded_at) = if source.starts_with("http://") || source.starts_with("https://") {
            fetchable.read_all_with_cache(cache, refresh)?
        } else {
            (fetchable.read_all()?, Utc::now())
        };

        let text = String::from_utf8(bytes)?;
        let entries = parse_catalog_body(&text, source, cache, refresh)?;

        Ok(Self {
            entries,
            source: source.to_owned(),
            loaded_at,
        })
    }

    /// Apply extension files over this loading index, wholesale replacing the
    /// descriptor list for each `(kind, name)` they name. Directories are
    /// processed in the order given; a later directory's entry for the same
    /// `(kind, name)` wins, matching the "last argument wins among
    /// directories" contract (within one directory, file iteration order is
    /// unspecified and the last one encountered wins).
    pub fn apply_extensions(&mut self, dirs: &[PathBuf], cache: &Cache, refresh: chrono::Duration) {
        for dir in dirs {
            let Ok(read_dir) = fs::read_dir(dir) else {
                log::warn!("extension directory '{}' could not be read", dir.display());
                continue;
            };

            for entry in read_dir.flatten() {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("yaml") {
                    continue;
                }

                match parse_extension_file(&path, cache, refresh) {
                    Ok((kind, name, descriptors)) => {
                        self.entries.entry(kind).or_default().insert(name, descriptors);
                    }
                    Err(e) => log::warn!("skipping extension '{}': {e}", path.display()),
                }
            }
        }
    }
}

/// Parse a single extension file named `<kind>.<name>.yaml` (lowercase).
fn parse_extension_file(
    path: &Path,
    cache: &Cache,
    refresh: chrono::Duration,
) -> Result<(String, String, Vec<Descriptor>), Box<dyn std::error::Error>> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| ExtensionNameError(path.to_owned()))?;

    if file_name.to_ascii_lowercase() != file_name {
        return Err(ExtensionNameError(path.to_owned()).into());
    }

    let mut parts = file_name.split('.');
    let (Some(kind), Some(name), Some(ext), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(ExtensionNameError(path.to_owned()).into());
    };

    if ext != "yaml" || kind.is_empty() || name.is_empty() {
        return Err(ExtensionNameError(path.to_owned()).into());
    }

    let contents = fs::read_to_string(path)?;
    if contents.trim().is_empty() {
        return Ok((kind.to_owned(), name.to_owned(), Vec::new()));
    }

    let versions: VersionsSpec = serde_yaml::from_str(&contents)?;
    let descriptors = resolve_versions(kind, name, versions, cache, refresh)?;

    Ok((kind.to_owned(), name.to_owned(), descriptors))
}

/// Parse the top-level catalog document: `kind -> name -> versions`.
fn parse_catalog_body(
    text: &str,
    source: &str,
    cache: &Cache,
    refresh: chrono::Duration,
) -> Result<IndexMap<String, IndexMap<String, Vec<Descriptor>>>, IndexParseError> {
    let document: serde_yaml::Value = serde_yaml::from_str(text).map_err(|cause| IndexParseError {
        source: source.to_owned(),
        cause,
    })?;

    let serde_yaml::Value::Mapping(kinds) = document else {
        return Err(IndexParseError {
            source: source.to_owned(),
            cause: serde::de::Error::custom("top-level document is not a mapping"),
        });
    };

    let mut entries = IndexMap::new();

    for (kind_key, names_value) in kinds {
        let Some(kind) = kind_key.as_str() else {
            continue;
        };

        let names_map = match names_value {
            serde_yaml::Value::Mapping(m) => m,
            _ => {
                entries.insert(kind.to_owned(), IndexMap::new());
                continue;
            }
        };

        let mut names = IndexMap::new();

        for (name_key, versions_value) in names_map {
            let Some(name) = name_key.as_str() else {
                continue;
            };

            let versions: VersionsSpec = match serde_yaml::from_value(versions_value) {
                Ok(v) => v,
                Err(e) => {
                    log::trace!("'{kind}/{name}' has no usable version entries: {e}");
                    names.insert(name.to_owned(), Vec::new());
                    continue;
                }
            };

            let descriptors = match resolve_versions(kind, name, versions, cache, refresh) {
                Ok(descriptors) => descriptors,
                Err(e) => {
                    log::trace!("'{kind}/{name}' versions document could not be resolved: {e}");
                    Vec::new()
                }
            };
            names.insert(name.to_owned(), descriptors);
        }

        entries.insert(kind.to_owned(), names);
    }

    Ok(entries)
}

/// Resolve a `VersionsSpec` (inline or by URL) into the concrete descriptors
/// for one `(kind, name)` pair. Each `version/platform` entry is deserialized
/// on its own; an entry missing `url`/`size`/`digest` (or otherwise malformed)
/// is traced and dropped, leaving its sibling versions and platforms intact.
/// A remote `versions` document that cannot be fetched or does not parse as a
/// `version -> platform -> spec` mapping at all yields no descriptors for this
/// pair, but the pair itself is still recorded by the caller.
fn resolve_versions(
    kind: &str,
    name: &str,
    versions: VersionsSpec,
    cache: &Cache,
    refresh: chrono::Duration,
) -> Result<Vec<Descriptor>, Box<dyn std::error::Error>> {
    let inline = match versions {
        VersionsSpec::Inline(map) => map,
        VersionsSpec::Remote(url) => {
            let fetchable = DownloadableFile {
                url: url.clone(),
                digest: None,
                extract_pattern: None,
            };
            let (bytes, _mtime) = fetchable.read_all_with_cache(cache, refresh)?;
            let text = String::from_utf8(bytes)?;
            serde_yaml::from_str(&text)?
        }
    };

    let mut descriptors = Vec::new();

    for (version, platforms) in inline {
        for (platform, spec_value) in platforms {
            let spec: RawSpec = match serde_yaml::from_value(spec_value) {
                Ok(spec) => spec,
                Err(e) => {
                    log::trace!("dropping '{kind}/{name}' {version}/{platform}: {e}");
                    continue;
                }
            };

            descriptors.push(Descriptor {
                kind: kind.to_owned(),
                name: name.to_owned(),
                version: version.clone(),
                platform,
                size: spec.size,
                digest: spec.digest,
                url: spec.url,
            });
        }
    }

    Ok(descriptors)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cache() -> (tempfile::TempDir, Cache) {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::discover(Some(dir.path().join("cache"))).unwrap();
        (dir, cache)
    }

    #[test]
    fn parses_inline_catalog() {
        let (_dir, cache) = test_cache();
        let yaml = r#"
provider:
  aws:
    v1.0.0:
      linux_amd64:
        url: https://example.com/aws.zip
        size: 42
        digest: sha256:deadbeef
"#;
        let entries = parse_catalog_body(yaml, "test", &cache, chrono::Duration::hours(1)).unwrap();
        let descriptors = &entries["provider"]["aws"];
        assert_eq!(descriptors.len(), 1);
        assert_eq!(descriptors[0].platform, "linux_amd64");
        assert_eq!(descriptors[0].size, 42);
    }

    #[test]
    fn tolerates_string_size() {
        let (_dir, cache) = test_cache();
        let yaml = r#"
provider:
  aws:
    v1.0.0:
      linux_amd64:
        url: https://example.com/aws.zip
        size: "42"
        digest: sha256:deadbeef
"#;
        let entries = parse_catalog_body(yaml, "test", &cache, chrono::Duration::hours(1)).unwrap();
        assert_eq!(entries["provider"]["aws"][0].size, 42);
    }

    #[test]
    fn drops_entry_missing_required_key() {
        let (_dir, cache) = test_cache();
        let yaml = r#"
provider:
  aws:
    v1.0.0:
      linux_amd64:
        url: https://example.com/aws.zip
        digest: sha256:deadbeef
"#;
        let entries = parse_catalog_body(yaml, "test", &cache, chrono::Duration::hours(1)).unwrap();
        assert!(entries["provider"]["aws"].is_empty());
    }

    #[test]
    fn malformed_platform_does_not_drop_sibling_entries() {
        let (_dir, cache) = test_cache();
        let yaml = r#"
provider:
  aws:
    v1.0.0:
      linux_amd64:
        url: https://example.com/aws-linux.zip
        size: 42
        digest: sha256:deadbeef
      darwin_arm64:
        url: https://example.com/aws-darwin.zip
        digest: sha256:deadbeef
    v2.0.0:
      linux_amd64:
        url: https://example.com/aws-v2.zip
        size: 7
        digest: sha256:c0ffee
"#;
        let entries = parse_catalog_body(yaml, "test", &cache, chrono::Duration::hours(1)).unwrap();
        let descriptors = &entries["provider"]["aws"];
        // darwin_arm64 under v1.0.0 is missing `size` and is dropped, but its
        // sibling platform and the whole of v2.0.0 survive.
        assert_eq!(descriptors.len(), 2);
        assert!(descriptors.iter().any(|d| d.version == "v1.0.0" && d.platform == "linux_amd64"));
        assert!(descriptors.iter().any(|d| d.version == "v2.0.0" && d.platform == "linux_amd64"));
        assert!(!descriptors.iter().any(|d| d.platform == "darwin_arm64"));
    }

    #[test]
    fn non_mapping_kind_is_empty_list() {
        let (_dir, cache) = test_cache();
        let yaml = r#"
provider: "not a map"
"#;
        let entries = parse_catalog_body(yaml, "test", &cache, chrono::Duration::hours(1)).unwrap();
        assert!(entries["provider"].is_empty());
    }

    #[test]
    fn non_mapping_document_is_parse_error() {
        let (_dir, cache) = test_cache();
        let err = parse_catalog_body("- just\n- a\n- list\n", "test", &cache, chrono::Duration::hours(1));
        assert!(err.is_err());
    }

    #[test]
    fn extension_name_must_be_lowercase() {
        let dir = tempfile::tempdir().unwrap();
        let (_cache_dir, cache) = test_cache();
        let path = dir.path().join("Provider.aws.yaml");
        fs::write(&path, "").unwrap();
        assert!(parse_extension_file(&path, &cache, chrono::Duration::hours(1)).is_err());
    }

    #[test]
    fn empty_extension_file_wipes_entry() {
        let dir = tempfile::tempdir().unwrap();
        let (_cache_dir, cache) = test_cache();
        let path = dir.path().join("provider.aws.yaml");
        fs::write(&path, "").unwrap();
        let (kind, name, descriptors) =
            parse_extension_file(&path, &cache, chrono::Duration::hours(1)).unwrap();
        assert_eq!(kind, "provider");
        assert_eq!(name, "aws");
        assert!(descriptors.is_empty());
    }

    #[test]
    fn later_directory_wins_on_same_pair() {
        let first_dir = tempfile::tempdir().unwrap();
        let second_dir = tempfile::tempdir().unwrap();
        let (_cache_dir, cache) = test_cache();

        fs::write(
            first_dir.path().join("provider.foo.yaml"),
            "v1:\n  linux_amd64:\n    url: https://example.com/v1.zip\n    size: 1\n    digest: sha256:aa\n",
        )
        .unwrap();
        fs::write(
            second_dir.path().join("provider.foo.yaml"),
            "v2:\n  linux_amd64:\n    url: https://example.com/v2.zip\n    size: 2\n    digest: sha256:bb\n",
        )
        .unwrap();

        let mut index = LoadingIndex {
            entries: IndexMap::new(),
            source: "test".to_owned(),
            loaded_at: Utc::now(),
        };
        index.apply_extensions(
            &[first_dir.path().to_owned(), second_dir.path().to_owned()],
            &cache,
            chrono::Duration::hours(1),
        );

        let descriptors = &index.entries["provider"]["foo"];
        assert_eq!(descriptors.len(), 1);
        assert_eq!(descriptors[0].version, "v2");
    }
}
