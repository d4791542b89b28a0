//! Error types surfaced by the cache layer, the two index stages, the artifact
//! pipeline and the virtual filesystem.

use std::path::PathBuf;

use reqwest::StatusCode;

/// No writable cache directory could be found or created.
#[derive(thiserror::Error, miette::Diagnostic, Debug)]
#[error("could not find or create a writable cache directory")]
#[diagnostic(help(
    "pass an explicit cache path, or make sure your user cache directory or $TMPDIR is writable"
))]
pub struct CacheInitError {
    #[source]
    pub cause: std::io::Error,
}

/// Every candidate in the loading index's discovery list failed to resolve.
#[derive(thiserror::Error, miette::Diagnostic, Debug)]
#[error("none of the index candidates could be loaded")]
#[diagnostic(help("check that at least one --index path or URL is reachable"))]
pub struct IndexNotFoundError {
    pub candidates: Vec<String>,
}

/// The top-level index document did not parse as a mapping.
#[derive(thiserror::Error, miette::Diagnostic, Debug)]
#[error("index document at '{source}' is not a mapping")]
pub struct IndexParseError {
    pub source: String,
    #[source]
    pub cause: serde_yaml::Error,
}

/// An extension file's name did not match `<kind>.<name>.yaml`.
#[derive(thiserror::Error, Debug)]
#[error("extension file name '{0}' must be lowercase '<kind>.<name>.yaml'")]
pub struct ExtensionNameError(pub PathBuf);

/// A remote fetch failed and no usable cache entry was available to fall back to.
#[derive(thiserror::Error, Debug)]
pub enum RemoteFetchError {
    #[error("unexpected response status fetching '{url}': {status}")]
    UnexpectedStatus { url: String, status: StatusCode },
    #[error("transport error fetching '{url}': {cause}")]
    Transport {
        url: String,
        #[source]
        cause: reqwest::Error,
    },
    #[error("local path '{0}' could not be opened")]
    LocalIo(PathBuf, #[source] std::io::Error),
}

/// `digest` was not `<alg>:<hex>` with a known algorithm.
#[derive(thiserror::Error, Debug)]
pub enum DigestFormatError {
    #[error("digest '{0}' is missing the '<alg>:' prefix")]
    MissingAlgorithm(String),
    #[error("unknown digest algorithm '{0}', expected one of md5, sha1, sha256, sha512")]
    UnknownAlgorithm(String),
    #[error("digest '{0}' has invalid hex encoding")]
    InvalidHex(String),
}

/// Verified content disagreed with the descriptor's digest.
#[derive(thiserror::Error, Debug)]
#[error("digest mismatch: expected {expected}, computed {computed}")]
pub struct DigestMismatch {
    pub expected: String,
    pub computed: String,
}

/// Verified post-download size disagreed with the descriptor's declared size.
#[derive(thiserror::Error, Debug)]
#[error("size mismatch: expected {expected} bytes, got {actual} bytes")]
pub struct SizeMismatch {
    pub expected: u64,
    pub actual: u64,
}

/// Archive open/walk failed, or no entry matched `extract_pattern`.
#[derive(thiserror::Error, Debug)]
pub enum ArchiveError {
    #[error("unrecognized archive extension on '{0}'")]
    UnknownFormat(PathBuf),
    #[error("failed to open archive '{0}': {1}")]
    Open(PathBuf, #[source] std::io::Error),
    #[error("no archive entry matched pattern '{0}'")]
    NoMatch(String),
    #[error("invalid glob pattern '{0}': {1}")]
    BadPattern(String, #[source] glob::PatternError),
}

/// Union of failures the artifact pipeline's `open()` can raise.
#[derive(thiserror::Error, Debug)]
pub enum ArtifactError {
    #[error(transparent)]
    Fetch(#[from] RemoteFetchError),
    #[error(transparent)]
    DigestFormat(#[from] DigestFormatError),
    #[error(transparent)]
    DigestMismatch(#[from] DigestMismatch),
    #[error(transparent)]
    Archive(#[from] ArchiveError),
}

/// Union of failures `RuntimeIndex::open` can raise for a single descriptor.
#[derive(thiserror::Error, Debug)]
pub enum OpenError {
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
    #[error(transparent)]
    SizeMismatch(#[from] SizeMismatch),
    #[error("failed to open cache path '{0}': {1}")]
    CacheIo(PathBuf, #[source] std::io::Error),
}

/// A filesystem lookup referenced a name the runtime index does not have.
#[derive(thiserror::Error, Debug)]
#[error("not found")]
pub struct NotFound;

/// Two descriptors from different `(kind, name)` pairs fan out to the same
/// `(platform, filename)`. See the Open Question on fan-out collisions.
#[derive(thiserror::Error, Debug)]
#[error("filename collision on platform '{platform}': '{filename}' is produced by both {first} and {second}")]
pub struct FilenameCollision {
    pub platform: String,
    pub filename: String,
    pub first: String,
    pub second: String,
}

/// Top-level error for the outer CLI/process shell, the only place an error
/// is converted into a [`miette::Report`] for display.
#[derive(thiserror::Error, miette::Diagnostic, Debug)]
pub enum ShellError {
    #[error("no plugin mount point found")]
    #[diagnostic(help(
        "create '<host-tool>.d/plugins' in the current directory or in your home directory"
    ))]
    NoMountPoint,

    #[error("mount point '{0}' exists but is not a directory")]
    NotADirectory(PathBuf),

    #[error("a lazyplug instance is already mounted here (pid {0})")]
    #[diagnostic(help("stop the other instance, or pass --unmount to clean up a stale mount"))]
    Busy(i32),

    #[error(transparent)]
    #[diagnostic(transparent)]
    CacheInit(#[from] CacheInitError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    IndexNotFound(#[from] IndexNotFoundError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    IndexParse(#[from] IndexParseError),

    #[error(transparent)]
    FilenameCollision(#[from] FilenameCollision),

    #[error("failed to mount the virtual filesystem at '{0}'")]
    Mount(PathBuf, #[source] std::io::Error),

    #[error("failed to unmount '{0}'")]
    Unmount(PathBuf, #[source] std::io::Error),

    #[error("failed to spawn sub-process '{0}'")]
    Spawn(String, #[source] std::io::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
