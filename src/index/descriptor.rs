//! The plugin descriptor: an immutable value object identifying one plugin
//! binary for one platform.

use crate::digest::DigestSpec;

/// A single plugin binary for a single platform, as parsed from a catalog or
/// extension file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    pub kind: String,
    pub name: String,
    pub version: String,
    pub platform: String,
    pub size: u64,
    pub digest: String,
    pub url: String,
}

impl Descriptor {
    /// The filename under which the host tool expects this plugin:
    /// `"<host-tool>-<kind>-<name>_<version>"`.
    pub fn filename(&self, host_tool: &str) -> String {
        format!("{host_tool}-{}-{}_{}", self.kind, self.name, self.version)
    }

    /// Parse this descriptor's `digest` field, failing before any I/O happens.
    pub fn digest_spec(&self) -> Result<DigestSpec, crate::error::DigestFormatError> {
        DigestSpec::parse(&self.digest)
    }
}
