//! Parsing and verification of `<alg>:<hex>` digests.

use std::io::Read;

use md5::Md5;
use sha1::Sha1;
use sha2::{Digest as _, Sha256, Sha512};

use crate::error::DigestFormatError;

fn to_hex(bytes: &[u8]) -> String {
    use std::fmt::Write as _;
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        write!(s, "{b:02x}").unwrap();
    }
    s
}

/// A parsed `<alg>:<hex>` digest spec, as found on a plugin descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestSpec {
    pub algorithm: Algorithm,
    pub hex: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    Md5,
    Sha1,
    Sha256,
    Sha512,
}

impl DigestSpec {
    /// Parse a digest of the form `<alg>:<hex>`. Fails before any I/O happens.
    pub fn parse(raw: &str) -> Result<Self, DigestFormatError> {
        let Some((alg, hex)) = raw.split_once(':') else {
            return Err(DigestFormatError::MissingAlgorithm(raw.to_owned()));
        };

        let algorithm = match alg {
            "md5" => Algorithm::Md5,
            "sha1" => Algorithm::Sha1,
            "sha256" => Algorithm::Sha256,
            "sha512" => Algorithm::Sha512,
            other => return Err(DigestFormatError::UnknownAlgorithm(other.to_owned())),
        };

        if hex.is_empty() || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(DigestFormatError::InvalidHex(raw.to_owned()));
        }

        Ok(Self {
            algorithm,
            hex: hex.to_ascii_lowercase(),
        })
    }

    /// Render this spec back to its `<alg>:<hex>` form, e.g. for error messages.
    pub fn as_descriptor_string(&self) -> String {
        let alg = match self.algorithm {
            Algorithm::Md5 => "md5",
            Algorithm::Sha1 => "sha1",
            Algorithm::Sha256 => "sha256",
            Algorithm::Sha512 => "sha512",
        };
        format!("{alg}:{}", self.hex)
    }

    /// Stream `reader` once and compute its digest under this spec's algorithm.
    pub fn compute(&self, mut reader: impl Read) -> std::io::Result<String> {
        let mut buf = [0u8; 64 * 1024];

        macro_rules! hash_with {
            ($hasher:expr) => {{
                let mut hasher = $hasher;
                loop {
                    let n = reader.read(&mut buf)?;
                    if n == 0 {
                        break;
                    }
                    hasher.update(&buf[..n]);
                }
                to_hex(&hasher.finalize())
            }};
        }

        let computed = match self.algorithm {
            Algorithm::Md5 => hash_with!(Md5::new()),
            Algorithm::Sha1 => hash_with!(Sha1::new()),
            Algorithm::Sha256 => hash_with!(Sha256::new()),
            Algorithm::Sha512 => hash_with!(Sha512::new()),
        };

        Ok(computed)
    }

    /// Compute the digest of `reader` and compare it against this spec's hex value.
    pub fn verify(&self, reader: impl Read) -> std::io::Result<bool> {
        let computed = self.compute(reader)?;
        Ok(computed == self.hex)
    }
}

/// sha256 hex digest of a URL, used as a cache key for index and plugin artifacts.
pub fn url_cache_key(url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    to_hex(&hasher.finalize())
}
