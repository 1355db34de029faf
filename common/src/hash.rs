//! Content hashes.
//!
//! Nix tooling renders the same SHA-256 digest in several ways: typed
//! base-32 (`sha256:11vwvg...`, the wire form in narinfos), typed
//! base-16, typed base-64, and SRI (`sha256-9aLahM...`, what newer
//! `nix path-info` emits). All of them are accepted on input; output is
//! always typed base-32.

use anyhow::Result;
use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine};
use displaydoc::Display;

use crate::nix_base32;

/// Digest length of SHA-256 in bytes.
pub const SHA256_BYTES: usize = 32;

/// Length of a SHA-256 digest rendered in Nix base-32.
pub const SHA256_BASE32_LEN: usize = 52;

#[derive(Debug, Display)]
pub enum Error {
    /// Hash algorithm of "{0}" is not supported.
    UnsupportedAlgorithm(String),
    /// Invalid SHA-256 digest "{0}".
    InvalidDigest(String),
}
impl std::error::Error for Error {}

/// A content hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Hash {
    Sha256([u8; SHA256_BYTES]),
}

impl Hash {
    /// Parses a hash from any of the renderings Nix tooling produces.
    pub fn parse(s: &str) -> Result<Self> {
        let digest = if let Some(rest) = s.strip_prefix("sha256:") {
            rest
        } else if let Some(rest) = s.strip_prefix("sha256-") {
            rest
        } else {
            return Err(Error::UnsupportedAlgorithm(s.to_string()).into());
        };

        let len = digest.len();
        let bytes = if len == SHA256_BASE32_LEN {
            nix_base32::decode(digest)
        } else if len == 2 * SHA256_BYTES {
            hex::decode(digest).ok()
        } else {
            BASE64_STANDARD.decode(digest).ok()
        };

        bytes
            .and_then(|b| <[u8; SHA256_BYTES]>::try_from(b).ok())
            .map(Self::Sha256)
            .ok_or_else(|| Error::InvalidDigest(s.to_string()).into())
    }

    /// Renders the digest in Nix base-32, without the type prefix.
    pub fn to_base32(&self) -> String {
        let Self::Sha256(digest) = self;
        nix_base32::encode(digest)
    }

    /// Renders the hash in the `sha256:<base32>` wire form.
    pub fn to_typed_base32(&self) -> String {
        format!("sha256:{}", self.to_base32())
    }
}
