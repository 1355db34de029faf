//! Store path components.

use std::fmt;
use std::path::Path;

use anyhow::Result;
use displaydoc::Display;
use lazy_static::lazy_static;
use regex::Regex;

/// Length of the hash part of a store path.
pub const STORE_PATH_HASH_LEN: usize = 32;

lazy_static! {
    /// Regex for a valid store path hash part.
    static ref STORE_PATH_HASH_REGEX: Regex = {
        Regex::new("^[0123456789abcdfghijklmnpqrsvwxyz]{32}$").unwrap()
    };

    /// Regex for a valid store base name (`<hash>-<name>`).
    ///
    /// The human-readable name may only contain `A-Za-z0-9` and
    /// `+-._?=`, per the Nix store path grammar.
    static ref STORE_BASE_NAME_REGEX: Regex = {
        Regex::new(r"^[0123456789abcdfghijklmnpqrsvwxyz]{32}-[A-Za-z0-9+\-._?=]+$").unwrap()
    };
}

#[derive(Debug, Display)]
pub enum Error {
    /// Invalid store path hash "{hash}": {reason}
    InvalidStorePathHash { hash: String, reason: &'static str },
}
impl std::error::Error for Error {}

/// The fixed-length hash part of a store path.
///
/// For `/nix/store/ia70ss13m22znbl8khrf2hq72qmh5drr-ruby-2.7.5` this is
/// `ia70ss13m22znbl8khrf2hq72qmh5drr`: exactly 32 characters drawn from
/// Nix's base-32 alphabet (`e`, `o`, `u`, `t` are banned). This is the
/// key under which clients and upstream caches address store objects.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct StorePathHash(String);

impl StorePathHash {
    /// Creates a store path hash from a string, validating it.
    pub fn new(hash: String) -> Result<Self> {
        if hash.len() != STORE_PATH_HASH_LEN {
            return Err(Error::InvalidStorePathHash {
                hash,
                reason: "Hash is of invalid length",
            }
            .into());
        }

        if !STORE_PATH_HASH_REGEX.is_match(&hash) {
            return Err(Error::InvalidStorePathHash {
                hash,
                reason: "Hash is of invalid format",
            }
            .into());
        }

        Ok(Self(hash))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StorePathHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Returns the base name (leaf) of a store path.
pub fn base_name(path: &Path) -> Option<&str> {
    path.file_name().and_then(|name| name.to_str())
}

/// Checks whether `name` has the `<hash>-<name>` shape of a store leaf.
pub fn is_base_name(name: &str) -> bool {
    STORE_BASE_NAME_REGEX.is_match(name)
}
