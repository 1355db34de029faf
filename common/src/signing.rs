//! Narinfo signing.
//!
//! Nix caches sign the *fingerprint* of a store object — a canonical
//! string over the store path, NAR hash, NAR size and references — with
//! an Ed25519 key. Keys and signatures share one textual format:
//!
//! ```text
//! {keyName}:{base64Payload}
//! ```
//!
//! Keys generated with `nix-store --generate-binary-cache-key` load
//! unchanged.

use std::path::{Path, PathBuf};

use anyhow::Result;
use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, DecodeError, Engine};
use displaydoc::Display;

use crate::hash::Hash;

/// An ed25519 keypair for signing.
#[derive(Debug, Clone)]
pub struct Keypair {
    /// Name of this key.
    name: String,

    /// The keypair.
    keypair: ed25519_compact::KeyPair,
}

/// An ed25519 public key for verification.
#[derive(Debug, Clone)]
pub struct PublicKey {
    /// Name of this key.
    name: String,

    /// The public key.
    public: ed25519_compact::PublicKey,
}

/// A signing error.
#[derive(Debug, Display)]
pub enum Error {
    /// Signature error: {0}
    SignatureError(ed25519_compact::Error),

    /// Wrong key name: expected "{our_name}", got "{string_name}"
    WrongKeyName {
        our_name: String,
        string_name: String,
    },

    /// The string lacks a colon separator.
    NoColonSeparator,

    /// Invalid signing key name "{0}".
    InvalidSigningKeyName(String),

    /// Base64 decode error: {0}
    Base64DecodeError(DecodeError),

    /// Invalid base64 payload length: expected {expected} ({usage}), got {actual}
    InvalidPayloadLength {
        expected: usize,
        actual: usize,
        usage: &'static str,
    },
}
impl std::error::Error for Error {}

impl Keypair {
    /// Generates a new keypair.
    pub fn generate(name: &str) -> Result<Self> {
        validate_name(name)?;

        Ok(Self {
            name: name.to_string(),
            keypair: ed25519_compact::KeyPair::generate(),
        })
    }

    /// Imports a keypair from its canonical representation.
    pub fn from_str(keypair: &str) -> Result<Self> {
        let (name, bytes) =
            decode_string(keypair, "keypair", ed25519_compact::KeyPair::BYTES, None)?;

        let keypair = ed25519_compact::KeyPair::from_slice(&bytes).map_err(Error::SignatureError)?;

        Ok(Self {
            name: name.to_string(),
            keypair,
        })
    }

    /// Returns the canonical representation of the keypair.
    ///
    /// The 64-byte base64 payload holds the private key followed by the
    /// public key.
    pub fn export_keypair(&self) -> String {
        format!("{}:{}", self.name, BASE64_STANDARD.encode(*self.keypair))
    }

    /// Returns the canonical representation of the public key.
    pub fn export_public_key(&self) -> String {
        format!("{}:{}", self.name, BASE64_STANDARD.encode(*self.keypair.pk))
    }

    /// Returns the public key portion of the keypair.
    pub fn to_public_key(&self) -> PublicKey {
        PublicKey {
            name: self.name.clone(),
            public: self.keypair.pk,
        }
    }

    /// Signs a message, returning the canonical `{name}:{base64}` form.
    pub fn sign(&self, message: &[u8]) -> String {
        let bytes = self.keypair.sk.sign(message, None);
        format!("{}:{}", self.name, BASE64_STANDARD.encode(bytes))
    }

    /// Verifies a message signed by this keypair.
    pub fn verify(&self, message: &[u8], signature: &str) -> Result<()> {
        self.to_public_key().verify(message, signature)
    }
}

impl PublicKey {
    /// Imports a public key from its canonical representation.
    pub fn from_str(public_key: &str) -> Result<Self> {
        let (name, bytes) = decode_string(
            public_key,
            "public key",
            ed25519_compact::PublicKey::BYTES,
            None,
        )?;

        let public =
            ed25519_compact::PublicKey::from_slice(&bytes).map_err(Error::SignatureError)?;

        Ok(Self {
            name: name.to_string(),
            public,
        })
    }

    /// Returns the canonical representation of the public key.
    pub fn export(&self) -> String {
        format!("{}:{}", self.name, BASE64_STANDARD.encode(*self.public))
    }

    /// Verifies a message.
    pub fn verify(&self, message: &[u8], signature: &str) -> Result<()> {
        let (_, bytes) = decode_string(
            signature,
            "signature",
            ed25519_compact::Signature::BYTES,
            Some(&self.name),
        )?;

        let bytes: [u8; ed25519_compact::Signature::BYTES] =
            bytes.try_into().expect("length checked by decode_string");
        let signature = ed25519_compact::Signature::new(bytes);

        self.public
            .verify(message, &signature)
            .map_err(|e| Error::SignatureError(e).into())
    }
}

/// Computes the fingerprint of a store object.
///
/// This is the exact byte string cache signatures are made over:
/// version, store path, typed base-32 NAR hash, NAR size, and the
/// references as absolute store paths joined with commas.
pub fn fingerprint(
    store_path: &Path,
    nar_hash: &Hash,
    nar_size: u64,
    references: &[PathBuf],
) -> String {
    format!(
        "1;{};{};{};{}",
        store_path.display(),
        nar_hash.to_typed_base32(),
        nar_size,
        references
            .iter()
            .map(|r| r.display().to_string())
            .collect::<Vec<_>>()
            .join(","),
    )
}

/// Validates the name/label of a signing key.
///
/// A valid name is non-empty and contains no colons.
fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains(':') {
        Err(Error::InvalidSigningKeyName(name.to_string()).into())
    } else {
        Ok(())
    }
}

/// Decodes a colon-delimited string containing a key name and a base64 payload.
fn decode_string<'s>(
    s: &'s str,
    usage: &'static str,
    expected_payload_length: usize,
    expected_name: Option<&str>,
) -> Result<(&'s str, Vec<u8>)> {
    let colon = s.find(':').ok_or(Error::NoColonSeparator)?;

    let (name, colon_and_payload) = s.split_at(colon);

    validate_name(name)?;

    // don't bother decoding base64 if the name doesn't match
    if let Some(expected_name) = expected_name {
        if expected_name != name {
            return Err(Error::WrongKeyName {
                our_name: expected_name.to_string(),
                string_name: name.to_string(),
            }
            .into());
        }
    }

    let bytes = BASE64_STANDARD
        .decode(&colon_and_payload[1..])
        .map_err(Error::Base64DecodeError)?;

    if bytes.len() != expected_payload_length {
        return Err(Error::InvalidPayloadLength {
            actual: bytes.len(),
            expected: expected_payload_length,
            usage,
        }
        .into());
    }

    Ok((name, bytes))
}
