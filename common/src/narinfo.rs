//! The `.narinfo` wire format.
//!
//! A narinfo is a small line-oriented `Key: value` record describing a
//! store object's NAR: where to fetch it, its hash and size, its
//! references, and optional signatures. The parser is deliberately
//! permissive (upstream caches add keys over time); the emitter writes
//! a fixed field order so responses are byte-stable.

use std::fmt;
use std::path::PathBuf;

use displaydoc::Display;
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    /// A well-formed narinfo line.
    static ref LINE_REGEX: Regex = Regex::new(r"^(\w+):\s*(.*)$").unwrap();
}

#[derive(Debug, Display)]
pub enum Error {
    /// Narinfo is missing the required "{0}" field.
    MissingField(&'static str),
}
impl std::error::Error for Error {}

/// A parsed or to-be-emitted narinfo record.
///
/// `references` and `deriver` hold base names (no store directory);
/// `sigs` preserves the order of the `Sig` lines. Keys the codec does
/// not know are kept in `extra` in insertion order but never re-emitted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NarInfo {
    pub store_path: PathBuf,
    pub url: String,
    pub compression: String,
    pub nar_hash: Option<String>,
    pub nar_size: Option<u64>,
    pub references: Vec<String>,
    pub deriver: Option<String>,
    pub sigs: Vec<String>,
    pub extra: Vec<(String, String)>,
}

impl NarInfo {
    /// Parses a narinfo document.
    ///
    /// Blank lines and lines that do not look like `Key: value` are
    /// skipped. A repeated `Sig` key accumulates; `StorePath` and `URL`
    /// are the only keys required to be present.
    pub fn parse(input: &str) -> Result<Self, Error> {
        let mut store_path = None;
        let mut url = None;
        let mut compression = None;
        let mut nar_hash = None;
        let mut nar_size = None;
        let mut references = Vec::new();
        let mut deriver = None;
        let mut sigs = Vec::new();
        let mut extra = Vec::new();

        for line in input.lines() {
            let Some(caps) = LINE_REGEX.captures(line) else {
                continue;
            };
            let value = caps[2].to_string();

            match &caps[1] {
                "StorePath" => store_path = Some(PathBuf::from(value)),
                "URL" => url = Some(value),
                "Compression" => compression = Some(value),
                "NarHash" => nar_hash = Some(value),
                "NarSize" => nar_size = value.parse().ok(),
                "References" => {
                    references.extend(value.split_whitespace().map(str::to_string));
                }
                "Deriver" => deriver = Some(value),
                "Sig" => sigs.push(value),
                key => extra.push((key.to_string(), value)),
            }
        }

        Ok(Self {
            store_path: store_path.ok_or(Error::MissingField("StorePath"))?,
            url: url.ok_or(Error::MissingField("URL"))?,
            compression: compression.unwrap_or_else(|| "none".to_string()),
            nar_hash,
            nar_size,
            references,
            deriver,
            sigs,
            extra,
        })
    }
}

impl fmt::Display for NarInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "StorePath: {}", self.store_path.display())?;
        writeln!(f, "URL: {}", self.url)?;
        writeln!(f, "Compression: {}", self.compression)?;
        if let Some(nar_hash) = &self.nar_hash {
            writeln!(f, "NarHash: {}", nar_hash)?;
        }
        if let Some(nar_size) = self.nar_size {
            writeln!(f, "NarSize: {}", nar_size)?;
        }
        if !self.references.is_empty() {
            writeln!(f, "References: {}", self.references.join(" "))?;
        }
        if let Some(deriver) = &self.deriver {
            writeln!(f, "Deriver: {}", deriver)?;
        }
        for sig in &self.sigs {
            writeln!(f, "Sig: {}", sig)?;
        }
        Ok(())
    }
}
