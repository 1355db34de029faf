//! Pull-through fetching.
//!
//! On a local miss the configured upstream caches are probed strictly
//! in order: narinfo, then the NAR itself, downloaded to a temporary
//! file, decompressed and restored into the local store. The first
//! upstream whose object restores wins; every failure along the way is
//! absorbed and the next upstream is tried. Callers only ever see a hit
//! or a miss.

use std::path::PathBuf;

use displaydoc::Display;
use tempfile::NamedTempFile;
use tokio::fs::File;
use tokio::io::AsyncRead;
use tracing::instrument;

use nixmirror_common::narinfo::{self, NarInfo};
use nixmirror_common::store_path::StorePathHash;

use crate::decompress::{self, Compression};
use crate::upstream;
use crate::State;

/// Why a single upstream attempt failed.
#[derive(Debug, Display)]
enum AttemptError {
    /// upstream request failed: {0}
    Upstream(upstream::Error),
    /// invalid narinfo: {0}
    BadNarInfo(narinfo::Error),
    /// unsupported compression "{0}"
    UnsupportedCompression(String),
    /// temporary file error: {0}
    TempFile(std::io::Error),
    /// restore failed: {0}
    Restore(crate::error::ServerError),
}

impl AttemptError {
    fn is_miss(&self) -> bool {
        matches!(self, Self::Upstream(e) if e.is_miss())
    }
}

/// Attempts to materialize the path for `hash` from the configured
/// upstreams, returning its store path on success.
pub async fn fetch(state: &State, hash: &StorePathHash) -> Option<PathBuf> {
    for upstream_url in &state.config.upstream_caches {
        let upstream_url = upstream_url.strip_suffix('/').unwrap_or(upstream_url);

        match fetch_one(state, upstream_url, hash).await {
            Ok(store_path) => {
                tracing::info!("fetched {} from {}", store_path.display(), upstream_url);
                return Some(store_path);
            }
            Err(e) if e.is_miss() => {
                tracing::debug!("{} does not have {}", upstream_url, hash);
            }
            Err(e) => {
                tracing::warn!("fetching {} from {} failed: {}", hash, upstream_url, e);
            }
        }
    }

    None
}

/// Runs the probe → download → decompress → restore pipeline against a
/// single upstream.
#[instrument(skip(state))]
async fn fetch_one(
    state: &State,
    upstream_url: &str,
    hash: &StorePathHash,
) -> Result<PathBuf, AttemptError> {
    let narinfo_url = format!("{}/{}.narinfo", upstream_url, hash);
    let body = state
        .upstream
        .get(&narinfo_url)
        .await
        .map_err(AttemptError::Upstream)?;
    let info = NarInfo::parse(&String::from_utf8_lossy(&body)).map_err(AttemptError::BadNarInfo)?;

    let compression = Compression::from_tag(&info.compression)
        .ok_or_else(|| AttemptError::UnsupportedCompression(info.compression.clone()))?;
    let nar_url = format!("{}/{}", upstream_url, info.url);

    // Deleted on drop, whichever way this attempt ends.
    let download = NamedTempFile::new().map_err(AttemptError::TempFile)?;
    state
        .upstream
        .get_to_file(&nar_url, download.path())
        .await
        .map_err(AttemptError::Upstream)?;

    let compressed = File::open(download.path())
        .await
        .map_err(AttemptError::TempFile)?;
    let mut nar: Box<dyn AsyncRead + Unpin + Send> = decompress::decoder(compression, compressed);
    if let Some(nar_size) = info.nar_size {
        nar = Box::new(decompress::Capped::new(nar, nar_size));
    }

    let store = state.store();
    match store.restore_path(&info.store_path, nar).await {
        Ok(()) => Ok(info.store_path),
        Err(e) => {
            // A concurrent fetch of the same path may have won the
            // restore race; a now-present path is still a hit.
            match store.lookup_by_hash_part(hash).await {
                Ok(Some(store_path)) => Ok(store_path),
                _ => Err(AttemptError::Restore(e)),
            }
        }
    }
}
