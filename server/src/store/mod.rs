//! The store gateway.
//!
//! Everything the server needs from the local Nix store goes through
//! the narrow [`StoreBackend`] capability: path lookup by hash part,
//! metadata queries, NAR streaming in both directions, and build logs.
//! The store itself stays in charge of integrity; a restore that does
//! not match the path's content address must fail inside the backend.

pub mod nix;

use std::fmt::Debug;
use std::path::{Path, PathBuf};

use tokio::io::AsyncRead;

use nixmirror_common::hash::Hash;
use nixmirror_common::store_path::StorePathHash;

use crate::error::ServerResult;

/// Metadata the store records for a valid path.
#[derive(Debug, Clone)]
pub struct PathInfo {
    /// Deriver of the path, if known.
    pub deriver: Option<PathBuf>,
    /// Hash of the NAR serialization.
    pub nar_hash: Hash,
    /// Size of the NAR serialization in bytes.
    pub nar_size: u64,
    /// When the path was registered, as a Unix timestamp.
    pub registration_time: i64,
    /// Store paths this path directly references, in store order.
    pub references: Vec<PathBuf>,
    /// Signatures recorded for the path.
    pub sigs: Vec<String>,
}

/// Way to download a byte stream from the store.
pub enum Download {
    AsyncRead(Box<dyn AsyncRead + Unpin + Send>),
}

#[async_trait::async_trait]
pub trait StoreBackend: Send + Sync + Debug {
    /// Resolves the store path carrying the given hash part.
    async fn lookup_by_hash_part(&self, hash: &StorePathHash) -> ServerResult<Option<PathBuf>>;

    /// Queries metadata of a valid store path.
    async fn query_path_info(&self, store_path: &Path) -> ServerResult<PathInfo>;

    /// Streams the NAR serialization of a store path.
    ///
    /// The stream's total length equals the `nar_size` reported by
    /// [`StoreBackend::query_path_info`].
    async fn stream_path(&self, store_path: &Path) -> ServerResult<Download>;

    /// Restores a store path from a NAR stream.
    async fn restore_path(
        &self,
        store_path: &Path,
        nar: Box<dyn AsyncRead + Unpin + Send>,
    ) -> ServerResult<()>;

    /// Streams the build log of a store path, if one exists.
    async fn read_build_log(&self, store_path: &Path) -> ServerResult<Option<Download>>;
}

#[cfg(test)]
pub(crate) mod tests {
    //! An in-memory [`StoreBackend`] shared by the fetcher and
    //! dispatcher tests.

    use std::collections::HashMap;
    use std::io::Cursor;
    use std::sync::{Arc, Mutex};

    use anyhow::anyhow;
    use tokio::io::AsyncReadExt;

    use super::*;
    use crate::error::{ErrorKind, ServerError};

    #[derive(Debug, Clone)]
    pub(crate) struct MemoryPath {
        pub(crate) info: PathInfo,
        pub(crate) nar: Vec<u8>,
        pub(crate) log: Option<Vec<u8>>,
    }

    #[derive(Debug, Default)]
    struct MemoryState {
        /// Materialized paths.
        paths: HashMap<PathBuf, MemoryPath>,
        /// Metadata attached when a restore materializes the path.
        pending: HashMap<PathBuf, PathInfo>,
        /// Makes every restore report failure after materializing, as
        /// if a concurrent writer had won the race.
        lose_restore_race: bool,
        restores: usize,
    }

    /// A cloneable handle; all clones share the same state.
    #[derive(Debug, Clone, Default)]
    pub(crate) struct MemoryBackend {
        inner: Arc<Mutex<MemoryState>>,
    }

    impl MemoryBackend {
        pub(crate) fn insert(&self, store_path: impl Into<PathBuf>, path: MemoryPath) {
            self.inner.lock().unwrap().paths.insert(store_path.into(), path);
        }

        pub(crate) fn expect_restore(&self, store_path: impl Into<PathBuf>, info: PathInfo) {
            self.inner.lock().unwrap().pending.insert(store_path.into(), info);
        }

        pub(crate) fn lose_restore_race(&self) {
            self.inner.lock().unwrap().lose_restore_race = true;
        }

        pub(crate) fn restores(&self) -> usize {
            self.inner.lock().unwrap().restores
        }

        pub(crate) fn nar_of(&self, store_path: &Path) -> Option<Vec<u8>> {
            self.inner
                .lock()
                .unwrap()
                .paths
                .get(store_path)
                .map(|p| p.nar.clone())
        }
    }

    #[async_trait::async_trait]
    impl StoreBackend for MemoryBackend {
        async fn lookup_by_hash_part(
            &self,
            hash: &StorePathHash,
        ) -> ServerResult<Option<PathBuf>> {
            let prefix = format!("{}-", hash.as_str());
            let inner = self.inner.lock().unwrap();
            Ok(inner
                .paths
                .keys()
                .find(|path| {
                    path.file_name()
                        .and_then(|name| name.to_str())
                        .is_some_and(|name| name.starts_with(&prefix))
                })
                .cloned())
        }

        async fn query_path_info(&self, store_path: &Path) -> ServerResult<PathInfo> {
            let inner = self.inner.lock().unwrap();
            inner
                .paths
                .get(store_path)
                .map(|path| path.info.clone())
                .ok_or_else(|| {
                    ErrorKind::StoreError(anyhow!("no info for {}", store_path.display())).into()
                })
        }

        async fn stream_path(&self, store_path: &Path) -> ServerResult<Download> {
            let nar = self
                .nar_of(store_path)
                .ok_or_else(|| ServerError::from(ErrorKind::NoSuchPath))?;
            Ok(Download::AsyncRead(Box::new(Cursor::new(nar))))
        }

        async fn restore_path(
            &self,
            store_path: &Path,
            mut nar: Box<dyn AsyncRead + Unpin + Send>,
        ) -> ServerResult<()> {
            let mut bytes = Vec::new();
            nar.read_to_end(&mut bytes)
                .await
                .map_err(ServerError::store_error)?;

            let mut inner = self.inner.lock().unwrap();
            inner.restores += 1;
            let info = inner.pending.remove(store_path).ok_or_else(|| {
                ServerError::from(ErrorKind::StoreError(anyhow!(
                    "unexpected restore of {}",
                    store_path.display()
                )))
            })?;
            inner.paths.insert(
                store_path.to_owned(),
                MemoryPath {
                    info,
                    nar: bytes,
                    log: None,
                },
            );

            if inner.lose_restore_race {
                return Err(ErrorKind::StoreError(anyhow!("path already exists")).into());
            }
            Ok(())
        }

        async fn read_build_log(&self, store_path: &Path) -> ServerResult<Option<Download>> {
            let inner = self.inner.lock().unwrap();
            Ok(inner
                .paths
                .get(store_path)
                .and_then(|path| path.log.clone())
                .map(|log| Download::AsyncRead(Box::new(Cursor::new(log)))))
        }
    }
}
