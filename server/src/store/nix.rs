//! Store gateway backed by the Nix CLI.
//!
//! Every operation shells out to `nix-store`/`nix` with argument-list
//! spawns; nothing here ever goes through a shell. Children are spawned
//! with `kill_on_drop` so an abandoned response stream does not leave a
//! dumper behind.

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;
use std::task::{Context, Poll};

use anyhow::anyhow;
use serde::Deserialize;
use tokio::io::{self, AsyncRead, ReadBuf};
use tokio::process::{Child, ChildStdout, Command};

use nixmirror_common::hash::Hash;
use nixmirror_common::store_path::StorePathHash;

use crate::error::{ErrorKind, ServerError, ServerResult};
use super::{Download, PathInfo, StoreBackend};

/// Store gateway driving the local Nix store through the CLI.
#[derive(Debug)]
pub struct NixStoreBackend {
    store_dir: PathBuf,
}

impl NixStoreBackend {
    pub fn new(store_dir: PathBuf) -> Self {
        Self { store_dir }
    }
}

/// One entry of `nix path-info --json` output.
#[derive(Debug, Deserialize)]
struct RawPathInfo {
    #[serde(rename = "narHash")]
    nar_hash: String,
    #[serde(rename = "narSize")]
    nar_size: u64,
    #[serde(default)]
    references: Vec<String>,
    #[serde(default)]
    deriver: Option<String>,
    #[serde(rename = "registrationTime", default)]
    registration_time: Option<i64>,
    #[serde(default)]
    signatures: Vec<String>,
}

#[async_trait::async_trait]
impl StoreBackend for NixStoreBackend {
    async fn lookup_by_hash_part(&self, hash: &StorePathHash) -> ServerResult<Option<PathBuf>> {
        let prefix = format!("{}-", hash.as_str());

        let mut entries = tokio::fs::read_dir(&self.store_dir)
            .await
            .map_err(ServerError::store_error)?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(ServerError::store_error)?
        {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if name.starts_with(&prefix) {
                return Ok(Some(self.store_dir.join(name)));
            }
        }

        Ok(None)
    }

    async fn query_path_info(&self, store_path: &Path) -> ServerResult<PathInfo> {
        let output = Command::new("nix")
            .args(["path-info", "--json"])
            .arg(store_path)
            .output()
            .await
            .map_err(ServerError::store_error)?;
        if !output.status.success() {
            return Err(ErrorKind::StoreError(anyhow!(
                "nix path-info {} failed: {}",
                store_path.display(),
                String::from_utf8_lossy(&output.stderr).trim(),
            ))
            .into());
        }

        // Older releases emit an array of objects, newer ones a map
        // keyed by store path.
        let value: serde_json::Value =
            serde_json::from_slice(&output.stdout).map_err(ServerError::store_error)?;
        let entry = match value {
            serde_json::Value::Array(mut entries) if !entries.is_empty() => entries.remove(0),
            serde_json::Value::Object(mut map) if !map.is_empty() => {
                let key = store_path.to_string_lossy().into_owned();
                match map.remove(&key) {
                    Some(entry) => entry,
                    None => map.into_iter().next().map(|(_, entry)| entry).unwrap(),
                }
            }
            _ => {
                return Err(ErrorKind::StoreError(anyhow!(
                    "nix path-info {} returned no entries",
                    store_path.display(),
                ))
                .into())
            }
        };
        let raw: RawPathInfo =
            serde_json::from_value(entry).map_err(ServerError::store_error)?;

        Ok(PathInfo {
            deriver: raw.deriver.map(PathBuf::from),
            nar_hash: Hash::parse(&raw.nar_hash).map_err(ErrorKind::StoreError)?,
            nar_size: raw.nar_size,
            registration_time: raw.registration_time.unwrap_or(0),
            references: raw.references.into_iter().map(PathBuf::from).collect(),
            sigs: raw.signatures,
        })
    }

    async fn stream_path(&self, store_path: &Path) -> ServerResult<Download> {
        let mut child = Command::new("nix-store")
            .arg("--dump")
            .arg(store_path)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(ServerError::store_error)?;

        let stdout = child.stdout.take().expect("stdout is piped");
        Ok(Download::AsyncRead(Box::new(ChildStream {
            stdout,
            _child: child,
        })))
    }

    async fn restore_path(
        &self,
        store_path: &Path,
        mut nar: Box<dyn AsyncRead + Unpin + Send>,
    ) -> ServerResult<()> {
        let mut child = Command::new("nix-store")
            .arg("--restore")
            .arg(store_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(ServerError::store_error)?;

        let mut stdin = child.stdin.take().expect("stdin is piped");
        let copied = io::copy(&mut nar, &mut stdin).await;
        // close stdin so the restorer sees EOF
        drop(stdin);

        let output = child
            .wait_with_output()
            .await
            .map_err(ServerError::store_error)?;
        if !output.status.success() {
            return Err(ErrorKind::StoreError(anyhow!(
                "nix-store --restore {} failed: {}",
                store_path.display(),
                String::from_utf8_lossy(&output.stderr).trim(),
            ))
            .into());
        }
        copied.map_err(ServerError::store_error)?;

        Ok(())
    }

    async fn read_build_log(&self, store_path: &Path) -> ServerResult<Option<Download>> {
        let output = Command::new("nix-store")
            .arg("--read-log")
            .arg(store_path)
            .output()
            .await
            .map_err(ServerError::store_error)?;

        if !output.status.success() {
            return Ok(None);
        }
        Ok(Some(Download::AsyncRead(Box::new(Cursor::new(
            output.stdout,
        )))))
    }
}

/// A child's stdout that keeps the child alive for as long as the
/// stream is read.
struct ChildStream {
    stdout: ChildStdout,
    _child: Child,
}

impl AsyncRead for ChildStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stdout).poll_read(cx, buf)
    }
}
