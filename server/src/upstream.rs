//! HTTP client for upstream caches.
//!
//! One `reqwest` client is built at startup and shared by all request
//! handlers. Narinfos are small and fetched into memory; NARs are
//! streamed straight to a local file so their size is bounded only by
//! disk.

use std::io;
use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use const_format::concatcp;
use displaydoc::Display;
use futures::TryStreamExt;
use reqwest::{Client as HttpClient, StatusCode};
use tokio::fs::File;
use tokio_util::io::StreamReader;

/// The User-Agent string.
const USER_AGENT: &str = concatcp!("nixmirror/", env!("CARGO_PKG_VERSION"));

/// Total timeout for a single upstream request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// An upstream request failure.
#[derive(Debug, Display)]
pub enum Error {
    /// upstream returned HTTP {0}
    HttpStatus(StatusCode),
    /// upstream request timed out
    Timeout,
    /// network error: {0}
    Network(reqwest::Error),
    /// i/o error: {0}
    Io(io::Error),
}
impl std::error::Error for Error {}

impl Error {
    /// Whether this upstream simply does not have the object.
    pub fn is_miss(&self) -> bool {
        matches!(self, Self::HttpStatus(StatusCode::NOT_FOUND))
    }
}

impl From<reqwest::Error> for Error {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            Self::Timeout
        } else {
            Self::Network(error)
        }
    }
}

/// The upstream HTTP client.
#[derive(Debug, Clone)]
pub struct Client {
    client: HttpClient,
}

impl Client {
    pub fn new() -> Result<Self> {
        let client = HttpClient::builder()
            .user_agent(USER_AGENT)
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self { client })
    }

    /// Fetches a small object into memory.
    pub async fn get(&self, url: &str) -> Result<Bytes, Error> {
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(Error::HttpStatus(response.status()));
        }

        Ok(response.bytes().await?)
    }

    /// Streams a large object to a local file.
    pub async fn get_to_file(&self, url: &str, dest: &Path) -> Result<(), Error> {
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(Error::HttpStatus(response.status()));
        }

        let stream = response
            .bytes_stream()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e));
        let mut reader = StreamReader::new(stream);

        let mut file = File::create(dest).await.map_err(Error::Io)?;
        tokio::io::copy(&mut reader, &mut file).await.map_err(Error::Io)?;

        Ok(())
    }
}
