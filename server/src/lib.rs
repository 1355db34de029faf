pub mod api;
pub mod config;
pub mod decompress;
pub mod error;
pub mod fetch;
pub mod store;
pub mod upstream;

use anyhow::Result;
use std::sync::Arc;

use axum::{extract::Extension, http::Uri, Router, Server};
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;

use nixmirror_common::signing::Keypair;

use crate::config::Config;
use crate::error::{ErrorKind, ServerResult};
use crate::store::{nix::NixStoreBackend, StoreBackend};

/// Global server state.
///
/// Immutable once the server is up; request handlers share it through
/// an `Arc`.
#[derive(Debug)]
pub struct State {
    /// Server configuration.
    config: Config,
    /// Handle to the store gateway.
    store: Arc<Box<dyn StoreBackend>>,
    /// Shared HTTP client for the upstream caches.
    upstream: upstream::Client,
    /// Keypair signing outgoing narinfos, if configured.
    keypair: Option<Keypair>,
}
impl State {
    async fn new(config: Config) -> Result<Arc<Self>> {
        let keypair = match &config.secret_key_file {
            Some(path) => {
                let contents = tokio::fs::read_to_string(path).await?;
                Some(Keypair::from_str(contents.trim())?)
            }
            None => None,
        };

        let store: Box<dyn StoreBackend> = Box::new(NixStoreBackend::new(config.store_dir.clone()));

        Ok(Arc::new(Self {
            config,
            store: Arc::new(store),
            upstream: upstream::Client::new()?,
            keypair,
        }))
    }

    /// Returns a handle to the store gateway.
    fn store(&self) -> Arc<Box<dyn StoreBackend>> {
        Arc::clone(&self.store)
    }

    #[cfg(test)]
    fn for_tests(
        config: Config,
        store: Box<dyn StoreBackend>,
        keypair: Option<Keypair>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            store: Arc::new(store),
            upstream: upstream::Client::new().unwrap(),
            keypair,
        })
    }
}

/// Runs the API server.
pub async fn run_api_server(config: Config) -> Result<()> {
    tracing::info!("Starting API server...");

    if config.upstream_caches.is_empty() {
        tracing::warn!("No upstream caches configured, local misses will not be pulled through.");
    }
    if config.secret_key_file.is_none() {
        tracing::info!("No secret key configured, forwarding upstream signatures verbatim.");
    }

    let listen = config.listen;
    let state = State::new(config).await?;

    let rest = Router::new()
        .merge(api::router())
        .fallback(fallback)
        .layer(Extension(state))
        .layer(TraceLayer::new_for_http())
        .layer(CatchPanicLayer::new());

    tracing::info!("Listening on {:?}...", listen);
    Server::bind(&listen).serve(rest.into_make_service()).await?;

    Ok(())
}

/// The fallback route.
#[axum_macros::debug_handler]
async fn fallback(_: Uri) -> ServerResult<()> {
    Err(ErrorKind::NotFound.into())
}
