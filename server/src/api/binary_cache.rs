//! Nix Binary Cache server.
//!
//! This module implements the read-only Nix Binary Cache API, with
//! pull-through on misses.
//!
//! The implementation is based on the specifications at <https://github.com/fzakaria/nix-http-binary-cache-api-spec>.

use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;

use axum::{
    body::StreamBody,
    extract::{Extension, Path},
    http::header,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tokio_util::io::ReaderStream;
use tracing::instrument;

use nixmirror_common::narinfo::NarInfo;
use nixmirror_common::signing::fingerprint;
use nixmirror_common::store_path::{self, StorePathHash, STORE_PATH_HASH_LEN};
use nixmirror_common::mime;

use crate::error::{ErrorKind, ServerResult};
use crate::fetch;
use crate::store::{Download, PathInfo};
use crate::State;

pub fn router() -> Router {
    Router::new()
        .route("/nix-cache-info", get(get_nix_cache_info))
        .route("/:path", get(get_store_path_info))
        .route("/nar/:path", get(get_nar))
        .route("/log/:name", get(get_build_log))
}

/// Gets information on this cache.
///
/// An example of a correct response is as follows:
///
/// ```text
/// StoreDir: /nix/store
/// WantMassQuery: 1
/// Priority: 30
/// ```
#[instrument(skip_all)]
async fn get_nix_cache_info(Extension(state): Extension<Arc<State>>) -> ServerResult<Response> {
    let body = format!(
        "StoreDir: {}\nWantMassQuery: 1\nPriority: {}\n",
        state.config.store_dir.display(),
        state.config.priority,
    );

    Ok(([(header::CONTENT_TYPE, mime::NIX_CACHE_INFO)], body).into_response())
}

/// Gets the narinfo of a store path hash.
///
/// `GET /{storePathHash}.narinfo`
#[instrument(skip_all, fields(path))]
#[axum_macros::debug_handler]
async fn get_store_path_info(
    Extension(state): Extension<Arc<State>>,
    Path(path): Path<String>,
) -> ServerResult<Response> {
    let hash = path
        .strip_suffix(".narinfo")
        .and_then(|hash| StorePathHash::new(hash.to_string()).ok())
        .ok_or(ErrorKind::NotFound)?;

    let store_path = resolve_store_path(&state, &hash).await?;
    let info = state.store().query_path_info(&store_path).await?;
    let narinfo = to_narinfo(&state, &store_path, &hash, &info);

    Ok(([(header::CONTENT_TYPE, mime::NAR_INFO)], narinfo.to_string()).into_response())
}

/// Streams the NAR serialization of a store path.
///
/// `/nar/:path`, which may be one of
/// - GET `/nar/{storePathHash}-{narHash}.nar`
/// - GET `/nar/{storePathHash}.nar` (legacy, no hash check)
#[instrument(skip_all, fields(path))]
#[axum_macros::debug_handler]
async fn get_nar(
    Extension(state): Extension<Arc<State>>,
    Path(path): Path<String>,
) -> ServerResult<Response> {
    let (hash, requested_nar_hash) = parse_nar_request(&path).ok_or(ErrorKind::NotFound)?;

    let store_path = resolve_store_path(&state, &hash).await?;
    let info = state.store().query_path_info(&store_path).await?;

    if let Some(requested) = requested_nar_hash {
        if info.nar_hash.to_base32() != requested {
            return Err(ErrorKind::IncorrectNarHash.into());
        }
    }

    let Download::AsyncRead(stream) = state.store().stream_path(&store_path).await?;
    let body = StreamBody::new(ReaderStream::new(stream));

    Ok((
        [
            (header::CONTENT_TYPE, mime::NAR.to_string()),
            (header::CONTENT_LENGTH, info.nar_size.to_string()),
        ],
        body,
    )
        .into_response())
}

/// Streams the build log of a store path.
///
/// `GET /log/{storeBaseName}`
#[instrument(skip_all, fields(name))]
#[axum_macros::debug_handler]
async fn get_build_log(
    Extension(state): Extension<Arc<State>>,
    Path(name): Path<String>,
) -> ServerResult<Response> {
    if !store_path::is_base_name(&name) {
        return Err(ErrorKind::NotFound.into());
    }

    let store_path = state.config.store_dir.join(&name);
    let log = state
        .store()
        .read_build_log(&store_path)
        .await?
        .ok_or(ErrorKind::NoSuchPath)?;

    let Download::AsyncRead(stream) = log;
    let body = StreamBody::new(ReaderStream::new(stream));

    Ok(([(header::CONTENT_TYPE, mime::BUILD_LOG)], body).into_response())
}

/// Resolves a hash part locally, pulling through from the upstreams on
/// a miss.
async fn resolve_store_path(state: &State, hash: &StorePathHash) -> ServerResult<PathBuf> {
    if let Some(store_path) = state.store().lookup_by_hash_part(hash).await? {
        return Ok(store_path);
    }

    if !state.config.upstream_caches.is_empty() {
        if let Some(store_path) = fetch::fetch(state, hash).await {
            return Ok(store_path);
        }
    }

    Err(ErrorKind::NoSuchPath.into())
}

/// Composes the narinfo served for a store path.
///
/// Egress is always uncompressed and the URL embeds the current NAR
/// hash. With a configured keypair the narinfo carries exactly one
/// locally computed signature; otherwise the store-recorded signatures
/// are forwarded verbatim.
fn to_narinfo(
    state: &State,
    store_path: &FsPath,
    hash: &StorePathHash,
    info: &PathInfo,
) -> NarInfo {
    let nar_hash = info.nar_hash.to_base32();

    let sigs = match &state.keypair {
        Some(keypair) => {
            let fingerprint =
                fingerprint(store_path, &info.nar_hash, info.nar_size, &info.references);
            vec![keypair.sign(fingerprint.as_bytes())]
        }
        None => info.sigs.clone(),
    };

    NarInfo {
        store_path: store_path.to_owned(),
        url: format!("nar/{}-{}.nar", hash, nar_hash),
        compression: "none".to_string(),
        nar_hash: Some(info.nar_hash.to_typed_base32()),
        nar_size: Some(info.nar_size),
        references: leaf_names(&info.references),
        deriver: info
            .deriver
            .as_deref()
            .and_then(store_path::base_name)
            .map(str::to_string),
        sigs,
        extra: Vec::new(),
    }
}

/// Base names of a reference list, preserving store order.
fn leaf_names(references: &[PathBuf]) -> Vec<String> {
    references
        .iter()
        .filter_map(|reference| store_path::base_name(reference))
        .map(str::to_string)
        .collect()
}

/// Splits `{hash}.nar` / `{hash}-{narHash}.nar` into its components.
fn parse_nar_request(path: &str) -> Option<(StorePathHash, Option<String>)> {
    let stem = path.strip_suffix(".nar")?;
    if !stem.is_ascii() {
        return None;
    }

    if stem.len() <= STORE_PATH_HASH_LEN {
        let hash = StorePathHash::new(stem.to_string()).ok()?;
        return Some((hash, None));
    }

    let (hash, rest) = stem.split_at(STORE_PATH_HASH_LEN);
    let hash = StorePathHash::new(hash.to_string()).ok()?;
    let nar_hash = rest.strip_prefix('-')?;
    if nar_hash.is_empty() || !nar_hash.bytes().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()) {
        return None;
    }

    Some((hash, Some(nar_hash.to_string())))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use axum::Router;
    use tower::ServiceExt;

    use nixmirror_common::hash::Hash;
    use nixmirror_common::signing::Keypair;

    use super::*;
    use crate::config::Config;
    use crate::store::tests::{MemoryBackend, MemoryPath};

    const HASH: &str = "ia70ss13m22znbl8khrf2hq72qmh5drr";
    const ZERO_NAR_HASH: &str =
        "0000000000000000000000000000000000000000000000000000";

    fn hello_path() -> (PathBuf, MemoryPath) {
        let nar = vec![0u8; 96];
        (
            PathBuf::from(format!("/nix/store/{HASH}-hello")),
            MemoryPath {
                info: PathInfo {
                    deriver: None,
                    nar_hash: Hash::Sha256([0; 32]),
                    nar_size: nar.len() as u64,
                    registration_time: 0,
                    references: Vec::new(),
                    sigs: Vec::new(),
                },
                nar,
                log: Some(b"building hello...\n".to_vec()),
            },
        )
    }

    fn test_app(store: MemoryBackend, keypair: Option<Keypair>) -> Router {
        let config = Config {
            upstream_caches: Vec::new(),
            ..Config::default()
        };
        let state = State::for_tests(config, Box::new(store), keypair);

        Router::new()
            .merge(router())
            .fallback(crate::fallback)
            .layer(Extension(state))
    }

    async fn request(app: Router, uri: &str) -> (StatusCode, Vec<u8>) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
        (status, body.to_vec())
    }

    #[tokio::test]
    async fn test_nix_cache_info() {
        let app = test_app(MemoryBackend::default(), None);
        let (status, body) = request(app, "/nix-cache-info").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"StoreDir: /nix/store\nWantMassQuery: 1\nPriority: 30\n");
    }

    #[tokio::test]
    async fn test_narinfo_local_hit() {
        let store = MemoryBackend::default();
        let (store_path, path) = hello_path();
        store.insert(store_path, path);

        let app = test_app(store, None);
        let (status, body) = request(app, &format!("/{HASH}.narinfo")).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            String::from_utf8(body).unwrap(),
            format!(
                "StorePath: /nix/store/{HASH}-hello\n\
                 URL: nar/{HASH}-{ZERO_NAR_HASH}.nar\n\
                 Compression: none\n\
                 NarHash: sha256:{ZERO_NAR_HASH}\n\
                 NarSize: 96\n",
            ),
        );
    }

    #[tokio::test]
    async fn test_narinfo_references_and_deriver() {
        let store = MemoryBackend::default();
        let (store_path, mut path) = hello_path();
        path.info.references = vec![
            PathBuf::from("/nix/store/0jqd0rlxzra1rs38rdxl43yh6rxchgc6-curl-7.82.0"),
            PathBuf::from("/nix/store/6w8g7njm4mck5dmjxws0z1xnrxvl81xa-glibc-2.34-115"),
        ];
        path.info.deriver = Some(PathBuf::from(format!("/nix/store/{HASH}-hello.drv")));
        path.info.sigs = vec!["cache.example-1:AAAA==".to_string()];
        store.insert(store_path, path);

        let app = test_app(store, None);
        let (status, body) = request(app, &format!("/{HASH}.narinfo")).await;
        let body = String::from_utf8(body).unwrap();

        assert_eq!(status, StatusCode::OK);
        assert!(body.contains(
            "References: 0jqd0rlxzra1rs38rdxl43yh6rxchgc6-curl-7.82.0 \
             6w8g7njm4mck5dmjxws0z1xnrxvl81xa-glibc-2.34-115\n"
        ));
        assert!(body.contains(&format!("Deriver: {HASH}-hello.drv\n")));
        // without a keypair, store signatures are forwarded verbatim
        assert!(body.contains("Sig: cache.example-1:AAAA==\n"));
    }

    #[tokio::test]
    async fn test_narinfo_signed() {
        let keypair = Keypair::generate("mirror-test").unwrap();

        let store = MemoryBackend::default();
        let (store_path, mut path) = hello_path();
        path.info.sigs = vec!["upstream-1:BBBB==".to_string()];
        let info = path.info.clone();
        store.insert(store_path.clone(), path);

        let app = test_app(store, Some(keypair.clone()));
        let (status, body) = request(app, &format!("/{HASH}.narinfo")).await;
        let body = String::from_utf8(body).unwrap();

        assert_eq!(status, StatusCode::OK);

        // local signing replaces upstream signatures, never joins them
        assert!(!body.contains("upstream-1"));
        let expected = keypair.sign(
            fingerprint(&store_path, &info.nar_hash, info.nar_size, &info.references).as_bytes(),
        );
        let sigs: Vec<&str> = body
            .lines()
            .filter_map(|line| line.strip_prefix("Sig: "))
            .collect();
        assert_eq!(sigs, vec![expected.as_str()]);
    }

    #[tokio::test]
    async fn test_narinfo_miss() {
        let app = test_app(MemoryBackend::default(), None);
        let (status, body) = request(app, &format!("/{HASH}.narinfo")).await;

        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, b"No such path.\n");
    }

    #[tokio::test]
    async fn test_nar_with_hash_check() {
        let store = MemoryBackend::default();
        let (store_path, path) = hello_path();
        store.insert(store_path, path);
        let app = test_app(store, None);

        let (status, body) = request(app, &format!("/nar/{HASH}-{ZERO_NAR_HASH}.nar")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, vec![0u8; 96]);
    }

    #[tokio::test]
    async fn test_nar_wrong_hash() {
        let store = MemoryBackend::default();
        let (store_path, path) = hello_path();
        store.insert(store_path, path);
        let app = test_app(store, None);

        let wrong = "1".repeat(52);
        let (status, body) = request(app, &format!("/nar/{HASH}-{wrong}.nar")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, b"Incorrect NAR hash. Maybe the path has been recreated.\n");
    }

    #[tokio::test]
    async fn test_nar_legacy_route_skips_hash_check() {
        let store = MemoryBackend::default();
        let (store_path, path) = hello_path();
        store.insert(store_path, path);
        let app = test_app(store, None);

        let (status, body) = request(app, &format!("/nar/{HASH}.nar")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.len(), 96);
    }

    #[tokio::test]
    async fn test_nar_unknown_path() {
        let app = test_app(MemoryBackend::default(), None);
        let (status, body) = request(app, &format!("/nar/{HASH}.nar")).await;

        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, b"No such path.\n");
    }

    #[tokio::test]
    async fn test_build_log() {
        let store = MemoryBackend::default();
        let (store_path, path) = hello_path();
        store.insert(store_path, path);
        let app = test_app(store, None);

        let (status, body) = request(app.clone(), &format!("/log/{HASH}-hello")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"building hello...\n");

        let (status, body) = request(app, &format!("/log/{HASH}-absent")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, b"No such path.\n");
    }

    #[tokio::test]
    async fn test_fallback() {
        let app = test_app(MemoryBackend::default(), None);

        let (status, body) = request(app.clone(), "/not/a/route").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, b"File not found.\n");

        // malformed hash parts fall out the same way
        let (status, body) = request(app, "/UPPERCASE.narinfo").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, b"File not found.\n");
    }

    #[tokio::test]
    async fn test_pull_through_then_local() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use axum::routing::get;

        let nar = vec![1u8; 32];
        let narinfo = format!(
            "StorePath: /nix/store/{HASH}-hello\nURL: nar/{HASH}.nar\nCompression: none\nNarSize: {}\n",
            nar.len(),
        );
        let probes = Arc::new(AtomicUsize::new(0));
        let probes_handler = probes.clone();
        let nar_body = nar.clone();
        let upstream = Router::new()
            .route(
                &format!("/{HASH}.narinfo"),
                get(move || {
                    let narinfo = narinfo.clone();
                    let probes = probes_handler.clone();
                    async move {
                        probes.fetch_add(1, Ordering::SeqCst);
                        narinfo
                    }
                }),
            )
            .route(
                "/nar/:name",
                get(move || {
                    let nar = nar_body.clone();
                    async move { nar }
                }),
            );
        let server = axum::Server::bind(&"127.0.0.1:0".parse().unwrap())
            .serve(upstream.into_make_service());
        let addr = server.local_addr();
        tokio::spawn(server);

        let store = MemoryBackend::default();
        let store_path = PathBuf::from(format!("/nix/store/{HASH}-hello"));
        store.expect_restore(
            store_path.clone(),
            PathInfo {
                deriver: None,
                nar_hash: Hash::Sha256([0; 32]),
                nar_size: nar.len() as u64,
                registration_time: 0,
                references: Vec::new(),
                sigs: Vec::new(),
            },
        );

        let config = Config {
            upstream_caches: vec![format!("http://{addr}")],
            ..Config::default()
        };
        let state = State::for_tests(config, Box::new(store.clone()), None);
        let app = Router::new()
            .merge(router())
            .fallback(crate::fallback)
            .layer(Extension(state));

        // miss pulls through and serves the restored path
        let (status, body) = request(app.clone(), &format!("/{HASH}.narinfo")).await;
        assert_eq!(status, StatusCode::OK);
        let body = String::from_utf8(body).unwrap();
        assert!(body.contains(&format!("StorePath: /nix/store/{HASH}-hello\n")));
        assert!(body.contains("Compression: none\n"));
        assert_eq!(probes.load(Ordering::SeqCst), 1);
        assert_eq!(store.nar_of(&store_path).unwrap(), nar);

        // now local: no further upstream traffic
        let (status, _) = request(app, &format!("/{HASH}.narinfo")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(probes.load(Ordering::SeqCst), 1);
    }
}
