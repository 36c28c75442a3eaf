//! HTTP facade.
//!
//! A thin `axum` layer over [`Facade`]: no business logic lives here,
//! only request/response translation and the cache-header rules for
//! checkpoints, tiles and bundles. Graceful shutdown and tracing
//! middleware wrap the router the way a long-running service binary
//! wants them.

pub mod error;

use std::net::TcpListener;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, State};
use bytes::Bytes;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use self::error::Error;
use crate::facade::Facade;
use crate::hash;
use crate::layout::{self, BundleAddress, TileAddress};

const IMMUTABLE_CACHE_CONTROL: &str = "public, max-age=31536000, immutable";

async fn add(State(facade): State<Arc<Facade>>, body: Bytes) -> Result<String, Error> {
    let entry = body.to_vec();
    if entry.len() > u16::MAX as usize {
        return Err(Error::EntryTooLarge(crate::bundle::BundleError::EntryTooLarge(entry.len())));
    }
    // No out-of-band identity field exists in the wire format: the
    // content hash is used as the dedup key, so two POSTs of the same
    // bytes collapse to one index without a client needing to derive
    // or send one.
    let identity = hash::leaf_hash(&entry).as_bytes().to_vec();
    let index = facade.add(entry, identity).await?;
    Ok(index.to_string())
}

async fn checkpoint(State(facade): State<Arc<Facade>>) -> Result<Response, Error> {
    match facade.read_checkpoint().await? {
        Some(cp) => Ok(cp.signed_note.into_response()),
        None => Err(Error::CheckpointNotFound),
    }
}

async fn tile(
    State(facade): State<Arc<Facade>>,
    Path((level, rest)): Path<(u32, String)>,
) -> Result<Response, Error> {
    let (index, partial) = layout::parse_index_path(&rest).ok_or(Error::TileNotFound)?;
    let address = TileAddress {
        tile_level: level,
        tile_index: index,
    };
    let bytes = facade
        .read_tile(address, partial)
        .await?
        .ok_or(Error::TileNotFound)?;
    Ok(tile_response(bytes, partial))
}

async fn entry_bundle(
    State(facade): State<Arc<Facade>>,
    Path(rest): Path<String>,
) -> Result<Response, Error> {
    let (index, partial) = layout::parse_index_path(&rest).ok_or(Error::TileNotFound)?;
    let address = BundleAddress { bundle_index: index };
    let bytes = facade
        .read_entry_bundle(address, partial)
        .await?
        .ok_or(Error::TileNotFound)?;
    Ok(tile_response(bytes, partial))
}

/// A partial tile/bundle is requested under its own `.p{partial}` path and
/// never aliased to the suffix-less one, so the suffix-less request is
/// the only one ever safe to cache forever.
fn tile_response(bytes: Vec<u8>, partial: u64) -> Response {
    if partial == 0 {
        ([("cache-control", IMMUTABLE_CACHE_CONTROL)], Body::from(bytes)).into_response()
    } else {
        Body::from(bytes).into_response()
    }
}

async fn health() -> StatusCode {
    StatusCode::OK
}

fn router(facade: Arc<Facade>) -> Router {
    Router::new()
        .route("/add", post(add))
        .route("/checkpoint", get(checkpoint))
        .route("/tile/entries/*rest", get(entry_bundle))
        .route("/tile/:level/*rest", get(tile))
        .route("/health", get(health))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(facade)
}

/// Binds `listener` and serves the HTTP facade until a shutdown signal
/// arrives.
///
/// # Errors
/// Returns an error if the listener can't be made non-blocking or the
/// server exits with an I/O error.
pub async fn run(facade: Arc<Facade>, listener: TcpListener) -> anyhow::Result<()> {
    listener.set_nonblocking(true)?;
    let listener = tokio::net::TcpListener::from_std(listener)?;
    info!(addr = ?listener.local_addr()?, "listening");

    axum::serve(listener, router(facade))
        .with_graceful_shutdown(crate::shutdown::await_shutdown())
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::Signer;
    use crate::queue::QueueConfig;
    use crate::storage::memory::MemoryStorage;
    use crate::storage::Storage;
    use async_trait::async_trait;
    use axum::body::to_bytes;
    use axum::http::Request;
    use std::time::Duration;
    use tower::ServiceExt;

    struct NopSigner;

    #[async_trait]
    impl Signer for NopSigner {
        fn name(&self) -> &str {
            "test"
        }
        async fn sign(&self, message: &[u8]) -> Vec<u8> {
            hash::leaf_hash(message).as_bytes().to_vec()
        }
    }

    fn test_app() -> Router {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let signers: Vec<Arc<dyn Signer>> = vec![Arc::new(NopSigner)];
        let facade = Arc::new(Facade::spawn(
            "example.com/log",
            QueueConfig {
                max_size: 1,
                max_age: Duration::from_secs(5),
            },
            storage,
            signers,
        ));
        router(facade)
    }

    #[tokio::test]
    async fn checkpoint_is_404_before_any_add() {
        let app = test_app();
        let response = app
            .oneshot(Request::get("/checkpoint").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn s1_add_then_read_checkpoint_and_entry_bundle() {
        let app = test_app();

        let response = app
            .clone()
            .oneshot(Request::post("/add").body(Body::from("hello")).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"0");

        let response = app
            .clone()
            .oneshot(Request::get("/checkpoint").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .clone()
            .oneshot(Request::get("/tile/entries/000.p1").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get("cache-control").is_none());
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], [0u8, 5, b'h', b'e', b'l', b'l', b'o']);
    }

    #[tokio::test]
    async fn unknown_tile_is_404() {
        let app = test_app();
        let response = app
            .oneshot(Request::get("/tile/0/x999/999").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn entry_too_large_is_400() {
        let app = test_app();
        let big = vec![0u8; u16::MAX as usize + 1];
        let response = app
            .oneshot(Request::post("/add").body(Body::from(big)).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
