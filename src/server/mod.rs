//! HTTP stream server
//!
//! Serves byte ranges of processed sources by stitching together slices of
//! their chunk files, plus JSON views of the chunk maps. Uploads arrive
//! through `POST /file`; the server process owns the record store, so that
//! is how new sources reach a running partition job.

mod body;
mod handlers;

pub use body::{plan_segments, segmented_body, Segment};

use crate::cache::LookupCache;
use crate::config::ServerConfig;
use crate::error::Result;
use crate::metadata::RecordStore;
use crate::storage::ChunkStore;
use axum::http::header::ACCESS_CONTROL_ALLOW_ORIGIN;
use axum::http::HeaderValue;
use axum::routing::{get, post};
use axum::Router;
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Shared state handed to every handler
pub struct AppState {
    pub store: Arc<dyn RecordStore>,
    pub chunks: ChunkStore,
    pub cache: Arc<LookupCache>,
    /// Where `POST /file` stores uploaded originals
    pub uploads: PathBuf,
    pub config: ServerConfig,
}

/// Build the router with all routes and layers
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/stream", get(handlers::stream))
        .route("/chunk", get(handlers::chunk))
        .route("/chunks", get(handlers::chunks))
        .route("/locate", get(handlers::locate))
        .route("/sources", get(handlers::sources))
        .route("/file", post(handlers::upload))
        .route("/health", get(handlers::health))
        .layer(SetResponseHeaderLayer::overriding(
            ACCESS_CONTROL_ALLOW_ORIGIN,
            HeaderValue::from_static("*"),
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until `shutdown` resolves
pub async fn serve<F>(state: Arc<AppState>, addr: SocketAddr, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Listening on {}", listener.local_addr()?);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;

    info!("Server stopped");
    Ok(())
}
