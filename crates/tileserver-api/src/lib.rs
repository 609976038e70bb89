//! Tile API and embedded map frontend
//!
//! The router is the same in every serving mode; only the listener in front
//! of it changes.

pub mod handlers;
pub mod tile;

use std::sync::Arc;

use axum::{http::HeaderName, routing::get, Router};
use rust_embed::RustEmbed;
use tower::ServiceBuilder;
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};

pub use tile::{
    CoordError, PostgisTileSource, TileBounds, TileCoord, TileError, TileSource, DENSIFY_FACTOR,
    MAX_ZOOM, WORLD_MERC_MAX,
};

/// Correlates log lines with a request; echoed back on the response
pub const REQUEST_ID_HEADER: &str = "request-id";

#[derive(RustEmbed)]
#[folder = "../../frontend/build"]
pub(crate) struct FrontendAssets;

/// Application state shared across handlers
pub struct AppState {
    pub tiles: Arc<dyn TileSource>,
}

/// Build the full application router
pub fn app_router(tiles: Arc<dyn TileSource>) -> Router {
    let state = Arc::new(AppState { tiles });
    let request_id = HeaderName::from_static(REQUEST_ID_HEADER);

    Router::new()
        .route("/api/v1/tile/{z}/{x}/{y}", get(handlers::get_tile))
        .fallback(handlers::serve_frontend)
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::new(request_id.clone(), MakeRequestUuid))
                .layer(TraceLayer::new_for_http())
                .layer(PropagateRequestIdLayer::new(request_id)),
        )
}
