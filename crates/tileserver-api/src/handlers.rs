use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::{error, warn};

use crate::tile::TileCoord;
use crate::{AppState, FrontendAssets, REQUEST_ID_HEADER};

pub const MVT_CONTENT_TYPE: &str = "application/x-protobuf";

/// Render one vector tile
pub async fn get_tile(
    State(state): State<Arc<AppState>>,
    Path((z, x, y)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> Response {
    let req_id = headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-")
        .to_string();

    let coord = match TileCoord::parse(&z, &x, &y) {
        Ok(coord) => coord,
        Err(e) => {
            warn!(req_id = %req_id, z = %z, x = %x, y = %y, "Rejected tile request: {}", e);
            return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
        }
    };

    match state.tiles.tile(coord).await {
        Ok(mvt) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, HeaderValue::from_static(MVT_CONTENT_TYPE))],
            mvt,
        )
            .into_response(),
        Err(e) => {
            error!(
                req_id = %req_id,
                z = coord.z,
                x = coord.x,
                y = coord.y,
                "Tile query failed: {}",
                e
            );
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Serve the embedded frontend; unknown non-API paths get `index.html`
pub async fn serve_frontend(req: axum::extract::Request) -> Response {
    let path = req.uri().path().trim_start_matches('/');

    if let Some(content) = FrontendAssets::get(path) {
        let mime = mime_guess::from_path(path).first_or_octet_stream();
        return asset_response(content.data.into_owned(), mime.as_ref());
    }

    if !path.starts_with("api/") {
        if let Some(content) = FrontendAssets::get("index.html") {
            return asset_response(content.data.into_owned(), "text/html");
        }
    }

    (StatusCode::NOT_FOUND, "Not Found").into_response()
}

fn asset_response(data: Vec<u8>, content_type: &str) -> Response {
    let content_type = HeaderValue::from_str(content_type)
        .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream"));
    let mut response = Response::new(Body::from(data));
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, content_type);
    response
}
