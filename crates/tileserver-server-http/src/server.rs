//! Redirect listener implementation

use axum::extract::{Path, State};
use axum::http::header::{CONTENT_TYPE, HOST, LOCATION};
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use std::net::SocketAddr;
use thiserror::Error;
use tileserver_cert::ChallengeManager;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Redirect listener errors
#[derive(Debug, Error)]
pub enum RedirectError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Ports below 1024 need elevated privileges\n  • Try using a different address or port")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },
}

/// Redirect listener configuration
#[derive(Debug, Clone)]
pub struct RedirectConfig {
    pub bind_addr: SocketAddr,
    /// Port clients use for HTTPS; omitted from the Location header when 443
    pub https_port: u16,
}

impl Default for RedirectConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8082)),
            https_port: 443,
        }
    }
}

#[derive(Clone)]
struct RedirectState {
    challenges: ChallengeManager,
    https_port: u16,
}

/// Router for the insecure port. Never serves the application.
pub fn redirect_router(challenges: ChallengeManager, https_port: u16) -> Router {
    Router::new()
        .route("/.well-known/acme-challenge/{token}", get(acme_challenge))
        .fallback(redirect_to_https)
        .with_state(RedirectState {
            challenges,
            https_port,
        })
}

async fn acme_challenge(
    State(state): State<RedirectState>,
    Path(token): Path<String>,
) -> Response {
    match state.challenges.get_response(&token) {
        Some(key_authorization) => {
            info!(token = %token, "Answered ACME HTTP-01 challenge");
            ([(CONTENT_TYPE, "text/plain")], key_authorization).into_response()
        }
        None => {
            debug!(token = %token, "Unknown ACME challenge token");
            StatusCode::NOT_FOUND.into_response()
        }
    }
}

async fn redirect_to_https(
    State(state): State<RedirectState>,
    headers: HeaderMap,
    uri: Uri,
) -> Response {
    let host = headers
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .map(strip_port)
        .filter(|host| !host.is_empty());

    let Some(host) = host else {
        debug!(uri = %uri, "Rejecting request without Host header");
        return (StatusCode::BAD_REQUEST, "Missing Host header").into_response();
    };

    let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let location = https_location(host, state.https_port, path_and_query);
    debug!(location = %location, "Redirecting to HTTPS");

    (StatusCode::MOVED_PERMANENTLY, [(LOCATION, location)]).into_response()
}

fn https_location(host: &str, https_port: u16, path_and_query: &str) -> String {
    if https_port == 443 {
        format!("https://{}{}", host, path_and_query)
    } else {
        format!("https://{}:{}{}", host, https_port, path_and_query)
    }
}

/// Host header without its port; bracketed IPv6 literals keep their brackets
fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        return match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        };
    }
    match host.rsplit_once(':') {
        Some((name, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => name,
        _ => host,
    }
}

/// Plain-HTTP listener bound for the life of the process
pub struct RedirectListener {
    listener: TcpListener,
    local_addr: SocketAddr,
    router: Router,
}

impl RedirectListener {
    /// Bind the insecure port now so a conflict surfaces before anything else starts
    pub async fn bind(
        config: RedirectConfig,
        challenges: ChallengeManager,
    ) -> Result<Self, RedirectError> {
        let listener = TcpListener::bind(config.bind_addr).await.map_err(|e| {
            let port = config.bind_addr.port();
            let address = config.bind_addr.ip().to_string();
            let reason = e.to_string();
            RedirectError::BindError {
                address,
                port,
                reason,
            }
        })?;
        let local_addr = listener.local_addr()?;

        info!(
            "HTTP redirect listener bound on {} (redirecting to port {})",
            local_addr, config.https_port
        );

        Ok(Self {
            listener,
            local_addr,
            router: redirect_router(challenges, config.https_port),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serve until `shutdown` is cancelled
    pub async fn serve(self, shutdown: CancellationToken) -> Result<(), RedirectError> {
        axum::serve(self.listener, self.router)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await?;

        info!("HTTP redirect listener on {} stopped", self.local_addr);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    async fn send(router: Router, request: Request<Body>) -> Response {
        router.oneshot(request).await.unwrap()
    }

    #[test]
    fn test_strip_port() {
        assert_eq!(strip_port("tiles.example.com"), "tiles.example.com");
        assert_eq!(strip_port("tiles.example.com:8082"), "tiles.example.com");
        assert_eq!(strip_port("[::1]:8082"), "[::1]");
        assert_eq!(strip_port("[::1]"), "[::1]");
        assert_eq!(strip_port("host:"), "host:");
    }

    #[test]
    fn test_https_location() {
        assert_eq!(
            https_location("a.example.com", 443, "/x?y=1"),
            "https://a.example.com/x?y=1"
        );
        assert_eq!(
            https_location("a.example.com", 8443, "/"),
            "https://a.example.com:8443/"
        );
    }

    #[tokio::test]
    async fn test_redirect_keeps_path_and_query() {
        let router = redirect_router(ChallengeManager::new(), 8443);
        let request = Request::builder()
            .uri("/api/v1/tile/3/2/1?fresh=1")
            .header(HOST, "tiles.example.com:8082")
            .body(Body::empty())
            .unwrap();

        let response = send(router, request).await;
        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(
            response.headers()[LOCATION],
            "https://tiles.example.com:8443/api/v1/tile/3/2/1?fresh=1"
        );
    }

    #[tokio::test]
    async fn test_missing_host_is_bad_request() {
        let router = redirect_router(ChallengeManager::new(), 443);
        let request = Request::builder().uri("/").body(Body::empty()).unwrap();

        let response = send(router, request).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_challenge_lookup() {
        let challenges = ChallengeManager::new();
        challenges.add_challenge("tok", "tok.thumb");
        let router = redirect_router(challenges, 443);

        let hit = Request::builder()
            .uri("/.well-known/acme-challenge/tok")
            .header(HOST, "tiles.example.com")
            .body(Body::empty())
            .unwrap();
        let response = send(router.clone(), hit).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_TYPE], "text/plain");
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"tok.thumb");

        let miss = Request::builder()
            .uri("/.well-known/acme-challenge/other")
            .header(HOST, "tiles.example.com")
            .body(Body::empty())
            .unwrap();
        let response = send(router, miss).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
