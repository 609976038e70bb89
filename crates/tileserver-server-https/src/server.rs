//! HTTPS server implementation

use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use tracing::{debug, info};

use crate::generation::{GenerationService, ServerGeneration};
use crate::ServerError;

const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Serves the application router over TLS, one generation per call
#[derive(Clone)]
pub struct SecureServer {
    router: Router,
    drain_timeout: Duration,
}

impl SecureServer {
    pub fn new(router: Router) -> Self {
        Self {
            router,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }

    /// How long in-flight requests get once the generation is cancelled
    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }
}

/// Closes every connection of the generation when dropped, so aborting the
/// serving task also ends requests still in flight
struct ShutdownOnDrop(Handle);

impl Drop for ShutdownOnDrop {
    fn drop(&mut self) {
        self.0.shutdown();
    }
}

#[async_trait]
impl GenerationService for SecureServer {
    async fn serve(&self, generation: ServerGeneration) -> Result<(), ServerError> {
        let bind_addr = generation.bind_addr;
        let listener = std::net::TcpListener::bind(bind_addr).map_err(|e| {
            let port = bind_addr.port();
            let address = bind_addr.ip().to_string();
            let reason = e.to_string();
            ServerError::BindError {
                address,
                port,
                reason,
            }
        })?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let handle = Handle::new();
        let _close_connections = ShutdownOnDrop(handle.clone());
        let watcher = {
            let handle = handle.clone();
            let shutdown = generation.shutdown.clone();
            let drain_timeout = self.drain_timeout;
            tokio::spawn(async move {
                shutdown.cancelled().await;
                debug!("Draining HTTPS connections for up to {:?}", drain_timeout);
                handle.graceful_shutdown(Some(drain_timeout));
            })
        };

        info!(
            generation = generation.id,
            renewals = generation.renewals,
            "HTTPS server listening on {}",
            local_addr
        );

        let config = RustlsConfig::from_config(generation.tls_config.clone());
        let result = axum_server::from_tcp_rustls(listener, config)
            .handle(handle)
            .serve(self.router.clone().into_make_service())
            .await;

        watcher.abort();
        result?;

        info!(generation = generation.id, "HTTPS server on {} stopped", local_addr);
        Ok(())
    }
}
