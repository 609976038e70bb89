//! One incarnation of the secure listener

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use rustls::ServerConfig;
use tokio_util::sync::CancellationToken;

use crate::ServerError;

/// Everything a secure listener needs for one run.
///
/// A new generation is created at startup and after each renewal; at most
/// one is live at a time.
#[derive(Debug, Clone)]
pub struct ServerGeneration {
    pub id: u64,
    pub bind_addr: SocketAddr,
    pub tls_config: Arc<ServerConfig>,
    /// Cancelled when the generation must stop accepting
    pub shutdown: CancellationToken,
    /// Renewals completed when this generation was created
    pub renewals: u64,
}

impl ServerGeneration {
    pub fn new(id: u64, bind_addr: SocketAddr, tls_config: Arc<ServerConfig>, renewals: u64) -> Self {
        Self {
            id,
            bind_addr,
            tls_config,
            shutdown: CancellationToken::new(),
            renewals,
        }
    }
}

/// Runs a generation: bind, serve until its token is cancelled, release the socket
#[async_trait]
pub trait GenerationService: Send + Sync {
    async fn serve(&self, generation: ServerGeneration) -> Result<(), ServerError>;
}
