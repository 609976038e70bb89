//! HTTPS serving: strict TLS configuration, server generations and their supervisor
pub mod generation;
pub mod server;
pub mod supervisor;
pub mod tls;

use thiserror::Error;

pub use generation::{GenerationService, ServerGeneration};
pub use server::SecureServer;
pub use supervisor::{GenerationHandle, ServerSupervisor, StopOutcome};
pub use tls::{strict_server_config, MaterialResolver};

/// HTTPS server errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Ports below 1024 need elevated privileges\n  • Try using a different address or port")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },

    #[error("TLS configuration error: {0}")]
    Tls(String),

    #[error("Server task ended abnormally: {0}")]
    Task(String),
}
