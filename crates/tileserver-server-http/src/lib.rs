//! Plain-HTTP listener: ACME HTTP-01 responses and redirects to HTTPS
pub mod server;

pub use server::{redirect_router, RedirectConfig, RedirectError, RedirectListener};
