//! TCP listener setup.
//!
//! # Responsibilities
//! - Normalize bare `:port` addresses to all interfaces
//! - Bind the listening socket

use std::net::SocketAddr;

use tokio::net::TcpListener;

/// Error type for listener operations.
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("invalid listen address {address:?}: {source}")]
    Address {
        address: String,
        #[source]
        source: std::net::AddrParseError,
    },

    #[error("failed to bind {address}: {source}")]
    Bind {
        address: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

/// Parse a listen address; `:1973` means every IPv4 interface.
pub fn listen_address(address: &str) -> Result<SocketAddr, ListenerError> {
    let normalized = match address.strip_prefix(':') {
        Some(port) => format!("0.0.0.0:{port}"),
        None => address.to_string(),
    };
    normalized.parse().map_err(|source| ListenerError::Address {
        address: address.to_string(),
        source,
    })
}

/// Bind the gateway's listening socket.
pub async fn bind(address: &str) -> Result<TcpListener, ListenerError> {
    let address = listen_address(address)?;
    let listener = TcpListener::bind(address)
        .await
        .map_err(|source| ListenerError::Bind { address, source })?;

    tracing::info!(address = %address, "Listening for connections");
    Ok(listener)
}
