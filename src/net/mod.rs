//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (bind, `:port` normalization)
//!     → tls.rs (optional handshake, certificate chosen by SNI)
//!     → Hand off to HTTP layer
//!
//! Upgraded WebSocket sessions:
//!     → connection.rs (session ids, open-session tracking)
//! ```
//!
//! # Design Decisions
//! - TLS is all-or-nothing per listener
//! - Every relayed session is tracked for graceful shutdown

pub mod connection;
pub mod listener;
pub mod tls;

pub use connection::{SessionGuard, SessionId, SessionTracker};
pub use listener::{bind, listen_address, ListenerError};
pub use tls::{CertificateSelector, SniResolver, TlsError};
