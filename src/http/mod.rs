//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP/TLS connection
//!     → server.rs (request ID, access log, panic recovery, snapshot pin)
//!     → [routing layer picks vhost and endpoint]
//!     → cors.rs (preflight answer, response headers)
//!     → proxy.rs (one backend round trip, streamed body)
//!       or websocket.rs (upgrade, dial, bidirectional relay)
//!     → Send to client
//! ```

pub mod cors;
pub mod proxy;
pub mod request;
pub mod server;
pub mod websocket;

pub use cors::{CorsChain, CorsLayer, CorsRules};
pub use proxy::{upstream_client, HttpClient, HttpRoute, RelayError};
pub use request::X_REQUEST_ID;
pub use server::{Gateway, HttpServer, ReloadHandle, ServerError};
pub use websocket::WebSocketRoute;
