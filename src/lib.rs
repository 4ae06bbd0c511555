//! API gateway library.
//!
//! Routes requests by virtual host, path and method to HTTP or WebSocket
//! backends, applies cascading CORS rules and terminates TLS with a
//! certificate picked per handshake.

pub mod config;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod routing;

pub use config::schema::GatewayConfig;
pub use http::HttpServer;
pub use lifecycle::Shutdown;
