//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Every request:
//!     → logging.rs (http_request span, access record when the body ends)
//!     → metrics.rs (request counter and latency histogram)
//!
//! Relay failures and WebSocket sessions:
//!     → error events naming the failing phase
//!     → metrics.rs (upstream error counter, open-session gauge)
//! ```
//!
//! # Design Decisions
//! - Structured logging (JSON) for machine parsing
//! - Request ID flows through all subsystems via the request span
//! - Metrics are cheap (atomic increments)

pub mod logging;
pub mod metrics;

pub use logging::{access_log, init_tracing};
