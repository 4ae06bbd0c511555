//! Routing subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming Request (Host, path, method)
//!     → host.rs (strip port, first matching vhost pattern)
//!     → endpoint.rs (per-vhost path + method table)
//!     → Return: relay handler, 404 or 405
//!
//! Route Compilation (per policy snapshot):
//!     vhosts (declaration order)
//!     → pattern.rs (compile globs)
//!     → Sort by precedence
//!     → Build one endpoint router per vhost
//!     → Freeze as immutable VhostRouter
//! ```
//!
//! # Design Decisions
//! - Routes compiled per snapshot, immutable at runtime
//! - Deterministic: the same host always resolves to the same vhost

pub mod endpoint;
pub mod host;
pub mod pattern;

pub use endpoint::{build_vhost_router, RelayContext};
pub use host::{HostTable, RouteError, VhostRouter};
pub use pattern::{HostPattern, PatternError};
