//! Host resolution.
//!
//! # Responsibilities
//! - Keep vhost patterns in an explicit precedence order
//! - Strip the `:port` suffix from the request authority
//! - Dispatch the request to the first matching vhost sub-router
//!
//! # Precedence
//! Patterns are ordered, not hashed:
//! 1. literal patterns (no wildcard) before wildcard patterns
//! 2. more literal characters before fewer
//! 3. declaration order as the stable tie-break
//!
//! So `api.example.com` beats `*.example.com`, which beats `*`, no matter
//! how the configuration lists them.

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    response::{IntoResponse, Response},
    Router,
};
use tower::ServiceExt;

use crate::routing::pattern::HostPattern;

/// Per-request routing failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    #[error("no vhost matches host {0:?}")]
    HostNotFound(String),
}

impl IntoResponse for RouteError {
    fn into_response(self) -> Response {
        match self {
            RouteError::HostNotFound(_) => (StatusCode::NOT_FOUND, "Host not found").into_response(),
        }
    }
}

/// Ordered table of host patterns.
#[derive(Debug, Clone)]
pub struct HostTable<T> {
    entries: Vec<(HostPattern, T)>,
}

impl<T> Default for HostTable<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<T> HostTable<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert keeping the table sorted by precedence; equal precedence
    /// lands after existing entries.
    pub fn insert(&mut self, pattern: HostPattern, value: T) {
        let rank = pattern.precedence();
        let at = self
            .entries
            .partition_point(|(existing, _)| existing.precedence() <= rank);
        self.entries.insert(at, (pattern, value));
    }

    /// First entry whose pattern matches `host` exactly as given.
    pub fn resolve(&self, host: &str) -> Option<(&HostPattern, &T)> {
        self.entries
            .iter()
            .find(|(pattern, _)| pattern.matches(host))
            .map(|(pattern, value)| (pattern, value))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Strip a `:port` suffix from an authority.
///
/// Bracketed IPv6 literals are unwrapped (`[::1]:80` → `::1`). When the
/// value has no port, or cannot be split, it is returned unchanged.
pub fn strip_port(authority: &str) -> &str {
    if let Some(rest) = authority.strip_prefix('[') {
        return match rest.split_once(']') {
            Some((host, after)) if after.starts_with(':') => host,
            _ => authority,
        };
    }
    match authority.rsplit_once(':') {
        Some((host, _port)) if !host.contains(':') => host,
        _ => authority,
    }
}

/// Authority of a request: the `Host` header, or the URI authority for
/// HTTP/2 requests that only carry `:authority`.
pub fn request_authority(request: &Request<Body>) -> Option<&str> {
    request
        .headers()
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| request.uri().authority().map(|a| a.as_str()))
}

/// Maps request hosts to vhost sub-routers.
#[derive(Debug, Clone, Default)]
pub struct VhostRouter {
    hosts: HostTable<Router>,
}

impl VhostRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, pattern: HostPattern, router: Router) {
        self.hosts.insert(pattern, router);
    }

    /// Resolve an authority (port allowed) to its vhost router.
    pub fn route(&self, authority: &str) -> Result<&Router, RouteError> {
        let host = strip_port(authority);
        self.hosts
            .resolve(host)
            .map(|(_, router)| router)
            .ok_or_else(|| RouteError::HostNotFound(host.to_string()))
    }

    /// Hand the request to the matching vhost, or answer 404.
    pub async fn dispatch(&self, request: Request<Body>) -> Response {
        let authority = request_authority(&request).unwrap_or_default();
        let router = match self.route(authority) {
            Ok(router) => router.clone(),
            Err(e) => {
                tracing::warn!(error = %e, "Host not found");
                return e.into_response();
            }
        };

        match router.oneshot(request).await {
            Ok(response) => response,
            Err(never) => match never {},
        }
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}
