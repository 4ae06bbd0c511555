//! Per-vhost endpoint tables.
//!
//! # Responsibilities
//! - Register one handler per (path, method) declared by a vhost
//! - Register WebSocket endpoints for every method (the upgrade is a GET)
//! - Attach the composed CORS chain to each endpoint
//!
//! # Design Decisions
//! - Built once per policy snapshot, immutable afterwards
//! - Endpoints sharing a path are merged into one method router; overlaps
//!   are rejected by validation before the router is built

use std::sync::Arc;

use axum::{
    handler::Handler,
    http::{Method, StatusCode},
    routing::{any, on, MethodFilter, MethodRouter},
    Router,
};
use indexmap::IndexMap;

use crate::config::schema::{Endpoint, Vhost};
use crate::config::validation::ValidationError;
use crate::http::cors::{CorsChain, CorsLayer, CorsRules};
use crate::http::proxy::{self, HttpClient, HttpRoute};
use crate::http::websocket::{self, WebSocketRoute};
use crate::net::connection::SessionTracker;

/// Shared collaborators every relay handler needs.
#[derive(Clone)]
pub struct RelayContext {
    pub client: HttpClient,
    pub identifier: Arc<str>,
    pub sessions: SessionTracker,
}

/// Parse a configured method name (case-insensitive).
pub fn method_filter(name: &str) -> Option<MethodFilter> {
    let method = Method::from_bytes(name.trim().to_ascii_uppercase().as_bytes()).ok()?;
    MethodFilter::try_from(method).ok()
}

/// Check a path against the router's syntax.
///
/// Paths start with `/`; captures are whole segments written `{name}`, and
/// a `{*name}` catch-all may only be the last segment.
pub fn check_path(path: &str) -> Result<(), &'static str> {
    let Some(rest) = path.strip_prefix('/') else {
        return Err("must start with '/'");
    };
    let segments: Vec<&str> = rest.split('/').collect();
    for (i, segment) in segments.iter().enumerate() {
        if segment.starts_with(':') {
            return Err("colon parameters are not supported, use {name}");
        }
        if segment.starts_with('*') {
            return Err("wildcards must be written {*name}");
        }
        if !segment.contains(['{', '}']) {
            continue;
        }
        let Some(inner) = segment.strip_prefix('{').and_then(|s| s.strip_suffix('}')) else {
            return Err("captures must span a whole segment");
        };
        let name = inner.strip_prefix('*').unwrap_or(inner);
        if name.is_empty() || name.contains(['{', '}', '*']) {
            return Err("capture names must be non-empty identifiers");
        }
        if inner.starts_with('*') && i + 1 != segments.len() {
            return Err("a catch-all capture must be the last segment");
        }
    }
    Ok(())
}

/// Path with capture names erased; two paths with the same shape collide
/// in the router even when their capture names differ.
pub fn route_shape(path: &str) -> String {
    path.split('/')
        .map(|segment| match segment.strip_prefix('{') {
            Some(inner) if inner.starts_with('*') => "{*}",
            Some(_) => "{}",
            None => segment,
        })
        .collect::<Vec<_>>()
        .join("/")
}

fn endpoint_filter(vhost: &str, endpoint: &Endpoint) -> Result<MethodFilter, ValidationError> {
    let mut filters = endpoint.methods.iter().map(|name| {
        method_filter(name).ok_or_else(|| ValidationError::UnknownMethod {
            vhost: vhost.to_string(),
            path: endpoint.path.clone(),
            method: name.clone(),
        })
    });
    let first = filters.next().ok_or_else(|| ValidationError::NoMethods {
        vhost: vhost.to_string(),
        path: endpoint.path.clone(),
    })??;
    filters.try_fold(first, |acc, next| Ok(acc.or(next?)))
}

/// The router answers HEAD through GET handlers; only endpoints that list
/// HEAD themselves should relay it.
fn declares_head(endpoint: &Endpoint) -> bool {
    endpoint
        .methods
        .iter()
        .any(|name| name.trim().eq_ignore_ascii_case("HEAD"))
}

/// Build the endpoint router for one vhost.
pub fn build_vhost_router(
    pattern: &str,
    vhost: &Vhost,
    context: &RelayContext,
) -> Result<Router, ValidationError> {
    let vhost_cors = vhost.cors.as_ref().map(CorsRules::compile);
    let mut paths: IndexMap<&str, MethodRouter> = IndexMap::new();

    for endpoint in &vhost.endpoints {
        let mut methods: MethodRouter = match &endpoint.websocket {
            Some(policy) => {
                let route = WebSocketRoute::new(
                    endpoint.backend.clone(),
                    policy.clone(),
                    context.sessions.clone(),
                );
                any(websocket::upgrade).with_state(Arc::new(route))
            }
            None => {
                let filter = endpoint_filter(pattern, endpoint)?;
                let route = HttpRoute::new(
                    endpoint.backend.clone(),
                    context.client.clone(),
                    context.identifier.clone(),
                )
                .answer_head(declares_head(endpoint));
                on(filter, proxy::relay).with_state(Arc::new(route))
            }
        };

        // Vhost rules first, endpoint rules last: the endpoint wins.
        let chain = CorsChain::new(
            vhost_cors
                .iter()
                .cloned()
                .chain(endpoint.cors.as_ref().map(CorsRules::compile)),
        );
        if !chain.is_empty() {
            methods = methods.layer(CorsLayer::new(chain));
        }

        let slot = paths
            .entry(endpoint.path.as_str())
            .or_insert_with(MethodRouter::new);
        *slot = std::mem::replace(slot, MethodRouter::new()).merge(methods);

        tracing::debug!(
            vhost = %pattern,
            path = %endpoint.path,
            websocket = endpoint.is_websocket(),
            backend = %endpoint.backend.url,
            "Endpoint registered"
        );
    }

    let router = paths
        .into_iter()
        .fold(Router::new(), |router, (path, methods)| router.route(path, methods));

    Ok(match vhost_cors {
        Some(rules) => router.fallback(not_found.layer(CorsLayer::new(CorsChain::new([rules])))),
        None => router.fallback(not_found),
    })
}

async fn not_found() -> (StatusCode, &'static str) {
    (StatusCode::NOT_FOUND, "Not found")
}
