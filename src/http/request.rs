//! Request metadata helpers.
//!
//! # Responsibilities
//! - Name the request-id header shared by the middleware stack
//! - Read the request id assigned to a request
//! - Determine the client address behind trusted proxy headers

use std::net::SocketAddr;

use axum::{
    extract::ConnectInfo,
    http::{HeaderMap, HeaderName, Request},
};

/// Header carrying the per-request correlation id.
pub const X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

const X_REAL_IP: HeaderName = HeaderName::from_static("x-real-ip");
const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

/// The request id set by the request-id layer, if any.
pub fn request_id(headers: &HeaderMap) -> Option<&str> {
    headers.get(X_REQUEST_ID).and_then(|v| v.to_str().ok())
}

/// Client address: `X-Real-IP`, else the first `X-Forwarded-For` entry,
/// else the socket peer.
pub fn client_addr<B>(request: &Request<B>) -> Option<String> {
    let headers = request.headers();
    let header = |name: HeaderName| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };

    header(X_REAL_IP)
        .or_else(|| {
            header(X_FORWARDED_FOR)
                .and_then(|v| v.split(',').next())
                .map(str::trim)
                .filter(|v| !v.is_empty())
        })
        .map(str::to_string)
        .or_else(|| {
            request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.to_string())
        })
}
