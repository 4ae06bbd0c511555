//! HTTP relay.
//!
//! # Responsibilities
//! - Resolve the backend URL for the inbound path
//! - Forward method, end-to-end headers and the streamed body
//! - Tag the `User-Agent` with the gateway identifier
//! - Bound the round trip, response body included, by the backend timeout
//! - Stream the backend response back unchanged
//!
//! # Design Decisions
//! - Exactly one attempt per request; the client never retries
//! - The inbound query string is not forwarded
//! - Response headers are copied verbatim, multi-value preserved

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{
        header::{self, HeaderMap, HeaderName, HeaderValue, InvalidHeaderValue},
        uri::InvalidUri,
        Method, Request, StatusCode, Uri,
    },
    response::{IntoResponse, Response},
};
use hyper::body::{Body as HttpBody, Frame, SizeHint};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use tokio::time::{Instant, Sleep};

use crate::config::schema::Backend;
use crate::observability::metrics;

/// Outbound client shared by every HTTP route of a gateway.
pub type HttpClient = Client<HttpsConnector<HttpConnector>, Body>;

/// Headers that describe a single hop and are never forwarded.
static HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    HeaderName::from_static("proxy-connection"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
];

/// Build the outbound client (`http` and `https`, HTTP/1.1 and HTTP/2).
pub fn upstream_client() -> Result<HttpClient, rustls::Error> {
    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let connector = HttpsConnectorBuilder::new()
        .with_provider_and_webpki_roots(provider)?
        .https_or_http()
        .enable_http1()
        .enable_http2()
        .build();

    Ok(Client::builder(TokioExecutor::new())
        .retry_canceled_requests(false)
        .build(connector))
}

/// Relay failure, mapped to the status the client sees.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("invalid backend url {url:?}: {source}")]
    InvalidUri {
        url: String,
        #[source]
        source: InvalidUri,
    },

    #[error("backend url {0:?} has no scheme or authority")]
    MissingScheme(String),

    #[error("invalid user agent: {0}")]
    InvalidUserAgent(#[from] InvalidHeaderValue),

    #[error("backend request failed: {0}")]
    Transport(#[from] hyper_util::client::legacy::Error),

    #[error("backend did not answer within {0:?}")]
    Timeout(Duration),
}

impl RelayError {
    /// Phase label used in logs and metrics.
    pub fn phase(&self) -> &'static str {
        match self {
            RelayError::InvalidUri { .. }
            | RelayError::MissingScheme(_)
            | RelayError::InvalidUserAgent(_) => "build",
            RelayError::Transport(_) | RelayError::Timeout(_) => "call",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self.phase() {
            "build" => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let message = match self.status() {
            StatusCode::BAD_GATEWAY => "Error calling backend service",
            _ => "Error creating request to backend service",
        };
        (self.status(), message).into_response()
    }
}

/// Handler state for one HTTP endpoint.
pub struct HttpRoute {
    backend: Backend,
    client: HttpClient,
    identifier: Arc<str>,
    head: bool,
}

impl HttpRoute {
    pub fn new(backend: Backend, client: HttpClient, identifier: Arc<str>) -> Self {
        Self {
            backend,
            client,
            identifier,
            head: false,
        }
    }

    /// Relay HEAD requests instead of answering them with 405.
    pub fn answer_head(mut self, allowed: bool) -> Self {
        self.head = allowed;
        self
    }

    /// Perform the backend round trip for one request.
    pub async fn forward(&self, request: Request<Body>) -> Result<Response, RelayError> {
        let (parts, body) = request.into_parts();

        let url = self.backend.resolve_url(parts.uri.path());
        let uri: Uri = url.parse().map_err(|source| RelayError::InvalidUri {
            url: url.clone(),
            source,
        })?;
        if uri.scheme().is_none() || uri.authority().is_none() {
            return Err(RelayError::MissingScheme(url));
        }

        let mut headers = HeaderMap::with_capacity(parts.headers.len());
        forward_headers(&parts.headers, &mut headers);
        headers.insert(
            header::USER_AGENT,
            user_agent(parts.headers.get(header::USER_AGENT), &self.identifier)?,
        );

        let mut outbound = Request::new(body);
        *outbound.method_mut() = parts.method;
        *outbound.uri_mut() = uri;
        *outbound.headers_mut() = headers;

        tracing::debug!(backend = %url, method = %outbound.method(), "Forwarding request");

        let call = self.client.request(outbound);
        let Some(limit) = self.backend.timeout() else {
            let (parts, body) = call.await?.into_parts();
            return Ok(Response::from_parts(parts, Body::new(body)));
        };

        let deadline = Instant::now() + limit;
        let response = tokio::time::timeout_at(deadline, call)
            .await
            .map_err(|_| RelayError::Timeout(limit))??;
        let (parts, body) = response.into_parts();
        let body = DeadlineBody::new(Body::new(body), deadline, limit);
        Ok(Response::from_parts(parts, Body::new(body)))
    }
}

/// Response body that fails once the round-trip deadline has passed.
struct DeadlineBody {
    inner: Body,
    deadline: Pin<Box<Sleep>>,
    limit: Duration,
}

impl DeadlineBody {
    fn new(inner: Body, deadline: Instant, limit: Duration) -> Self {
        Self {
            inner,
            deadline: Box::pin(tokio::time::sleep_until(deadline)),
            limit,
        }
    }
}

impl HttpBody for DeadlineBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, axum::Error>>> {
        let this = self.get_mut();
        if let Poll::Ready(frame) = Pin::new(&mut this.inner).poll_frame(cx) {
            return Poll::Ready(frame);
        }
        match this.deadline.as_mut().poll(cx) {
            Poll::Ready(()) => {
                tracing::warn!(timeout = ?this.limit, "Backend response body cut off at deadline");
                metrics::record_upstream_error("call");
                Poll::Ready(Some(Err(axum::Error::new(RelayError::Timeout(this.limit)))))
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

/// Axum handler relaying one request to the route's backend.
pub async fn relay(State(route): State<Arc<HttpRoute>>, request: Request<Body>) -> Response {
    if request.method() == Method::HEAD && !route.head {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }
    match route.forward(request).await {
        Ok(response) => response,
        Err(e) => {
            let phase = e.phase();
            tracing::error!(
                phase,
                backend = %route.backend.url,
                error = %e,
                "Relay to backend failed"
            );
            metrics::record_upstream_error(phase);
            e.into_response()
        }
    }
}

/// Copy end-to-end headers: hop-by-hop headers, the names listed in
/// `Connection` and `Host` are dropped.
pub fn forward_headers(inbound: &HeaderMap, outbound: &mut HeaderMap) {
    let listed: Vec<HeaderName> = inbound
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for (name, value) in inbound {
        if name == header::HOST
            || name == header::UPGRADE
            || HOP_BY_HOP.contains(name)
            || listed.contains(name)
        {
            continue;
        }
        outbound.append(name.clone(), value.clone());
    }
}

/// `"<inbound> via <identifier>"`; without an inbound value, just the suffix.
pub fn user_agent(
    inbound: Option<&HeaderValue>,
    identifier: &str,
) -> Result<HeaderValue, InvalidHeaderValue> {
    let mut value = inbound.map(|v| v.as_bytes().to_vec()).unwrap_or_default();
    value.extend_from_slice(b" via ");
    value.extend_from_slice(identifier.as_bytes());
    HeaderValue::from_bytes(&value)
}
