//! Cascading CORS middleware.
//!
//! # Responsibilities
//! - Compile a `CorsPolicy` into matchable rules
//! - Evaluate every layer of a chain (vhost first, endpoint last) against
//!   the request, later layers overwriting earlier ones header by header
//! - Answer preflight requests without reaching the inner service
//! - Stamp the resulting headers on the actual response
//!
//! # Defaults
//! An empty origin list allows every origin; an empty method list allows
//! `GET, POST, HEAD`; an empty header list allows
//! `Origin, Accept, Content-Type, X-Requested-With`.

use std::sync::Arc;
use std::task::{Context, Poll};

use axum::{
    body::Body,
    http::{header, HeaderMap, HeaderName, HeaderValue, Method, Request, StatusCode},
    response::Response,
};
use futures_util::future::BoxFuture;
use tower::{Layer, Service};

use crate::config::schema::CorsPolicy;

const DEFAULT_METHODS: [&str; 3] = ["GET", "POST", "HEAD"];
const DEFAULT_HEADERS: [&str; 4] = ["origin", "accept", "content-type", "x-requested-with"];

static PREFLIGHT_VARY: [HeaderName; 3] = [
    header::ORIGIN,
    header::ACCESS_CONTROL_REQUEST_METHOD,
    header::ACCESS_CONTROL_REQUEST_HEADERS,
];

/// One compiled CORS policy.
#[derive(Debug, Clone)]
pub struct CorsRules {
    all_origins: bool,
    origins: Vec<String>,
    wildcard_origins: Vec<(String, String)>,
    methods: Vec<String>,
    all_headers: bool,
    headers: Vec<String>,
    exposed: Option<HeaderValue>,
    credentials: bool,
    max_age: u64,
}

impl CorsRules {
    pub fn compile(policy: &CorsPolicy) -> Self {
        let mut all_origins = policy.allowed_origins.is_empty();
        let mut origins = Vec::new();
        let mut wildcard_origins = Vec::new();
        for origin in &policy.allowed_origins {
            let origin = origin.trim().to_ascii_lowercase();
            if origin == "*" {
                all_origins = true;
            } else if let Some((prefix, suffix)) = origin.split_once('*') {
                wildcard_origins.push((prefix.to_string(), suffix.to_string()));
            } else {
                origins.push(origin);
            }
        }

        let methods = if policy.allowed_methods.is_empty() {
            DEFAULT_METHODS.iter().map(|m| m.to_string()).collect()
        } else {
            policy
                .allowed_methods
                .iter()
                .map(|m| m.trim().to_ascii_uppercase())
                .collect()
        };

        let mut headers: Vec<String> = if policy.allowed_headers.is_empty() {
            DEFAULT_HEADERS.iter().map(|h| h.to_string()).collect()
        } else {
            policy
                .allowed_headers
                .iter()
                .map(|h| h.trim().to_ascii_lowercase())
                .collect()
        };
        let all_headers = headers.iter().any(|h| h == "*");
        if !headers.iter().any(|h| h == "origin") {
            headers.push("origin".to_string());
        }

        let exposed = (!policy.exposed_headers.is_empty())
            .then(|| HeaderValue::from_str(&policy.exposed_headers.join(", ")).ok())
            .flatten();

        Self {
            all_origins,
            origins,
            wildcard_origins,
            methods,
            all_headers,
            headers,
            exposed,
            credentials: policy.allow_credentials,
            max_age: policy.max_age,
        }
    }

    pub fn allows_origin(&self, origin: &str) -> bool {
        if self.all_origins {
            return true;
        }
        let origin = origin.to_ascii_lowercase();
        self.origins.iter().any(|o| *o == origin)
            || self.wildcard_origins.iter().any(|(prefix, suffix)| {
                origin.len() >= prefix.len() + suffix.len()
                    && origin.starts_with(prefix.as_str())
                    && origin.ends_with(suffix.as_str())
            })
    }

    pub fn allows_method(&self, method: &str) -> bool {
        let method = method.to_ascii_uppercase();
        method == Method::OPTIONS.as_str() || self.methods.iter().any(|m| *m == method)
    }

    /// True when every comma-separated name in an
    /// `Access-Control-Request-Headers` value is allowed.
    pub fn allows_headers(&self, requested: &str) -> bool {
        self.all_headers
            || requested
                .split(',')
                .map(|h| h.trim().to_ascii_lowercase())
                .filter(|h| !h.is_empty())
                .all(|h| self.headers.contains(&h))
    }

    fn allow_origin_value(&self, origin: &HeaderValue) -> HeaderValue {
        if self.all_origins && !self.credentials {
            HeaderValue::from_static("*")
        } else {
            origin.clone()
        }
    }

    fn preflight(&self, request: &RequestView<'_>, out: &mut HeaderMap) {
        let Some((origin, origin_str)) = request.origin else {
            return;
        };
        let Some(method) = request.requested_method else {
            return;
        };
        let requested_headers = request.requested_headers.map(|(_, s)| s).unwrap_or("");
        if !self.allows_origin(origin_str)
            || !self.allows_method(method)
            || !self.allows_headers(requested_headers)
        {
            tracing::debug!(origin = origin_str, method, "CORS preflight not allowed");
            return;
        }

        out.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, self.allow_origin_value(origin));
        if let Ok(value) = HeaderValue::from_str(&method.to_ascii_uppercase()) {
            out.insert(header::ACCESS_CONTROL_ALLOW_METHODS, value);
        }
        if let Some((value, s)) = request.requested_headers {
            if !s.trim().is_empty() {
                out.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, value.clone());
            }
        }
        if self.credentials {
            out.insert(
                header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
                HeaderValue::from_static("true"),
            );
        }
        if self.max_age > 0 {
            out.insert(header::ACCESS_CONTROL_MAX_AGE, HeaderValue::from(self.max_age));
        }
    }

    fn actual(&self, request: &RequestView<'_>, out: &mut HeaderMap) {
        let Some((origin, origin_str)) = request.origin else {
            return;
        };
        if !self.allows_origin(origin_str) || !self.allows_method(request.method.as_str()) {
            tracing::debug!(origin = origin_str, method = %request.method, "CORS request not allowed");
            return;
        }

        out.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, self.allow_origin_value(origin));
        if let Some(exposed) = &self.exposed {
            out.insert(header::ACCESS_CONTROL_EXPOSE_HEADERS, exposed.clone());
        }
        if self.credentials {
            out.insert(
                header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
                HeaderValue::from_static("true"),
            );
        }
    }
}

/// The parts of a request CORS evaluation looks at.
struct RequestView<'a> {
    method: &'a Method,
    origin: Option<(&'a HeaderValue, &'a str)>,
    requested_method: Option<&'a str>,
    requested_headers: Option<(&'a HeaderValue, &'a str)>,
}

impl<'a> RequestView<'a> {
    fn new(method: &'a Method, headers: &'a HeaderMap) -> Self {
        let text = move |name: HeaderName| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok().map(|s| (v, s)))
        };
        Self {
            method,
            origin: text(header::ORIGIN),
            requested_method: text(header::ACCESS_CONTROL_REQUEST_METHOD).map(|(_, s)| s),
            requested_headers: text(header::ACCESS_CONTROL_REQUEST_HEADERS),
        }
    }

    fn is_preflight(&self) -> bool {
        *self.method == Method::OPTIONS && self.requested_method.is_some()
    }
}

/// Outcome of evaluating a chain against one request.
#[derive(Debug)]
pub struct CorsDecision {
    preflight: bool,
    headers: HeaderMap,
    vary: &'static [HeaderName],
}

impl CorsDecision {
    pub fn is_preflight(&self) -> bool {
        self.preflight
    }

    /// Write the decision onto a response, replacing CORS headers already
    /// present and merging `Vary`.
    pub fn apply(&self, target: &mut HeaderMap) {
        for (name, value) in &self.headers {
            target.insert(name.clone(), value.clone());
        }
        for token in self.vary {
            let present = target
                .get_all(header::VARY)
                .iter()
                .filter_map(|v| v.to_str().ok())
                .flat_map(|v| v.split(','))
                .any(|t| t.trim().eq_ignore_ascii_case(token.as_str()));
            if !present {
                target.append(header::VARY, HeaderValue::from(token.clone()));
            }
        }
    }

    /// Empty `200 OK` answer for a preflight request.
    pub fn into_preflight_response(self) -> Response {
        let mut response = Response::new(Body::empty());
        *response.status_mut() = StatusCode::OK;
        self.apply(response.headers_mut());
        response
    }
}

/// Ordered CORS layers; later entries win.
#[derive(Debug, Clone)]
pub struct CorsChain {
    layers: Arc<[CorsRules]>,
}

impl CorsChain {
    pub fn new(layers: impl IntoIterator<Item = CorsRules>) -> Self {
        Self {
            layers: layers.into_iter().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn evaluate(&self, method: &Method, headers: &HeaderMap) -> CorsDecision {
        let request = RequestView::new(method, headers);
        let preflight = request.is_preflight();
        let mut out = HeaderMap::new();
        for rules in self.layers.iter() {
            if preflight {
                rules.preflight(&request, &mut out);
            } else {
                rules.actual(&request, &mut out);
            }
        }
        CorsDecision {
            preflight,
            headers: out,
            vary: if preflight {
                &PREFLIGHT_VARY
            } else {
                &PREFLIGHT_VARY[..1]
            },
        }
    }
}

/// Layer applying a [`CorsChain`].
#[derive(Debug, Clone)]
pub struct CorsLayer {
    chain: CorsChain,
}

impl CorsLayer {
    pub fn new(chain: CorsChain) -> Self {
        Self { chain }
    }
}

impl<S> Layer<S> for CorsLayer {
    type Service = Cors<S>;

    fn layer(&self, inner: S) -> Self::Service {
        Cors {
            inner,
            chain: self.chain.clone(),
        }
    }
}

/// Service produced by [`CorsLayer`].
#[derive(Debug, Clone)]
pub struct Cors<S> {
    inner: S,
    chain: CorsChain,
}

impl<S> Service<Request<Body>> for Cors<S>
where
    S: Service<Request<Body>, Response = Response> + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Response, S::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<Body>) -> Self::Future {
        let decision = self.chain.evaluate(request.method(), request.headers());
        if decision.is_preflight() {
            return Box::pin(async move { Ok(decision.into_preflight_response()) });
        }

        let future = self.inner.call(request);
        Box::pin(async move {
            let mut response = future.await?;
            decision.apply(response.headers_mut());
            Ok(response)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        routing::{get, post},
        Router,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::ServiceExt;

    fn rules(origins: &[&str]) -> CorsRules {
        CorsRules::compile(&CorsPolicy {
            allowed_origins: origins.iter().map(|o| o.to_string()).collect(),
            ..Default::default()
        })
    }

    fn app(chain: CorsChain) -> Router {
        Router::new().route(
            "/",
            get(|| async { ([(header::ACCESS_CONTROL_ALLOW_ORIGIN, "https://backend.example")], "ok") })
                .layer(CorsLayer::new(chain)),
        )
    }

    async fn send(router: Router, request: Request<Body>) -> Response {
        router.oneshot(request).await.unwrap()
    }

    fn get_with_origin(origin: &str) -> Request<Body> {
        Request::builder()
            .uri("/")
            .header(header::ORIGIN, origin)
            .body(Body::empty())
            .unwrap()
    }

    fn acao(response: &Response) -> Option<&str> {
        response
            .headers()
            .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
            .and_then(|v| v.to_str().ok())
    }

    #[test]
    fn defaults_allow_simple_methods() {
        let r = rules(&[]);
        assert!(r.allows_origin("https://anything.example"));
        assert!(r.allows_method("get"));
        assert!(r.allows_method("HEAD"));
        assert!(!r.allows_method("DELETE"));
        assert!(r.allows_headers("Content-Type, X-Requested-With"));
        assert!(!r.allows_headers("Authorization"));
    }

    #[test]
    fn wildcard_origins_are_case_insensitive() {
        let r = rules(&["https://*.Example.com"]);
        assert!(r.allows_origin("https://api.example.com"));
        assert!(r.allows_origin("HTTPS://API.EXAMPLE.COM"));
        assert!(!r.allows_origin("https://example.org"));
        assert!(!r.allows_origin("http://api.example.com"));
    }

    #[tokio::test]
    async fn vhost_rules_override_backend_header() {
        let response = send(
            app(CorsChain::new([rules(&["https://a.com"])])),
            get_with_origin("https://a.com"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(acao(&response), Some("https://a.com"));
        assert_eq!(response.headers().get(header::VARY).unwrap(), "origin");
    }

    #[tokio::test]
    async fn disallowed_origin_keeps_backend_headers() {
        let response = send(
            app(CorsChain::new([rules(&["https://a.com"])])),
            get_with_origin("https://evil.com"),
        )
        .await;
        assert_eq!(acao(&response), Some("https://backend.example"));
    }

    #[tokio::test]
    async fn endpoint_layer_wins() {
        let vhost = CorsRules::compile(&CorsPolicy {
            allowed_origins: vec!["*".into()],
            allow_credentials: true,
            ..Default::default()
        });
        let endpoint = rules(&[]);
        let response = send(
            app(CorsChain::new([vhost, endpoint])),
            get_with_origin("https://a.com"),
        )
        .await;
        // The endpoint allows all origins without credentials: `*`.
        assert_eq!(acao(&response), Some("*"));
        // Headers only the vhost sets survive.
        assert_eq!(
            response
                .headers()
                .get(header::ACCESS_CONTROL_ALLOW_CREDENTIALS)
                .unwrap(),
            "true"
        );
    }

    #[tokio::test]
    async fn preflight_short_circuits() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let policy = CorsPolicy {
            allowed_origins: vec!["https://a.com".into()],
            allowed_methods: vec!["GET".into(), "PUT".into()],
            allowed_headers: vec!["X-Token".into()],
            max_age: 600,
            ..Default::default()
        };
        let router = Router::new().route(
            "/",
            post(move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                "ok"
            })
            .layer(CorsLayer::new(CorsChain::new([CorsRules::compile(&policy)]))),
        );

        let request = Request::builder()
            .method(Method::OPTIONS)
            .uri("/")
            .header(header::ORIGIN, "https://a.com")
            .header(header::ACCESS_CONTROL_REQUEST_METHOD, "put")
            .header(header::ACCESS_CONTROL_REQUEST_HEADERS, "x-token")
            .body(Body::empty())
            .unwrap();
        let response = send(router, request).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        let headers = response.headers();
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], "https://a.com");
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_METHODS], "PUT");
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_HEADERS], "x-token");
        assert_eq!(headers[header::ACCESS_CONTROL_MAX_AGE], "600");
        assert_eq!(headers.get_all(header::VARY).iter().count(), 3);

        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn rejected_preflight_has_no_allow_headers() {
        let request = Request::builder()
            .method(Method::OPTIONS)
            .uri("/")
            .header(header::ORIGIN, "https://a.com")
            .header(header::ACCESS_CONTROL_REQUEST_METHOD, "DELETE")
            .body(Body::empty())
            .unwrap();
        let response = send(app(CorsChain::new([rules(&[])])), request).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(acao(&response).is_none());
    }

    #[test]
    fn vary_is_merged_not_duplicated() {
        let chain = CorsChain::new([rules(&[])]);
        let mut request_headers = HeaderMap::new();
        request_headers.insert(header::ORIGIN, HeaderValue::from_static("https://a.com"));
        let decision = chain.evaluate(&Method::GET, &request_headers);

        let mut response_headers = HeaderMap::new();
        response_headers.insert(header::VARY, HeaderValue::from_static("Accept-Encoding, Origin"));
        decision.apply(&mut response_headers);
        assert_eq!(response_headers.get_all(header::VARY).iter().count(), 1);
    }
}
