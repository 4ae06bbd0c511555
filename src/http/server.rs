//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Build a routing snapshot (`Gateway`) from a validated configuration
//! - Wire up middleware (request ID, access log, panic recovery)
//! - Serve plain HTTP or TLS with SNI certificate selection
//! - Swap snapshots on reload without touching in-flight requests

use std::any::Any;
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    Router,
};
use axum_server::tls_rustls::RustlsConfig;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower::ServiceBuilder;
use tower_http::{
    catch_panic::CatchPanicLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
};

use crate::config::schema::GatewayConfig;
use crate::config::validation::{validate_config, ValidationError};
use crate::http::proxy::{upstream_client, HttpClient};
use crate::lifecycle::Shutdown;
use crate::net::connection::SessionTracker;
use crate::net::tls::{server_config, CertificateSelector, SniResolver};
use crate::observability::access_log;
use crate::routing::{build_vhost_router, HostPattern, PatternError, RelayContext, VhostRouter};

/// How long in-flight requests may drain after shutdown is triggered.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Error type for building or running the server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Pattern(#[from] PatternError),

    #[error("invalid configuration: {}", join(.0))]
    Invalid(Vec<ValidationError>),

    #[error(transparent)]
    Route(#[from] ValidationError),

    #[error("TLS setup failed: {0}")]
    Tls(#[from] rustls::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("reload would change TLS mode (tls = {enabled}); restart the gateway instead")]
    TlsModeChange { enabled: bool },
}

fn join(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// One immutable routing snapshot.
#[derive(Debug)]
pub struct Gateway {
    vhosts: VhostRouter,
}

impl Gateway {
    /// Validate `config` and build every vhost router.
    pub fn build(config: &GatewayConfig, context: &RelayContext) -> Result<Self, ServerError> {
        validate_config(config).map_err(ServerError::Invalid)?;

        let mut vhosts = VhostRouter::new();
        for (pattern, vhost) in &config.vhosts {
            let router = build_vhost_router(pattern, vhost, context)?;
            vhosts.insert(HostPattern::parse(pattern)?, router);
        }
        Ok(Self { vhosts })
    }

    pub fn vhost_count(&self) -> usize {
        self.vhosts.len()
    }

    pub async fn dispatch(&self, request: Request) -> Response {
        self.vhosts.dispatch(request).await
    }
}

async fn dispatch(State(current): State<Arc<ArcSwap<Gateway>>>, request: Request) -> Response {
    // Pin the snapshot for the whole request; a reload does not affect it.
    let gateway = current.load_full();
    gateway.dispatch(request).await
}

/// Swaps in new snapshots built from reloaded configurations.
#[derive(Clone)]
pub struct ReloadHandle {
    gateway: Arc<ArcSwap<Gateway>>,
    certificates: Arc<ArcSwap<CertificateSelector>>,
    client: HttpClient,
    sessions: SessionTracker,
    tls: bool,
}

impl ReloadHandle {
    fn context(&self, config: &GatewayConfig) -> RelayContext {
        RelayContext {
            client: self.client.clone(),
            identifier: Arc::from(config.identifier()),
            sessions: self.sessions.clone(),
        }
    }

    /// Build and publish a snapshot for `config`.
    ///
    /// On error the current snapshot stays in place.
    pub fn apply(&self, config: &GatewayConfig) -> Result<(), ServerError> {
        if config.uses_tls() != self.tls {
            return Err(ServerError::TlsModeChange {
                enabled: config.uses_tls(),
            });
        }
        let gateway = Gateway::build(config, &self.context(config))?;
        let certificates = CertificateSelector::from_config(config)?;

        let vhosts = gateway.vhost_count();
        self.gateway.store(Arc::new(gateway));
        self.certificates.store(Arc::new(certificates));
        tracing::info!(vhosts, gateway = %config.identifier(), "Configuration applied");
        Ok(())
    }

    /// Apply every configuration received on `updates`.
    pub async fn watch(self, mut updates: mpsc::UnboundedReceiver<GatewayConfig>) {
        while let Some(config) = updates.recv().await {
            if let Err(e) = self.apply(&config) {
                tracing::error!(error = %e, "Reload rejected, keeping current configuration");
            }
        }
    }
}

/// Request ID, access log and panic recovery around `router`.
fn with_middleware(router: Router) -> Router {
    router.layer(
        ServiceBuilder::new()
            .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
            .layer(PropagateRequestIdLayer::x_request_id())
            .layer(middleware::from_fn(access_log))
            .layer(CatchPanicLayer::custom(panic_response)),
    )
}

fn panic_response(payload: Box<dyn Any + Send + 'static>) -> Response {
    let detail = payload
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| payload.downcast_ref::<&str>().copied())
        .unwrap_or("non-string panic payload");
    tracing::error!(panic = detail, "Request handler panicked");
    (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error").into_response()
}

/// HTTP server for the gateway.
pub struct HttpServer {
    handle: ReloadHandle,
}

impl HttpServer {
    /// Create a server from a configuration.
    pub fn new(config: &GatewayConfig) -> Result<Self, ServerError> {
        let client = upstream_client()?;
        let sessions = SessionTracker::new();
        let context = RelayContext {
            client: client.clone(),
            identifier: Arc::from(config.identifier()),
            sessions: sessions.clone(),
        };
        let gateway = Gateway::build(config, &context)?;
        let certificates = CertificateSelector::from_config(config)?;

        tracing::info!(
            vhosts = gateway.vhost_count(),
            tls = config.uses_tls(),
            gateway = %config.identifier(),
            "Gateway built"
        );

        Ok(Self {
            handle: ReloadHandle {
                gateway: Arc::new(ArcSwap::from_pointee(gateway)),
                certificates: Arc::new(ArcSwap::from_pointee(certificates)),
                client,
                sessions,
                tls: config.uses_tls(),
            },
        })
    }

    pub fn sessions(&self) -> SessionTracker {
        self.handle.sessions.clone()
    }

    pub fn reload_handle(&self) -> ReloadHandle {
        self.handle.clone()
    }

    /// The complete request pipeline.
    pub fn router(&self) -> Router {
        with_middleware(
            Router::new()
                .fallback(dispatch)
                .with_state(Arc::clone(&self.handle.gateway)),
        )
    }

    /// Serve until `shutdown` fires, then drain for up to [`DRAIN_TIMEOUT`].
    pub async fn run(self, listener: TcpListener, shutdown: Shutdown) -> Result<(), ServerError> {
        let address = listener.local_addr()?;
        let app = self
            .router()
            .into_make_service_with_connect_info::<SocketAddr>();

        if self.handle.tls {
            let resolver = Arc::new(SniResolver::new(Arc::clone(&self.handle.certificates)));
            let tls = RustlsConfig::from_config(Arc::new(server_config(resolver)?));

            let handle = axum_server::Handle::new();
            tokio::spawn({
                let handle = handle.clone();
                let shutdown = shutdown.clone();
                async move {
                    shutdown.wait().await;
                    handle.graceful_shutdown(Some(DRAIN_TIMEOUT));
                }
            });

            tracing::info!(address = %address, tls = true, "Gateway serving");
            axum_server::from_tcp_rustls(listener.into_std()?, tls)
                .handle(handle)
                .serve(app)
                .await?;
        } else {
            tracing::info!(address = %address, tls = false, "Gateway serving");
            let graceful = {
                let shutdown = shutdown.clone();
                async move { shutdown.wait().await }
            };
            let serve = axum::serve(listener, app)
                .with_graceful_shutdown(graceful)
                .into_future();
            let deadline = async {
                shutdown.wait().await;
                tokio::time::sleep(DRAIN_TIMEOUT).await;
            };

            tokio::select! {
                result = serve => result?,
                _ = deadline => {
                    tracing::warn!(timeout = ?DRAIN_TIMEOUT, "Drain timed out, dropping remaining connections");
                }
            }
        }

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::header;
    use axum::routing::get;
    use tower::ServiceExt;

    fn config(value: serde_json::Value) -> GatewayConfig {
        serde_json::from_value(value).unwrap()
    }

    fn plain() -> GatewayConfig {
        config(serde_json::json!({
            "apiGateway": { "name": "edge", "version": "1" },
            "vhosts": {
                "api.example.com": {
                    "endpoints": [{
                        "path": "/users",
                        "methods": ["GET"],
                        "backend": { "url": "http://127.0.0.1:9${path}" }
                    }]
                }
            }
        }))
    }

    fn request(host: &str, path: &str) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .uri(path)
            .header(header::HOST, host)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn unknown_host_and_path_are_distinct_404s() {
        let server = HttpServer::new(&plain()).unwrap();

        let response = server
            .router()
            .oneshot(request("other.org", "/users"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(response.headers().contains_key("x-request-id"));
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"Host not found");

        let response = server
            .router()
            .oneshot(request("api.example.com", "/nope"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"Not found");
    }

    #[tokio::test]
    async fn wrong_method_is_405() {
        let server = HttpServer::new(&plain()).unwrap();
        let mut req = request("api.example.com", "/users");
        *req.method_mut() = axum::http::Method::DELETE;
        let response = server.router().oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn reload_swaps_snapshot() {
        let server = HttpServer::new(&plain()).unwrap();
        let router = server.router();

        let mut next = plain();
        let vhost = next.vhosts.shift_remove("api.example.com").unwrap();
        next.vhosts.insert("new.example.com".into(), vhost);
        server.reload_handle().apply(&next).unwrap();

        let response = router
            .clone()
            .oneshot(request("api.example.com", "/nope"))
            .await
            .unwrap();
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"Host not found");

        let response = router
            .oneshot(request("new.example.com", "/nope"))
            .await
            .unwrap();
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"Not found");
    }

    #[tokio::test]
    async fn handler_panic_is_500_and_server_keeps_serving() {
        let router = with_middleware(
            Router::new()
                .route("/boom", get(|| async { panic!("handler blew up") as &'static str }))
                .route("/ok", get(|| async { "still here" })),
        );

        let response = router
            .clone()
            .oneshot(request("api.example.com", "/boom"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(response.headers().contains_key("x-request-id"));
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"Internal server error");

        let response = router
            .oneshot(request("api.example.com", "/ok"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn panic_payload_is_reported() {
        let response = panic_response(Box::new(String::from("owned")));
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let response = panic_response(Box::new(42u8));
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn overlapping_routes_are_rejected_and_reload_recovers() {
        let server = HttpServer::new(&plain()).unwrap();
        let handle = server.reload_handle();
        let router = server.router();

        let mut overlapping = plain();
        let mut catch_all = overlapping.vhosts["api.example.com"].endpoints[0].clone();
        overlapping.vhosts["api.example.com"].endpoints[0].path = "/users/{id}".into();
        catch_all.path = "/users/{*rest}".into();
        overlapping.vhosts["api.example.com"].endpoints.push(catch_all);
        assert!(matches!(handle.apply(&overlapping), Err(ServerError::Invalid(_))));

        let mut next = plain();
        next.vhosts["api.example.com"].endpoints[0].path = "/accounts".into();
        handle.apply(&next).unwrap();

        let response = router
            .oneshot(request("api.example.com", "/users"))
            .await
            .unwrap();
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"Not found");
    }

    #[test]
    fn reload_rejects_invalid_and_tls_flip() {
        let server = HttpServer::new(&plain()).unwrap();
        let handle = server.reload_handle();

        let mut broken = plain();
        broken.vhosts["api.example.com"].endpoints[0].path = "users".into();
        assert!(matches!(handle.apply(&broken), Err(ServerError::Invalid(_))));

        let mut tls = plain();
        tls.vhosts["api.example.com"].tls = Some(serde_json::from_value(serde_json::json!({
            "cert": "/nonexistent/cert.pem",
            "key": "/nonexistent/key.pem"
        })).unwrap());
        assert!(matches!(
            handle.apply(&tls),
            Err(ServerError::TlsModeChange { enabled: true })
        ));
    }
}
