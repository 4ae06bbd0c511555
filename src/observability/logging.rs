//! Structured logging.
//!
//! # Responsibilities
//! - Initialize the tracing subscriber
//! - Open one `http_request` span per request
//! - Emit one access record per request once its body has been sent
//!
//! # Design Decisions
//! - Uses tracing crate for structured logging
//! - JSON format for production, pretty format for development
//! - Log level from `RUST_LOG`, else from configuration
//! - The access record is written when the response body ends or is
//!   dropped, so `bytes` and `duration_ms` cover the streamed body

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use axum::{
    body::{Body, Bytes},
    extract::Request,
    middleware::Next,
    response::Response,
};
use hyper::body::{Body as HttpBody, Frame, SizeHint};
use tracing::{Instrument, Span};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::schema::LogFormat;
use crate::http::request::{client_addr, request_id};
use crate::observability::metrics;

/// Install the global subscriber. Call once, from the binary.
pub fn init_tracing(format: LogFormat, default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(false),
            )
            .init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer().pretty()).init(),
    }
}

/// Access-log middleware.
pub async fn access_log(request: Request, next: Next) -> Response {
    let started = Instant::now();
    let method = request.method().to_string();
    let url = request.uri().to_string();
    let remote_addr = client_addr(&request).unwrap_or_else(|| "-".to_string());
    let request_id = request_id(request.headers()).unwrap_or("-").to_string();

    let span = tracing::info_span!("http_request", request_id = %request_id);
    let response = next.run(request).instrument(span.clone()).await;

    let record = AccessRecord {
        method,
        url,
        remote_addr,
        request_id,
        status: response.status().as_u16(),
        started,
        span,
    };
    let (parts, body) = response.into_parts();
    Response::from_parts(
        parts,
        Body::new(LoggedBody {
            inner: body,
            bytes: 0,
            record: Some(record),
        }),
    )
}

struct AccessRecord {
    method: String,
    url: String,
    remote_addr: String,
    request_id: String,
    status: u16,
    started: Instant,
    span: Span,
}

impl AccessRecord {
    fn emit(self, bytes: u64) {
        let elapsed = self.started.elapsed();
        let _entered = self.span.enter();
        tracing::info!(
            method = %self.method,
            url = %self.url,
            remote_addr = %self.remote_addr,
            status = self.status,
            bytes,
            duration_ms = elapsed.as_secs_f64() * 1000.0,
            request_id = %self.request_id,
            "Request completed"
        );
        metrics::record_request(&self.method, self.status, elapsed);
    }
}

/// Response body that counts bytes and logs once it ends.
struct LoggedBody {
    inner: Body,
    bytes: u64,
    record: Option<AccessRecord>,
}

impl LoggedBody {
    fn finish(&mut self) {
        if let Some(record) = self.record.take() {
            record.emit(self.bytes);
        }
    }
}

impl HttpBody for LoggedBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, axum::Error>>> {
        let this = self.get_mut();
        let polled = Pin::new(&mut this.inner).poll_frame(cx);
        match &polled {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    this.bytes += data.len() as u64;
                }
            }
            Poll::Ready(Some(Err(_))) | Poll::Ready(None) => this.finish(),
            Poll::Pending => {}
        }
        polled
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl Drop for LoggedBody {
    fn drop(&mut self) {
        self.finish();
    }
}
