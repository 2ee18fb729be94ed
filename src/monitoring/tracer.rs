/*!
 * Request Tracing
 * Structured tracing for client requests using the tracing crate
 *
 * Features:
 * - Trace ID per request for log correlation
 * - JSON-formatted logs for structured parsing
 * - Request result and status recorded on the span
 */

use crate::core::errors::ServerResult;
use crate::core::types::ThreadId;
use std::time::{Duration, Instant};
use tracing::{debug, info, span, warn, Level, Span};
use tracing_subscriber::{
    fmt::format::FmtSpan, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};
use uuid::Uuid;

/// Initialize structured tracing
///
/// Environment variables:
/// - RUST_LOG: Set log level (default: info)
/// - OBJBROKER_TRACE_JSON: Enable JSON output (default: false)
///
/// Safe to call more than once; later calls leave the first subscriber in place.
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let use_json = std::env::var("OBJBROKER_TRACE_JSON")
        .map(|v| v == "1" || v == "true")
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(env_filter);

    if use_json {
        let installed = registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_thread_names(true)
                    .with_current_span(true)
                    .with_span_list(true)
                    .with_span_events(FmtSpan::CLOSE),
            )
            .try_init();
        if installed.is_ok() {
            info!("structured tracing initialized with JSON output");
        }
    } else {
        let installed = registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_thread_names(true)
                    .with_span_events(FmtSpan::CLOSE)
                    .compact(),
            )
            .try_init();
        if installed.is_ok() {
            info!("structured tracing initialized");
        }
    }
}

/// Generate a unique trace ID for request correlation
pub fn generate_trace_id() -> String {
    Uuid::new_v4().to_string()
}

/// Span covering one client request
pub struct RequestSpan {
    span: Span,
    start: Instant,
    request: &'static str,
    trace_id: String,
    slow_after: Duration,
}

impl RequestSpan {
    pub fn new(request: &'static str, tid: ThreadId, slow_after: Duration) -> Self {
        let trace_id = generate_trace_id();
        let span = span!(
            Level::DEBUG,
            "request",
            trace_id = %trace_id,
            request,
            tid,
            duration_us = tracing::field::Empty,
            result = tracing::field::Empty,
            status = tracing::field::Empty,
        );

        Self {
            span,
            start: Instant::now(),
            request,
            trace_id,
            slow_after,
        }
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    /// Enter the span context for the duration of the handler
    pub fn enter(&self) -> tracing::span::Entered<'_> {
        self.span.enter()
    }

    /// Record success, or the status code the failure maps to
    pub fn record_result<T>(&self, result: &ServerResult<T>) {
        match result {
            Ok(_) => {
                self.span.record("result", "success");
            }
            Err(e) => {
                self.span.record("result", "error");
                self.span.record("status", tracing::field::display(e.status()));
            }
        }
    }
}

impl Drop for RequestSpan {
    fn drop(&mut self) {
        let duration = self.start.elapsed();
        self.span.record("duration_us", duration.as_micros() as u64);
        let _entered = self.span.enter();

        if duration > self.slow_after {
            warn!(
                trace_id = %self.trace_id,
                request = self.request,
                duration_ms = duration.as_millis() as u64,
                slow = true,
                "slow request detected"
            );
        } else {
            debug!(
                trace_id = %self.trace_id,
                request = self.request,
                duration_us = duration.as_micros() as u64,
                "request completed"
            );
        }
    }
}
