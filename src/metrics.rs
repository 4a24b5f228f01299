//! Prometheus metrics for EventwellDB.
//!
//! Installs the global `metrics` recorder, registers descriptions for the
//! counters and gauges the engine emits, and serves the rendered snapshot at
//! `GET /metrics` over a small axum router.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::routing::get;
use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::task::JoinHandle;

/// Error type for metrics installation.
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    /// The global metrics recorder has already been installed.
    #[error("metrics recorder already installed")]
    AlreadyInstalled,
}

/// Cheaply cloneable handle to the installed recorder; renders the current
/// snapshot in Prometheus exposition format.
#[derive(Clone, Debug)]
pub struct MetricsHandle {
    inner: Arc<PrometheusHandle>,
}

impl MetricsHandle {
    /// Render the current metrics snapshot.
    pub fn render(&self) -> String {
        self.inner.render()
    }
}

/// The recorder may only be installed once per process; the `OnceLock` makes a
/// second attempt a clean error instead of a panic.
static RECORDER: std::sync::OnceLock<MetricsHandle> = std::sync::OnceLock::new();

/// Install the global recorder and register metric descriptions.
///
/// Call once at startup before any engine activity. A second call in the same
/// process returns [`MetricsError::AlreadyInstalled`]; use
/// [`installed_handle`] to share the existing one (tests in one process hit
/// this).
///
/// # Errors
///
/// [`MetricsError::AlreadyInstalled`] if a recorder is already in place.
pub fn install_recorder() -> Result<MetricsHandle, MetricsError> {
    let mut first_install = false;
    let handle = RECORDER.get_or_init(|| {
        first_install = true;
        let inner = PrometheusBuilder::new()
            .install_recorder()
            .expect("first recorder installation should succeed");
        MetricsHandle {
            inner: Arc::new(inner),
        }
    });

    if !first_install {
        return Err(MetricsError::AlreadyInstalled);
    }

    describe_counter!(
        "eventwell_events_appended_total",
        "Events appended through this node"
    );
    describe_counter!(
        "eventwell_notifications_total",
        "Append notifications received by the pipeline listener"
    );
    describe_counter!(
        "eventwell_events_broadcast_total",
        "Events published onto the registration bus"
    );
    describe_counter!(
        "eventwell_events_delivered_total",
        "Events delivered to subscription endpoints"
    );
    describe_counter!(
        "eventwell_acks_total",
        "Acknowledgements applied by subscriptions"
    );
    describe_counter!(
        "eventwell_catchup_reads_total",
        "Catch-up reads issued by subscriptions"
    );
    describe_gauge!(
        "eventwell_subscription_endpoints",
        "Endpoints currently attached across subscriptions"
    );

    Ok(handle.clone())
}

/// The previously installed handle, if any. Useful where another component may
/// already have installed the recorder.
pub fn installed_handle() -> Option<MetricsHandle> {
    RECORDER.get().cloned()
}

fn metrics_router(handle: MetricsHandle) -> Router {
    Router::new().route(
        "/metrics",
        get(move || {
            let handle = handle.clone();
            async move {
                (
                    [(
                        axum::http::header::CONTENT_TYPE,
                        "text/plain; version=0.0.4",
                    )],
                    handle.render(),
                )
            }
        }),
    )
}

/// Serve `GET /metrics` on `addr` from a spawned task.
///
/// Bind failures are logged and the returned task resolves immediately.
pub fn serve_metrics(handle: MetricsHandle, addr: SocketAddr) -> JoinHandle<()> {
    tokio::spawn(async move {
        let listener = match tokio::net::TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(e) => {
                tracing::error!(addr = %addr, error = %e, "failed to bind metrics listener");
                return;
            }
        };
        serve_on(handle, listener).await;
    })
}

/// Serve `GET /metrics` on an already-bound listener (lets tests learn the
/// ephemeral port first).
pub fn serve_metrics_on_listener(
    handle: MetricsHandle,
    listener: tokio::net::TcpListener,
) -> JoinHandle<()> {
    tokio::spawn(serve_on(handle, listener))
}

async fn serve_on(handle: MetricsHandle, listener: tokio::net::TcpListener) {
    let addr = listener
        .local_addr()
        .expect("bound listener should have a local address");
    tracing::info!(addr = %addr, "metrics server listening");

    if let Err(e) = axum::serve(listener, metrics_router(handle)).await {
        tracing::error!(error = %e, "metrics server error");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn handle() -> MetricsHandle {
        // Another test in this process may have installed the recorder first.
        install_recorder().unwrap_or_else(|_| installed_handle().expect("recorder installed"))
    }

    #[test]
    fn second_install_reports_already_installed() {
        let _ = handle();
        let second = install_recorder();
        assert!(matches!(second, Err(MetricsError::AlreadyInstalled)));
    }

    #[tokio::test]
    async fn render_includes_recorded_counter() {
        let handle = handle();
        metrics::counter!("eventwell_events_appended_total").increment(3);
        let rendered = handle.render();
        assert!(
            rendered.contains("eventwell_events_appended_total"),
            "rendered snapshot should mention the counter: {rendered}"
        );
    }

    #[tokio::test]
    async fn serve_metrics_stays_running() {
        let handle = handle();
        let join = serve_metrics(handle, "127.0.0.1:0".parse().expect("addr"));

        let raced = tokio::time::timeout(Duration::from_millis(20), join).await;
        assert!(raced.is_err(), "metrics server task should keep running");
    }

    #[tokio::test]
    async fn serve_metrics_on_listener_stays_running() {
        let handle = handle();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("local addr");
        assert_ne!(addr.port(), 0);

        let join = serve_metrics_on_listener(handle, listener);
        let raced = tokio::time::timeout(Duration::from_millis(20), join).await;
        assert!(raced.is_err(), "metrics server task should keep running");
    }
}
