//! Prometheus metrics for the hostbridge server.
//!
//! This module provides:
//! - Metrics registry with counters, gauges, and histograms
//! - HTTP server to expose metrics at `/metrics` endpoint

use hostbridge_core::{TickOutcome, TickReport};
use hostbridge_protocol::{CommandKind, ErrorKind};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

/// Host dispatch duration buckets (in seconds).
const DURATION_BUCKETS: &[f64] = &[0.0001, 0.0005, 0.001, 0.002, 0.004, 0.008, 0.016, 0.05, 0.1];

/// Prometheus metrics for the hostbridge server.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    /// Total connections accepted.
    pub connections_total: Counter,
    /// Currently active connections.
    pub connections_active: Gauge,
    /// Requests received, by command kind.
    pub commands_total: CounterVec,
    /// Failure responses, by error kind.
    pub errors_total: CounterVec,
    /// Time spent inside the host per command, by command kind.
    pub dispatch_duration: HistogramVec,
    /// Commands waiting for the next host tick.
    pub queue_depth: Gauge,
    /// Requests awaiting a result.
    pub pending_requests: Gauge,
    /// Host ticks that executed at least one command.
    pub busy_ticks_total: Counter,
}

impl Metrics {
    /// Creates a new Metrics instance with all metrics registered.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let connections_total = Counter::with_opts(Opts::new(
            "hostbridge_connections_total",
            "Total number of connections accepted",
        ))?;
        registry.register(Box::new(connections_total.clone()))?;

        let connections_active = Gauge::with_opts(Opts::new(
            "hostbridge_connections_active",
            "Number of currently active connections",
        ))?;
        registry.register(Box::new(connections_active.clone()))?;

        let commands_total = CounterVec::new(
            Opts::new("hostbridge_commands_total", "Total requests by command kind"),
            &["kind"],
        )?;
        registry.register(Box::new(commands_total.clone()))?;

        let errors_total = CounterVec::new(
            Opts::new("hostbridge_errors_total", "Total failure responses by error kind"),
            &["kind"],
        )?;
        registry.register(Box::new(errors_total.clone()))?;

        let dispatch_duration = HistogramVec::new(
            HistogramOpts::new(
                "hostbridge_dispatch_duration_seconds",
                "Host execution time in seconds by command kind",
            )
            .buckets(DURATION_BUCKETS.to_vec()),
            &["kind"],
        )?;
        registry.register(Box::new(dispatch_duration.clone()))?;

        let queue_depth = Gauge::with_opts(Opts::new(
            "hostbridge_queue_depth",
            "Commands waiting for the host tick",
        ))?;
        registry.register(Box::new(queue_depth.clone()))?;

        let pending_requests = Gauge::with_opts(Opts::new(
            "hostbridge_pending_requests",
            "Requests awaiting a result",
        ))?;
        registry.register(Box::new(pending_requests.clone()))?;

        let busy_ticks_total = Counter::with_opts(Opts::new(
            "hostbridge_busy_ticks_total",
            "Host ticks that executed at least one command",
        ))?;
        registry.register(Box::new(busy_ticks_total.clone()))?;

        Ok(Self {
            registry,
            connections_total,
            connections_active,
            commands_total,
            errors_total,
            dispatch_duration,
            queue_depth,
            pending_requests,
            busy_ticks_total,
        })
    }

    pub fn record_command(&self, kind: &CommandKind) {
        self.commands_total
            .with_label_values(&[kind.metric_label()])
            .inc();
    }

    pub fn record_error(&self, kind: ErrorKind) {
        self.errors_total.with_label_values(&[kind.as_str()]).inc();
    }

    /// Folds one host tick into the metrics.
    pub fn observe_tick(&self, report: &TickReport) {
        self.queue_depth.set(report.remaining as f64);
        if report.is_idle() {
            return;
        }
        self.busy_ticks_total.inc();

        for entry in &report.entries {
            self.dispatch_duration
                .with_label_values(&[entry.kind.metric_label()])
                .observe(entry.duration.as_secs_f64());
            if let TickOutcome::Failure(kind) = entry.outcome {
                self.record_error(kind);
            }
        }
    }

    /// Encodes all metrics in Prometheus text format.
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            tracing::error!("Failed to encode metrics: {}", e);
        }
        buffer
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

/// Runs the HTTP metrics server.
///
/// The server listens on the given address and serves metrics at `/metrics`.
pub async fn run_metrics_server(
    addr: SocketAddr,
    metrics: Arc<Metrics>,
    shutdown: broadcast::Receiver<()>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("Metrics server listening on http://{}/metrics", addr);
    serve_metrics(listener, metrics, shutdown).await;
    Ok(())
}

/// Serves metrics on an already bound listener until shutdown.
pub async fn serve_metrics(
    listener: TcpListener,
    metrics: Arc<Metrics>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _)) => {
                        let metrics = metrics.clone();
                        tokio::spawn(async move {
                            let io = TokioIo::new(stream);
                            let service = service_fn(move |req| {
                                let metrics = metrics.clone();
                                async move { handle_request(req, metrics).await }
                            });
                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                tracing::debug!("Metrics connection error: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!("Metrics server accept error: {}", e);
                    }
                }
            }
            _ = shutdown.recv() => {
                tracing::info!("Metrics server shutting down");
                break;
            }
        }
    }
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let response = match req.uri().path() {
        "/metrics" => respond(
            StatusCode::OK,
            "text/plain; version=0.0.4; charset=utf-8",
            Bytes::from(metrics.encode()),
        ),
        "/health" | "/healthz" => respond(StatusCode::OK, "text/plain", Bytes::from("OK")),
        _ => respond(StatusCode::NOT_FOUND, "text/plain", Bytes::from("Not Found")),
    };
    Ok(response)
}

fn respond(status: StatusCode, content_type: &'static str, body: Bytes) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use hostbridge_core::{RequestId, TickEntry};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();

        metrics.connections_total.inc();
        metrics.connections_active.inc();
        metrics.record_command(&CommandKind::QueryState);
        metrics.record_command(&CommandKind::Unknown("Warp".into()));
        metrics.record_error(ErrorKind::ServerBusy);

        let encoded = String::from_utf8(metrics.encode()).unwrap();
        assert!(encoded.contains("hostbridge_connections_total 1"));
        assert!(encoded.contains(r#"hostbridge_commands_total{kind="QueryState"} 1"#));
        assert!(encoded.contains(r#"hostbridge_commands_total{kind="Unknown"} 1"#));
        assert!(encoded.contains(r#"hostbridge_errors_total{kind="ServerBusy"} 1"#));
    }

    #[test]
    fn test_observe_tick() {
        let metrics = Metrics::new().unwrap();
        let report = TickReport {
            entries: vec![
                TickEntry {
                    id: RequestId::new(1),
                    kind: CommandKind::ApplyMutation,
                    outcome: TickOutcome::Failure(ErrorKind::HostExecutionError),
                    duration: Duration::from_micros(300),
                },
                TickEntry {
                    id: RequestId::new(2),
                    kind: CommandKind::TriggerReload,
                    outcome: TickOutcome::Parked,
                    duration: Duration::from_micros(50),
                },
            ],
            remaining: 7,
            elapsed: Duration::from_millis(1),
            discarded: 0,
        };
        metrics.observe_tick(&report);
        metrics.observe_tick(&TickReport::default());

        let encoded = String::from_utf8(metrics.encode()).unwrap();
        assert!(encoded.contains("hostbridge_busy_ticks_total 1"));
        assert!(encoded.contains("hostbridge_queue_depth 0"));
        assert!(encoded.contains(r#"hostbridge_errors_total{kind="HostExecutionError"} 1"#));
        assert!(encoded.contains(
            r#"hostbridge_dispatch_duration_seconds_count{kind="ApplyMutation"} 1"#
        ));
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let metrics = Arc::new(Metrics::new().unwrap());
        metrics.pending_requests.set(3.0);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let server = tokio::spawn(serve_metrics(listener, metrics, shutdown_rx));

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /metrics HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut body = String::new();
        stream.read_to_string(&mut body).await.unwrap();

        assert!(body.starts_with("HTTP/1.1 200"));
        assert!(body.contains("hostbridge_pending_requests 3"));

        shutdown_tx.send(()).unwrap();
        server.await.unwrap();
    }
}
