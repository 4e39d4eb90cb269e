//! TCP server implementation.

use crate::error::ServerError;
use crate::metrics::Metrics;
use crate::session::Session;
use hostbridge_core::{CommandIntake, ConnectionHandle, ConnectionId, Submission};
use hostbridge_protocol::{
    CommandKind, Decoder, Encoder, ErrorKind, InfoResult, ParsedRequest, Response,
    MAX_PAYLOAD_SIZE, PROTOCOL_VERSION,
};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Idle connection timeout.
    pub idle_timeout: Duration,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Metrics instance (if metrics are enabled).
    pub metrics: Option<Arc<Metrics>>,
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("bind_addr", &self.bind_addr)
            .field("idle_timeout", &self.idle_timeout)
            .field("max_connections", &self.max_connections)
            .field("metrics_enabled", &self.metrics.is_some())
            .finish()
    }
}

impl ServerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            idle_timeout: Duration::from_secs(300),
            max_connections: 64,
            metrics: None,
        }
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    /// Sets the metrics instance.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Returns whether metrics are enabled.
    pub fn metrics_enabled(&self) -> bool {
        self.metrics.is_some()
    }
}

/// Server statistics.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    /// Connections dropped at accept because of `max_connections`.
    pub connections_rejected: AtomicU64,
    pub requests_total: AtomicU64,
    pub errors_total: AtomicU64,
}

/// Everything a connection task needs.
#[derive(Clone)]
struct ConnectionContext {
    intake: Arc<CommandIntake>,
    config: ServerConfig,
    stats: Arc<ServerStats>,
}

impl ConnectionContext {
    fn record_error(&self, kind: ErrorKind) {
        self.stats.errors_total.fetch_add(1, Ordering::Relaxed);
        if let Some(ref metrics) = self.config.metrics {
            metrics.record_error(kind);
        }
    }
}

/// TCP server for hostbridge.
///
/// Accepts connections, decodes requests and hands host-bound commands to
/// the [`CommandIntake`]. Results flow back through the registry into each
/// connection's outbound channel.
pub struct Server {
    config: ServerConfig,
    intake: Arc<CommandIntake>,
    stats: Arc<ServerStats>,
    shutdown: broadcast::Sender<()>,
    running: AtomicBool,
    next_conn: AtomicU64,
}

impl Server {
    /// Creates a new server.
    pub fn new(config: ServerConfig, intake: Arc<CommandIntake>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            intake,
            stats: Arc::new(ServerStats::default()),
            shutdown: shutdown_tx,
            running: AtomicBool::new(false),
            next_conn: AtomicU64::new(1),
        }
    }

    /// Binds the configured address and runs the server.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Runs the accept loop on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        self.running.store(true, Ordering::SeqCst);
        tracing::info!("Server listening on {}", listener.local_addr()?);

        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            if self.stats.connections_active.load(Ordering::Relaxed)
                                >= self.config.max_connections as u64
                            {
                                tracing::warn!("Connection limit reached, rejecting {}", addr);
                                self.stats.connections_rejected.fetch_add(1, Ordering::Relaxed);
                                drop(stream);
                                continue;
                            }

                            self.stats.connections_total.fetch_add(1, Ordering::Relaxed);
                            self.stats.connections_active.fetch_add(1, Ordering::Relaxed);

                            if let Some(ref metrics) = self.config.metrics {
                                metrics.connections_total.inc();
                                metrics.connections_active.inc();
                            }

                            let conn_id =
                                ConnectionId::new(self.next_conn.fetch_add(1, Ordering::Relaxed));
                            let ctx = ConnectionContext {
                                intake: self.intake.clone(),
                                config: self.config.clone(),
                                stats: self.stats.clone(),
                            };
                            let mut conn_shutdown = self.shutdown.subscribe();

                            tokio::spawn(async move {
                                let result = Self::handle_connection(
                                    stream,
                                    addr,
                                    conn_id,
                                    ctx.clone(),
                                    &mut conn_shutdown,
                                )
                                .await;

                                if let Err(e) = result {
                                    tracing::debug!("Connection {} error: {}", addr, e);
                                }

                                ctx.stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                                if let Some(ref metrics) = ctx.config.metrics {
                                    metrics.connections_active.dec();
                                }

                                tracing::info!("Client disconnected: {}", addr);
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("Server shutting down");
                    break;
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        conn_id: ConnectionId,
        ctx: ConnectionContext,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<(), ServerError> {
        let session = Session::new(conn_id, addr);
        tracing::info!("Client connected: {} ({}, session {})", addr, conn_id, session.id);

        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("[{}] Failed to set TCP_NODELAY: {}", addr, e);
        }
        let (mut reader, writer) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = ConnectionHandle::new(conn_id, tx);
        let writer_task = tokio::spawn(Self::write_loop(writer, rx, addr));

        let result = Self::read_loop(&mut reader, &session, &handle, &ctx, shutdown).await;

        // Late results for this connection are discarded from here on; once
        // the last handle is gone the writer drains what is queued and exits.
        ctx.intake.registry().detach_connection(conn_id);
        drop(handle);
        if let Err(e) = writer_task.await {
            tracing::warn!("[{}] Writer task failed: {}", addr, e);
        }

        tracing::debug!(
            "[{}] Session {} closed after {} requests ({:?})",
            addr,
            session.id,
            session.request_count(),
            session.age()
        );
        result
    }

    async fn read_loop(
        reader: &mut OwnedReadHalf,
        session: &Session,
        handle: &ConnectionHandle,
        ctx: &ConnectionContext,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<(), ServerError> {
        let idle_timeout = ctx.config.idle_timeout;
        let mut decoder = Decoder::new();
        let mut buf = [0u8; 8192];

        loop {
            tokio::select! {
                result = reader.read(&mut buf) => {
                    match result {
                        Ok(0) => {
                            tracing::debug!("[{}] Connection closed by client", session.remote_addr);
                            return Ok(());
                        }
                        Ok(n) => {
                            tracing::trace!("[{}] Received {} bytes", session.remote_addr, n);
                            decoder.extend(&buf[..n]);
                        }
                        Err(e) => {
                            tracing::debug!("[{}] Read error: {}", session.remote_addr, e);
                            return Err(ServerError::Io(e));
                        }
                    }
                }

                _ = tokio::time::sleep(idle_timeout) => {
                    // A connection waiting on a long reload is not idle.
                    if session.idle_duration() >= idle_timeout
                        && ctx.intake.registry().pending_for(session.conn_id) == 0
                    {
                        tracing::debug!("[{}] Idle timeout", session.remote_addr);
                        return Ok(());
                    }
                    continue;
                }

                _ = shutdown.recv() => {
                    tracing::debug!("[{}] Shutdown signal received", session.remote_addr);
                    return Err(ServerError::ShuttingDown);
                }
            }

            loop {
                match decoder.decode_request() {
                    Ok(Some(request)) => {
                        session.record_request();
                        ctx.stats.requests_total.fetch_add(1, Ordering::Relaxed);
                        Self::route(request, handle, ctx);
                    }
                    Ok(None) => break,
                    Err(e) if e.is_stream_fatal() => {
                        tracing::warn!(
                            "[{}] Unrecoverable frame error, closing: {}",
                            session.remote_addr,
                            e
                        );
                        ctx.record_error(ErrorKind::MalformedRequest);
                        handle.send(Response::failure(
                            Value::Null,
                            ErrorKind::MalformedRequest,
                            e.to_string(),
                        ));
                        return Err(e.into());
                    }
                    Err(e) => {
                        tracing::debug!("[{}] Malformed request: {}", session.remote_addr, e);
                        session.record_malformed();
                        ctx.record_error(ErrorKind::MalformedRequest);
                        let id = e.request_id().cloned().unwrap_or(Value::Null);
                        handle.send(Response::failure(id, ErrorKind::MalformedRequest, e.to_string()));
                    }
                }
            }
        }
    }

    /// Answers `Ping` and `Info` directly; everything else goes to the host.
    fn route(request: ParsedRequest, handle: &ConnectionHandle, ctx: &ConnectionContext) {
        tracing::debug!("Request: {} (id={}) on {}", request.kind, request.id, handle.id());
        if let Some(ref metrics) = ctx.config.metrics {
            metrics.record_command(&request.kind);
        }

        match request.kind {
            CommandKind::Ping => {
                handle.send(Response::success(request.id, json!({ "pong": true })));
            }
            CommandKind::Info => {
                let response = match serde_json::to_value(server_info()) {
                    Ok(value) => Response::success(request.id, value),
                    Err(e) => {
                        Response::failure(request.id, ErrorKind::HostExecutionError, e.to_string())
                    }
                };
                handle.send(response);
            }
            _ => {
                if let Submission::Rejected(kind) =
                    ctx.intake.submit(request, Some(handle.clone()))
                {
                    ctx.record_error(kind);
                }
            }
        }
    }

    async fn write_loop(
        mut writer: OwnedWriteHalf,
        mut rx: mpsc::UnboundedReceiver<Response>,
        addr: SocketAddr,
    ) {
        while let Some(response) = rx.recv().await {
            tracing::debug!(
                "[{}] Response: {} (id={})",
                addr,
                if response.is_ok() { "OK" } else { "ERROR" },
                response.id
            );

            let bytes = match Encoder::encode_response(&response) {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::error!("[{}] Failed to encode response: {}", addr, e);
                    continue;
                }
            };
            if let Err(e) = writer.write_all(&bytes).await {
                tracing::debug!("[{}] Write error: {}", addr, e);
                return;
            }
        }

        if let Err(e) = writer.shutdown().await {
            tracing::trace!("[{}] Shutdown error: {}", addr, e);
        }
    }

    /// Initiates server shutdown.
    ///
    /// Pending requests are answered with `ServerShuttingDown` before the
    /// connections are told to close.
    pub fn shutdown(&self) {
        let answered = self
            .intake
            .registry()
            .close_all(ErrorKind::ServerShuttingDown, "server is shutting down");
        tracing::info!("Shutdown requested, {} pending requests answered", answered);
        let _ = self.shutdown.send(());
    }

    /// Returns whether the server is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Returns server statistics.
    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }
}

/// Static description of this server.
pub fn server_info() -> InfoResult {
    InfoResult {
        server_name: "hostbridge".to_string(),
        server_version: env!("CARGO_PKG_VERSION").to_string(),
        protocol_version: PROTOCOL_VERSION,
        commands: CommandKind::known()
            .iter()
            .map(|k| k.as_str().to_string())
            .collect(),
        max_frame_bytes: MAX_PAYLOAD_SIZE,
    }
}
