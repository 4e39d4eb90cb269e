//! # hostbridge-server
//!
//! TCP server for hostbridge.
//!
//! This crate provides:
//! - Connection handling with per-connection outbound channels
//! - Request intake into the host's command queue
//! - Deadline sweeps and the reload watchdog
//! - Prometheus metrics export

pub mod config;
pub mod error;
pub mod metrics;
pub mod server;
pub mod session;
pub mod sweeper;

pub use config::{
    Config, ConfigError, DispatchConfig, EditorConfig, MetricsConfig, NetworkConfig, TimeoutConfig,
};
pub use error::ServerError;
pub use metrics::{run_metrics_server, serve_metrics, Metrics};
pub use server::{server_info, Server, ServerConfig, ServerStats};
pub use session::Session;
pub use sweeper::{SweepResult, Sweeper};
