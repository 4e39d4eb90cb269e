//! hostbridge-cli - Command-line interface for hostbridge
//!
//! Sends one command to a running host and prints the result.

mod commands;

use clap::{Parser, Subcommand};
use colored::Colorize;
use hostbridge_client::{Client, ClientError, ConnectionConfig};
use std::net::SocketAddr;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "hostbridge-cli")]
#[command(about = "Command-line interface for a hostbridge-enabled editor")]
#[command(version)]
struct Cli {
    /// Server address
    #[arg(short, long, env = "HOSTBRIDGE_ADDR", default_value = "127.0.0.1:7410")]
    addr: SocketAddr,

    /// Seconds to wait for a response (reloads use --reload-wait instead)
    #[arg(long, default_value = "30")]
    timeout: u64,

    /// Seconds to wait for a reload to finish
    #[arg(long, default_value = "330")]
    reload_wait: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Ping the server
    Ping,

    /// Get server info
    Info,

    /// Query host state
    Query {
        /// Path of the object to read (whole state if omitted)
        #[arg(short, long)]
        target: Option<String>,
    },

    /// Apply a mutation to the host
    Mutate {
        /// Path of the object to change
        #[arg(short, long)]
        target: String,

        /// Action name
        #[arg(short, long)]
        action: String,

        /// Action arguments JSON (or @file.json to read from file)
        #[arg(long)]
        args: Option<String>,
    },

    /// Trigger a reload and wait for it to finish
    Reload,

    /// Show the state of the current or last reload
    Status,

    /// Send an arbitrary command kind
    Raw {
        /// Command kind
        #[arg(short, long)]
        kind: String,

        /// Payload JSON (or @file.json to read from file)
        #[arg(short, long, default_value = "{}")]
        payload: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    let wait = match cli.command {
        Commands::Reload => cli.reload_wait,
        _ => cli.timeout,
    };
    let config = ConnectionConfig::new(cli.addr).with_request_timeout(Duration::from_secs(wait));
    let client = Client::new(config);

    client.connect().await.map_err(|e| {
        eprintln!("{}: {}", "Connection failed".red(), e);
        e
    })?;

    let conn = client.connection();
    tokio::spawn(async move {
        let _ = conn.read_loop().await;
    });
    tokio::task::yield_now().await;

    match commands::execute(&client, cli.command).await {
        Ok(output) => {
            println!("{}", output);
        }
        Err(e) => {
            match e.downcast_ref::<ClientError>() {
                Some(ClientError::Server { kind, message }) => {
                    eprintln!(
                        "{} [{}]: {}",
                        "Error".red(),
                        kind.to_string().yellow(),
                        message
                    );
                }
                _ => eprintln!("{}: {}", "Error".red(), e),
            }
            std::process::exit(1);
        }
    }

    client.close().await?;
    Ok(())
}
