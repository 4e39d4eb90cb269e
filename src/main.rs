//! hostbridge - control server embedded in a simulated editor
//!
//! The main thread plays the editor: it owns the host state and ticks the
//! dispatcher at a fixed rate. Networking, deadline sweeps and metrics run on
//! a tokio runtime in worker threads.

mod editor;

use editor::DemoEditor;
use hostbridge_core::Bridge;
use hostbridge_server::{run_metrics_server, Config, Metrics, Server, ServerConfig, Sweeper};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match Config::load() {
        Ok(c) => {
            if let Ok(path) = std::env::var("HOSTBRIDGE_CONFIG") {
                tracing::info!("Loaded config from {}", path);
            }
            c
        }
        Err(e) => {
            tracing::error!("Failed to load config: {}", e);
            return Err(e.into());
        }
    };

    tracing::info!("Starting hostbridge");
    tracing::info!("  Bind address: {}", config.network.bind_addr);
    tracing::info!(
        "  Queue capacity: {} (tick budget {} commands / {} ms)",
        config.dispatch.queue_capacity,
        config.dispatch.tick_command_budget,
        config.dispatch.tick_time_budget_ms
    );
    tracing::info!(
        "  Timeouts: command {} ms, reload {} s",
        config.timeouts.command_timeout_ms,
        config.timeouts.reload_timeout_secs
    );

    let Bridge {
        intake,
        mut dispatcher,
        registry,
        reload,
    } = Bridge::new(&config.bridge());

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("hostbridge-net")
        .build()?;

    let metrics = if config.metrics.enabled {
        tracing::info!("  Metrics: http://{}/metrics", config.metrics.bind_addr);
        Some(Arc::new(Metrics::new()?))
    } else {
        tracing::info!("  Metrics: disabled");
        None
    };

    let mut server_config = ServerConfig::new(config.network.bind_addr)
        .with_idle_timeout(config.network.idle_timeout())
        .with_max_connections(config.network.max_connections);
    if let Some(ref metrics) = metrics {
        server_config = server_config.with_metrics(metrics.clone());
    }
    let server = Arc::new(Server::new(server_config, intake));

    let mut sweeper = Sweeper::new(
        registry.clone(),
        reload.clone(),
        config.timeouts.sweep_interval(),
    );
    if let Some(ref metrics) = metrics {
        sweeper = sweeper.with_metrics(metrics.clone());
    }
    let sweeper = Arc::new(sweeper);

    let stop = Arc::new(AtomicBool::new(false));
    let (metrics_shutdown, _) = broadcast::channel(1);

    let server_handle = {
        let server = server.clone();
        let stop = stop.clone();
        runtime.spawn(async move {
            if let Err(e) = server.run().await {
                tracing::error!("Server failed: {}", e);
                stop.store(true, Ordering::SeqCst);
            }
        })
    };

    let sweeper_handle = {
        let sweeper = sweeper.clone();
        runtime.spawn(async move { sweeper.run().await })
    };

    if let Some(ref metrics) = metrics {
        let metrics = metrics.clone();
        let addr = config.metrics.bind_addr;
        let shutdown_rx = metrics_shutdown.subscribe();
        runtime.spawn(async move {
            if let Err(e) = run_metrics_server(addr, metrics, shutdown_rx).await {
                tracing::error!("Metrics server failed: {}", e);
            }
        });
    }

    {
        let stop = stop.clone();
        runtime.spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("Received shutdown signal, stopping editor...");
            stop.store(true, Ordering::SeqCst);
        });
    }

    let mut editor = DemoEditor::new(reload.notifier(), config.editor.simulated_reload());
    let tick_interval = config.editor.tick_interval();
    tracing::info!("Editor ticking every {:?}", tick_interval);

    while !stop.load(Ordering::SeqCst) {
        let started = Instant::now();
        let report = dispatcher.tick(&mut editor);
        if let Some(ref metrics) = metrics {
            metrics.observe_tick(&report);
        }
        if let Some(rest) = tick_interval.checked_sub(started.elapsed()) {
            std::thread::sleep(rest);
        }
    }

    // Pending requests are answered before connections close.
    server.shutdown();
    dispatcher.close();
    sweeper.shutdown();
    let _ = metrics_shutdown.send(());

    runtime.block_on(async {
        let _ = tokio::time::timeout(Duration::from_secs(5), server_handle).await;
        let _ = sweeper_handle.await;
    });
    runtime.shutdown_timeout(Duration::from_secs(2));

    tracing::info!(
        "Editor stopped after {} reload(s), {} widget(s)",
        editor.reloads(),
        editor.widget_count()
    );
    Ok(())
}
