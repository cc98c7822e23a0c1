//! memcached interceptor binary
//!
//! Loads hooks, builds the server and runs the accept loop until SIGINT or
//! SIGTERM.

// Use mimalloc as the global allocator for better performance
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::Result;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use memd_interceptor::business::{
    register_packet_logger, BackgroundTasks, HookFile, KeyCounts, PacketStats, TaskConfig,
};
use memd_interceptor::config::{CliArgs, ConnConfig};
use memd_interceptor::core::{ConnectionManager, Dispatcher, HookRegistry, Server, StatsCollector};
use memd_interceptor::logger::{self, log, LogLevel};
use memd_interceptor::server_runner;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = CliArgs::parse_args();

    let level: LogLevel = cli.log_mode.parse().map_err(anyhow::Error::msg)?;
    logger::init_logger(level);

    cli.validate()?;

    log::info!(
        listen = %cli.listen_addr(),
        backend = %cli.backend_addr(),
        "Starting memcached interceptor"
    );

    // Build the hook registry once; it is read-only after this point
    let key_counts = Arc::new(KeyCounts::new());
    let hook_file = match cli.hooks_file {
        Some(ref path) => {
            let file = HookFile::load(path).await?;
            log::info!(file = %path.display(), hooks = file.hooks.len(), "Hook file loaded");
            file
        }
        None => HookFile::default(),
    };

    let mut registry = HookRegistry::new();
    hook_file.register_into(&mut registry, &key_counts)?;
    if cli.verbose > 0 {
        register_packet_logger(&mut registry, cli.verbose);
    }
    if registry.is_empty() {
        log::info!("No hooks registered, packets are forwarded unchanged");
    }

    let default_action = cli.default_action.unwrap_or(hook_file.default_action);
    let conn_config = ConnConfig::from_cli(&cli);
    let dispatcher = Dispatcher::new(Arc::new(registry))
        .with_default_action(default_action)
        .with_hook_timeout(conn_config.hook_timeout);

    let stats = Arc::new(PacketStats::new());
    let conn_manager = ConnectionManager::new();

    let server = Arc::new(
        Server::builder()
            .dispatcher(Arc::new(dispatcher))
            .stats(Arc::clone(&stats) as Arc<dyn StatsCollector>)
            .conn_manager(conn_manager)
            .conn_config(conn_config)
            .backend(cli.backend_addr())
            .build()?,
    );

    let background_tasks = BackgroundTasks::new(
        TaskConfig {
            stats_interval: cli.stats_interval,
        },
        Arc::clone(&stats),
    )
    .with_key_counts(Arc::clone(&key_counts))
    .start();

    // Create cancellation token for graceful shutdown
    let shutdown = CancellationToken::new();
    let shutdown_signal = shutdown.clone();

    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigint = signal(SignalKind::interrupt()).expect("Failed to setup SIGINT");
            let mut sigterm = signal(SignalKind::terminate()).expect("Failed to setup SIGTERM");

            tokio::select! {
                _ = sigint.recv() => {
                    log::info!("SIGINT received, shutting down...");
                }
                _ = sigterm.recv() => {
                    log::info!("SIGTERM received, shutting down...");
                }
            }
        }

        #[cfg(not(unix))]
        {
            tokio::signal::ctrl_c().await.ok();
            log::info!("Shutdown signal received...");
        }

        shutdown_signal.cancel();
    });

    let result = server_runner::run_server(Arc::clone(&server), &cli.listen_addr(), shutdown).await;

    // Let cancelled connections flush before the final stats report
    tokio::time::sleep(tokio::time::Duration::from_millis(500)).await;
    background_tasks.shutdown().await;
    result
}
