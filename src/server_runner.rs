//! Server startup and accept loop
//!
//! This module binds the listening socket and runs the accept loop that hands
//! each client to `handler::process_connection`.

use crate::core::Server;
use crate::handler::process_connection;
use crate::logger::log;

use anyhow::{Context, Result};
use socket2::{SockRef, TcpKeepalive};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// TCP keepalive interval, dead peers are detected in ~45s (3 probes × 15s)
const TCP_KEEPALIVE_SECS: u64 = 15;

/// First pause after a failed accept, doubled per consecutive failure
const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(10);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Pause before the next accept after `failures` consecutive errors
fn accept_backoff(failures: u32) -> Duration {
    let shift = failures.saturating_sub(1).min(16);
    (ACCEPT_BACKOFF_MIN * (1u32 << shift)).min(ACCEPT_BACKOFF_MAX)
}

/// Bind a TCP listener with SO_REUSEADDR for fast restarts
pub fn bind_listener(addr: &str, backlog: i32) -> Result<TcpListener> {
    let socket_addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("invalid listen address '{}'", addr))?;
    let socket = socket2::Socket::new(
        match socket_addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&socket_addr.into())?;
    socket.listen(backlog)?;

    Ok(TcpListener::from_std(socket.into())?)
}

/// Bind `listen_addr` and serve until `shutdown` is cancelled
pub async fn run_server(
    server: Arc<Server>,
    listen_addr: &str,
    shutdown: CancellationToken,
) -> Result<()> {
    let listener = bind_listener(listen_addr, server.conn_config.tcp_backlog)?;
    serve(listener, server, shutdown).await
}

/// Run the accept loop on an already bound listener
pub async fn serve(
    listener: TcpListener,
    server: Arc<Server>,
    shutdown: CancellationToken,
) -> Result<()> {
    // Connection limiter: 0 = unlimited
    let conn_limiter = if server.conn_config.max_connections > 0 {
        Some(Arc::new(Semaphore::new(server.conn_config.max_connections)))
    } else {
        None
    };

    let local_addr = listener.local_addr()?;
    log::info!(
        address = %local_addr,
        backend = %server.backend_addr,
        max_connections = server.conn_config.max_connections,
        hooks = server.dispatcher.registry().len(),
        default_action = ?server.dispatcher.default_action(),
        "Server started"
    );

    let mut accept_failures: u32 = 0;
    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = shutdown.cancelled() => break,
        };

        match accepted {
            Ok((stream, addr)) => {
                accept_failures = 0;
                let peer_addr = addr.to_string();
                log::trace!(peer = %peer_addr, "Accepted");

                // Acquire connection permit (backpressure when at limit)
                let permit = if let Some(ref limiter) = conn_limiter {
                    tokio::select! {
                        permit = limiter.clone().acquire_owned() => match permit {
                            Ok(permit) => Some(permit),
                            Err(_) => break,
                        },
                        _ = shutdown.cancelled() => break,
                    }
                } else {
                    None
                };

                let server = Arc::clone(&server);
                tokio::spawn(async move {
                    // Hold permit for the lifetime of this connection
                    let _permit = permit;

                    if server.conn_config.tcp_nodelay {
                        let _ = stream.set_nodelay(true);
                    }
                    let keepalive = TcpKeepalive::new()
                        .with_time(Duration::from_secs(TCP_KEEPALIVE_SECS))
                        .with_interval(Duration::from_secs(TCP_KEEPALIVE_SECS));
                    let _ = SockRef::from(&stream).set_tcp_keepalive(&keepalive);

                    if let Err(e) = process_connection(&server, stream, peer_addr.clone()).await {
                        log::warn!(peer = %peer_addr, error = %e, "Connection error");
                    }
                });
            }
            Err(e) => {
                // EMFILE and friends clear up once connections close
                accept_failures = accept_failures.saturating_add(1);
                let pause = accept_backoff(accept_failures);
                log::error!(error = %e, retry_in = ?pause, "Failed to accept connection");
                tokio::select! {
                    _ = tokio::time::sleep(pause) => {}
                    _ = shutdown.cancelled() => break,
                }
            }
        }
    }

    for conn in server.conn_manager.list() {
        log::debug!(
            conn_id = conn.conn_id,
            peer = %conn.peer_addr,
            age = ?conn.age,
            "Cancelling connection"
        );
    }
    let cancelled = server.conn_manager.cancel_all();
    log::info!(connections = cancelled, "Server stopped");
    Ok(())
}
