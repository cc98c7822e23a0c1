//! Connection handling logic
//!
//! One accepted client becomes one backend connection plus two pipelines
//! (client to server, server to client) feeding a single outbound writer.

use crate::core::hooks::{ConnectionId, Direction};
use crate::core::relay::{write_outbound, ActivityTracker, TimedStream, WriteResult};
use crate::core::{Pipeline, PipelineSummary, Server};
use crate::error::ProxyError;
use crate::logger::log;

use anyhow::{anyhow, Result};
use std::future::Future;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

/// Dial the backend with the configured timeout
pub async fn connect_backend(server: &Server) -> Result<TcpStream> {
    match tokio::time::timeout(
        server.conn_config.connect_timeout,
        TcpStream::connect(&server.backend_addr),
    )
    .await
    {
        Ok(Ok(stream)) => {
            if server.conn_config.tcp_nodelay {
                let _ = stream.set_nodelay(true);
            }
            Ok(stream)
        }
        Ok(Err(e)) => Err(ProxyError::Backend(format!("{}: {}", server.backend_addr, e)).into()),
        Err(_) => Err(anyhow!(
            "backend connect timeout after {:?} ({})",
            server.conn_config.connect_timeout,
            server.backend_addr
        )),
    }
}

/// Resolve after `timeout` without activity, never when the timeout is zero
async fn idle_watch(activity: &ActivityTracker, timeout: Duration) -> u64 {
    if timeout.is_zero() {
        std::future::pending::<()>().await;
    }
    activity.idle_timeout(timeout).await
}

/// Process a single client connection until either side closes
pub async fn process_connection(server: &Server, client: TcpStream, peer_addr: String) -> Result<()> {
    let (conn_id, cancel_token) = server.conn_manager.register(peer_addr.clone());
    log::connection(conn_id, &peer_addr, "open");

    let _guard = scopeguard::guard((), |_| {
        server.conn_manager.unregister(conn_id);
        log::connection(conn_id, &peer_addr, "closed");
    });

    let backend = tokio::select! {
        result = connect_backend(server) => result?,
        _ = cancel_token.cancelled() => return Ok(()),
    };
    log::debug!(conn_id = conn_id, backend = %server.backend_addr, "Connected to backend");

    let activity = ActivityTracker::new();
    let (client_read, client_write) = client.into_split();
    let (backend_read, backend_write) = backend.into_split();
    let client_read = TimedStream::new(client_read, activity.clone());
    let backend_read = TimedStream::new(backend_read, activity.clone());
    let from_client = client_read.read_counter();
    let from_backend = backend_read.read_counter();

    let buffer_size = server.conn_config.buffer_size;
    let (tx, rx) = mpsc::channel(server.conn_config.outbound_capacity());

    let request = Pipeline::new(
        conn_id,
        Direction::Request,
        server.decoder(),
        Arc::clone(&server.dispatcher),
        Arc::clone(&server.stats),
    );
    let response = Pipeline::new(
        conn_id,
        Direction::Response,
        server.decoder(),
        Arc::clone(&server.dispatcher),
        Arc::clone(&server.stats),
    );

    // The first pipeline to finish ends both; dropping its peer releases the
    // last sender so the writer flushes what is queued and shuts down.
    let pipelines = async move {
        let request_tx = tx.clone();
        tokio::select! {
            result = request.run(client_read, request_tx, buffer_size) => (Direction::Request, result),
            result = response.run(backend_read, tx, buffer_size) => (Direction::Response, result),
        }
    };
    let writer = write_outbound(rx, client_write, backend_write);

    tokio::select! {
        _ = relay(conn_id, pipelines, writer) => {}
        idle_secs = idle_watch(&activity, server.conn_config.idle_timeout) => {
            log::debug!(conn_id = conn_id, idle_secs = idle_secs, "Connection idle timeout");
        }
        _ = cancel_token.cancelled() => {
            log::debug!(conn_id = conn_id, "Connection cancelled");
        }
    }

    log::debug!(
        conn_id = conn_id,
        from_client = from_client.load(Ordering::Relaxed),
        from_backend = from_backend.load(Ordering::Relaxed),
        "Connection finished"
    );
    Ok(())
}

/// Drive both pipelines and the writer until the connection is done.
///
/// Once the pipelines end the writer is awaited so queued packets are
/// flushed. A failed writer ends the relay at once and drops the pipelines.
async fn relay<P, W>(conn_id: ConnectionId, pipelines: P, writer: W)
where
    P: Future<Output = (Direction, std::result::Result<PipelineSummary, ProxyError>)>,
    W: Future<Output = std::io::Result<WriteResult>>,
{
    tokio::pin!(pipelines, writer);

    tokio::select! {
        (direction, result) = &mut pipelines => {
            log_finished(conn_id, direction, result);
            log_written(conn_id, writer.await);
        }
        written = &mut writer => {
            log_written(conn_id, written);
        }
    }
}

fn log_written(conn_id: ConnectionId, written: std::io::Result<WriteResult>) {
    match written {
        Ok(w) => {
            log::trace!(conn_id = conn_id, to_client = w.to_client, to_server = w.to_server, "Writer finished");
        }
        Err(e) => {
            log::debug!(conn_id = conn_id, error = %e, "Write error");
        }
    }
}

fn log_finished(
    conn_id: ConnectionId,
    direction: Direction,
    result: std::result::Result<PipelineSummary, ProxyError>,
) {
    match result {
        Ok(summary) => {
            log::debug!(
                conn_id = conn_id,
                direction = %direction,
                packets = summary.packets,
                forwarded = summary.forwarded,
                dropped = summary.dropped,
                replied = summary.replied,
                failed = summary.failed,
                "Stream closed"
            );
        }
        // Already logged where it was raised
        Err(ProxyError::Frame(_)) => {}
        Err(e) => {
            log::debug!(conn_id = conn_id, direction = %direction, error = %e, "Stream error");
        }
    }
}
