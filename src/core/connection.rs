//! Connection management module
//!
//! Tracks active client connections and lets shutdown cancel them all.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use super::hooks::ConnectionId;

#[derive(Debug)]
struct ActiveConnection {
    peer_addr: String,
    connected_at: Instant,
    cancel_token: CancellationToken,
}

/// Snapshot of one active connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub conn_id: ConnectionId,
    pub peer_addr: String,
    pub age: Duration,
}

/// Manager for active connections
#[derive(Debug, Clone)]
pub struct ConnectionManager {
    next_conn_id: Arc<AtomicU64>,
    connections: Arc<DashMap<ConnectionId, ActiveConnection>>,
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self {
            next_conn_id: Arc::new(AtomicU64::new(1)),
            connections: Arc::new(DashMap::new()),
        }
    }

    /// Register a new connection and return its ID and cancellation token
    pub fn register(&self, peer_addr: String) -> (ConnectionId, CancellationToken) {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let cancel_token = CancellationToken::new();

        self.connections.insert(
            conn_id,
            ActiveConnection {
                peer_addr,
                connected_at: Instant::now(),
                cancel_token: cancel_token.clone(),
            },
        );

        (conn_id, cancel_token)
    }

    pub fn unregister(&self, conn_id: ConnectionId) {
        self.connections.remove(&conn_id);
    }

    /// Cancel every active connection, returns how many were signalled
    pub fn cancel_all(&self) -> usize {
        let mut cancelled = 0;
        for conn in self.connections.iter() {
            conn.cancel_token.cancel();
            cancelled += 1;
        }
        cancelled
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Active connections ordered by id
    pub fn list(&self) -> Vec<ConnectionInfo> {
        let mut list: Vec<ConnectionInfo> = self
            .connections
            .iter()
            .map(|entry| ConnectionInfo {
                conn_id: *entry.key(),
                peer_addr: entry.peer_addr.clone(),
                age: entry.connected_at.elapsed(),
            })
            .collect();
        list.sort_by_key(|info| info.conn_id);
        list
    }
}
