//! Core proxy server
//!
//! The Server struct bundles everything a connection needs: the frozen hook
//! dispatcher, statistics, connection tracking and the backend to dial.

use std::sync::Arc;

use super::connection::ConnectionManager;
use super::dispatch::Dispatcher;
use super::hooks::{NoopStats, StatsCollector};
use super::protocol::FrameDecoder;
use super::registry::HookRegistry;
use crate::config::ConnConfig;
use crate::error::{ProxyError, Result};

/// Core proxy server
pub struct Server {
    /// Hook dispatcher shared by every connection
    pub dispatcher: Arc<Dispatcher>,
    /// Statistics collector
    pub stats: Arc<dyn StatsCollector>,
    /// Connection manager
    pub conn_manager: ConnectionManager,
    /// Connection performance configuration
    pub conn_config: ConnConfig,
    /// Backend `host:port`
    pub backend_addr: String,
}

impl Server {
    /// Create a new server builder
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    /// Frame decoder honoring the configured body limit
    pub fn decoder(&self) -> FrameDecoder {
        FrameDecoder::new(self.conn_config.max_body_size)
    }
}

/// Builder for constructing a Server
#[derive(Default)]
pub struct ServerBuilder {
    dispatcher: Option<Arc<Dispatcher>>,
    stats: Option<Arc<dyn StatsCollector>>,
    conn_manager: Option<ConnectionManager>,
    conn_config: Option<ConnConfig>,
    backend_addr: Option<String>,
}

impl ServerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the hook dispatcher
    pub fn dispatcher(mut self, dispatcher: Arc<Dispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Set statistics collector
    pub fn stats(mut self, stats: Arc<dyn StatsCollector>) -> Self {
        self.stats = Some(stats);
        self
    }

    /// Set connection manager
    pub fn conn_manager(mut self, manager: ConnectionManager) -> Self {
        self.conn_manager = Some(manager);
        self
    }

    /// Set connection configuration
    pub fn conn_config(mut self, config: ConnConfig) -> Self {
        self.conn_config = Some(config);
        self
    }

    /// Set the backend address (`host:port`)
    pub fn backend(mut self, addr: impl Into<String>) -> Self {
        self.backend_addr = Some(addr.into());
        self
    }

    /// Build the server
    ///
    /// The backend address is required. Without a dispatcher every packet is
    /// forwarded unchanged; without a stats collector nothing is recorded.
    pub fn build(self) -> Result<Server> {
        let backend_addr = self
            .backend_addr
            .ok_or_else(|| ProxyError::Config("backend address is required".to_string()))?;
        let dispatcher = self
            .dispatcher
            .unwrap_or_else(|| Arc::new(Dispatcher::new(Arc::new(HookRegistry::new()))));

        Ok(Server {
            dispatcher,
            stats: self.stats.unwrap_or_else(|| Arc::new(NoopStats)),
            conn_manager: self.conn_manager.unwrap_or_default(),
            conn_config: self.conn_config.unwrap_or_default(),
            backend_addr,
        })
    }
}
