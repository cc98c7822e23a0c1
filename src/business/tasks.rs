//! Background tasks for periodic statistics reporting

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use super::key_counter::KeyCounts;
use super::stats::{PacketStats, PacketStatsSnapshot};
use crate::logger::log;

/// Number of hottest keys logged per report
const TOP_KEYS: usize = 10;

/// Format bytes into human-readable string (KB, MB, GB)
fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2}GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2}MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2}KB", bytes as f64 / KB as f64)
    } else {
        format!("{}B", bytes)
    }
}

/// Background task configuration
#[derive(Debug, Clone)]
pub struct TaskConfig {
    /// Interval for logging and resetting packet statistics
    pub stats_interval: Duration,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            stats_interval: Duration::from_secs(60),
        }
    }
}

/// Background tasks manager
pub struct BackgroundTasks {
    config: TaskConfig,
    stats: Arc<PacketStats>,
    key_counts: Option<Arc<KeyCounts>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

/// Handle for spawned background tasks
pub struct BackgroundTasksHandle {
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasksHandle {
    /// Stop all background tasks and wait for them to complete
    pub async fn shutdown(self) {
        log::info!("Stopping background tasks...");
        let _ = self.shutdown_tx.send(true);

        for (i, handle) in self.handles.into_iter().enumerate() {
            match tokio::time::timeout(Duration::from_secs(5), handle).await {
                Ok(Ok(())) => {
                    log::debug!(task = i, "Background task stopped");
                }
                Ok(Err(e)) => {
                    log::warn!(task = i, error = %e, "Background task panicked");
                }
                Err(_) => {
                    log::warn!(task = i, "Background task shutdown timeout");
                }
            }
        }
        log::info!("Background tasks stopped");
    }

    pub fn task_count(&self) -> usize {
        self.handles.len()
    }
}

impl BackgroundTasks {
    pub fn new(config: TaskConfig, stats: Arc<PacketStats>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            config,
            stats,
            key_counts: None,
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Also report the hottest keys seen by a key counter
    pub fn with_key_counts(mut self, key_counts: Arc<KeyCounts>) -> Self {
        self.key_counts = Some(key_counts);
        self
    }

    /// Start all background tasks and return a handle for shutdown
    ///
    /// A zero `stats_interval` disables reporting.
    pub fn start(self) -> BackgroundTasksHandle {
        let mut handles = Vec::new();
        if !self.config.stats_interval.is_zero() {
            handles.push(self.start_report_stats_task());
        }

        log::info!(tasks = handles.len(), "Background tasks started");

        BackgroundTasksHandle {
            shutdown_tx: self.shutdown_tx,
            handles,
        }
    }

    fn start_report_stats_task(&self) -> JoinHandle<()> {
        let stats = Arc::clone(&self.stats);
        let key_counts = self.key_counts.clone();
        let interval_duration = self.config.stats_interval;
        let mut shutdown_rx = self.shutdown_rx.clone();

        tokio::spawn(async move {
            let mut interval = interval(interval_duration);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        report_stats_once(&stats, key_counts.as_deref());
                    }
                    _ = shutdown_rx.changed() => {
                        log::debug!("Report stats task shutting down");
                        report_stats_once(&stats, key_counts.as_deref());
                        break;
                    }
                }
            }
        })
    }
}

/// Log and reset packet statistics, returns the snapshots that were logged
pub fn report_stats_once(
    stats: &PacketStats,
    key_counts: Option<&KeyCounts>,
) -> Vec<PacketStatsSnapshot> {
    let snapshots = stats.reset_all();

    if snapshots.is_empty() {
        log::debug!("No packets since last report");
    } else {
        let total_packets: u64 = snapshots.iter().map(|s| s.total()).sum();
        let total_bytes: u64 = snapshots.iter().map(|s| s.forwarded_bytes).sum();
        log::info!(
            packets = total_packets,
            forwarded = %format_bytes(total_bytes),
            "Packet statistics"
        );
        for s in &snapshots {
            log::debug!(
                direction = %s.direction,
                opcode = %s.opcode,
                forwarded = s.forwarded,
                bytes = %format_bytes(s.forwarded_bytes),
                dropped = s.dropped,
                replied = s.replied,
                failed = s.failed,
                "Opcode statistics"
            );
        }
    }

    if let Some(key_counts) = key_counts {
        for (key, count) in key_counts.top(TOP_KEYS) {
            log::debug!(key = %key, count = count, "Hot key");
        }
    }

    snapshots
}
