//! Business logic implementations
//!
//! This module contains the pieces that plug into the core engine:
//! - Built-in hooks (key counting, filtering, packet logging)
//! - Hook file loading
//! - Statistics collection and periodic reporting

mod filters;
mod key_counter;
pub mod loader;
mod packet_logger;
mod stats;
mod tasks;

pub use filters::{DropHook, ReplyNotFound};
pub use key_counter::{KeyCounter, KeyCounts};
pub use loader::{register_packet_logger, HookFile, HookKind, HookSpec};
pub use packet_logger::PacketLogger;
pub use stats::{PacketStats, PacketStatsSnapshot};
pub use tasks::{report_stats_once, BackgroundTasks, BackgroundTasksHandle, TaskConfig};
