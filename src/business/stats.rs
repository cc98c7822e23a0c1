//! Packet statistics collection

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::core::hooks::StatsCollector;
use crate::core::{Direction, Opcode};

#[derive(Debug, Default)]
struct PacketCounters {
    forwarded: AtomicU64,
    forwarded_bytes: AtomicU64,
    dropped: AtomicU64,
    replied: AtomicU64,
    failed: AtomicU64,
}

/// Counters for one direction and opcode
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketStatsSnapshot {
    pub direction: Direction,
    pub opcode: Opcode,
    pub forwarded: u64,
    pub forwarded_bytes: u64,
    pub dropped: u64,
    pub replied: u64,
    pub failed: u64,
}

impl PacketStatsSnapshot {
    pub fn total(&self) -> u64 {
        self.forwarded + self.dropped + self.replied + self.failed
    }
}

/// Packet statistics collector
///
/// Counts outcomes per direction and opcode. `reset_all` swaps counters to
/// zero so that a concurrent write lands either in the returned snapshot or in
/// the next one.
pub struct PacketStats {
    stats: Arc<DashMap<(Direction, Opcode), PacketCounters>>,
    reset_lock: Mutex<()>,
}

impl Default for PacketStats {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketStats {
    pub fn new() -> Self {
        Self {
            stats: Arc::new(DashMap::new()),
            reset_lock: Mutex::new(()),
        }
    }

    pub fn get(&self, direction: Direction, opcode: Opcode) -> Option<PacketStatsSnapshot> {
        self.stats
            .get(&(direction, opcode))
            .map(|entry| load_snapshot(direction, opcode, entry.value()))
    }

    /// All counters, ordered by direction then opcode
    pub fn snapshot(&self) -> Vec<PacketStatsSnapshot> {
        let mut snapshots: Vec<PacketStatsSnapshot> = self
            .stats
            .iter()
            .map(|entry| {
                let (direction, opcode) = *entry.key();
                load_snapshot(direction, opcode, entry.value())
            })
            .collect();
        sort_snapshots(&mut snapshots);
        snapshots
    }

    /// Reset all counters and return what they held
    pub fn reset_all(&self) -> Vec<PacketStatsSnapshot> {
        let _guard = self
            .reset_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let keys: Vec<(Direction, Opcode)> = self.stats.iter().map(|entry| *entry.key()).collect();
        let mut snapshots = Vec::with_capacity(keys.len());

        for (direction, opcode) in keys {
            if let Some(entry) = self.stats.get(&(direction, opcode)) {
                let data = entry.value();
                let snapshot = PacketStatsSnapshot {
                    direction,
                    opcode,
                    forwarded: data.forwarded.swap(0, Ordering::AcqRel),
                    forwarded_bytes: data.forwarded_bytes.swap(0, Ordering::AcqRel),
                    dropped: data.dropped.swap(0, Ordering::AcqRel),
                    replied: data.replied.swap(0, Ordering::AcqRel),
                    failed: data.failed.swap(0, Ordering::AcqRel),
                };
                if snapshot.total() > 0 {
                    snapshots.push(snapshot);
                }
            }
        }

        // Keep the map bounded to opcodes that are still active
        self.stats.retain(|_, data| !is_empty(data));

        sort_snapshots(&mut snapshots);
        snapshots
    }

    /// Number of tracked (direction, opcode) pairs
    pub fn len(&self) -> usize {
        self.stats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stats.is_empty()
    }
}

fn load_snapshot(direction: Direction, opcode: Opcode, data: &PacketCounters) -> PacketStatsSnapshot {
    PacketStatsSnapshot {
        direction,
        opcode,
        forwarded: data.forwarded.load(Ordering::Relaxed),
        forwarded_bytes: data.forwarded_bytes.load(Ordering::Relaxed),
        dropped: data.dropped.load(Ordering::Relaxed),
        replied: data.replied.load(Ordering::Relaxed),
        failed: data.failed.load(Ordering::Relaxed),
    }
}

fn is_empty(data: &PacketCounters) -> bool {
    data.forwarded.load(Ordering::Relaxed) == 0
        && data.forwarded_bytes.load(Ordering::Relaxed) == 0
        && data.dropped.load(Ordering::Relaxed) == 0
        && data.replied.load(Ordering::Relaxed) == 0
        && data.failed.load(Ordering::Relaxed) == 0
}

fn sort_snapshots(snapshots: &mut [PacketStatsSnapshot]) {
    snapshots.sort_by_key(|s| (s.direction == Direction::Response, s.opcode.code()));
}

impl StatsCollector for PacketStats {
    fn record_forwarded(&self, direction: Direction, opcode: Opcode, bytes: u64) {
        let entry = self.stats.entry((direction, opcode)).or_default();
        entry.forwarded.fetch_add(1, Ordering::Relaxed);
        entry.forwarded_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    fn record_dropped(&self, direction: Direction, opcode: Opcode) {
        self.stats
            .entry((direction, opcode))
            .or_default()
            .dropped
            .fetch_add(1, Ordering::Relaxed);
    }

    fn record_replied(&self, direction: Direction, opcode: Opcode) {
        self.stats
            .entry((direction, opcode))
            .or_default()
            .replied
            .fetch_add(1, Ordering::Relaxed);
    }

    fn record_failed(&self, direction: Direction, opcode: Opcode) {
        self.stats
            .entry((direction, opcode))
            .or_default()
            .failed
            .fetch_add(1, Ordering::Relaxed);
    }
}
