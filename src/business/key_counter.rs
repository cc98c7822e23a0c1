//! Per-key packet counter hook

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;

use crate::core::{HookAction, HookContext, Magic, Packet, PacketHook};

/// Shared key -> count store
///
/// Owned by the host and injected into `KeyCounter`, so counts survive across
/// connections and can be read while the proxy runs.
#[derive(Debug, Default)]
pub struct KeyCounts {
    counts: DashMap<String, u64>,
}

impl KeyCounts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment `key` and return the new count
    pub fn increment(&self, key: &str) -> u64 {
        let mut entry = self.counts.entry(key.to_string()).or_insert(0);
        *entry += 1;
        *entry
    }

    pub fn get(&self, key: &str) -> u64 {
        self.counts.get(key).map(|c| *c).unwrap_or(0)
    }

    /// Keys ordered by descending count
    pub fn top(&self, limit: usize) -> Vec<(String, u64)> {
        let mut all: Vec<(String, u64)> = self
            .counts
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        all.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        all.truncate(limit);
        all
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

/// Counts requests per key and forwards them unchanged
pub struct KeyCounter {
    counts: Arc<KeyCounts>,
}

impl KeyCounter {
    pub fn new(counts: Arc<KeyCounts>) -> Self {
        Self { counts }
    }

    pub fn counts(&self) -> &Arc<KeyCounts> {
        &self.counts
    }
}

#[async_trait]
impl PacketHook for KeyCounter {
    fn name(&self) -> &str {
        "key_counter"
    }

    async fn on_packet(&self, packet: &Packet, ctx: &HookContext<'_>) -> anyhow::Result<HookAction> {
        if packet.magic != Magic::Request {
            return Ok(HookAction::Forward);
        }
        let key = ctx.bytes_to_string(packet.key().unwrap_or_default());
        let count = self.counts.increment(&key);
        ctx.log(&format!("Got a {} for key {} {} times", packet.opcode, key, count));
        Ok(HookAction::Forward)
    }
}
