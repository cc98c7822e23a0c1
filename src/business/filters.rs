//! Blocking hooks: drop packets or answer them without reaching the backend

use async_trait::async_trait;
use bytes::Bytes;

use crate::core::packet::STATUS_KEY_ENOENT;
use crate::core::{HookAction, HookContext, Packet, PacketHook};

/// Drops matching packets, optionally only those whose key has a prefix
///
/// Everything else is forwarded explicitly, which keeps the prefix meaningful
/// under the drop default policy.
#[derive(Debug, Default)]
pub struct DropHook {
    key_prefix: Option<Bytes>,
}

impl DropHook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key_prefix(prefix: impl Into<Bytes>) -> Self {
        Self {
            key_prefix: Some(prefix.into()),
        }
    }

    fn matches(&self, packet: &Packet) -> bool {
        match &self.key_prefix {
            None => true,
            Some(prefix) => packet
                .key()
                .is_some_and(|key| key.starts_with(prefix)),
        }
    }
}

#[async_trait]
impl PacketHook for DropHook {
    fn name(&self) -> &str {
        "drop"
    }

    async fn on_packet(&self, packet: &Packet, _ctx: &HookContext<'_>) -> anyhow::Result<HookAction> {
        if self.matches(packet) {
            Ok(HookAction::Drop)
        } else {
            Ok(HookAction::Forward)
        }
    }
}

/// Answers requests with KEY_ENOENT, as if the backend had no such key
#[derive(Debug, Default)]
pub struct ReplyNotFound;

#[async_trait]
impl PacketHook for ReplyNotFound {
    fn name(&self) -> &str {
        "reply_not_found"
    }

    async fn on_packet(&self, packet: &Packet, _ctx: &HookContext<'_>) -> anyhow::Result<HookAction> {
        if !packet.is_request() {
            return Ok(HookAction::Forward);
        }
        Ok(HookAction::Reply(Packet::reply_to(packet, STATUS_KEY_ENOENT)))
    }
}
