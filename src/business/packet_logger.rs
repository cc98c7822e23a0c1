//! Verbose packet logging hook

use async_trait::async_trait;

use crate::core::packet::display_bytes;
use crate::core::{HookAction, HookContext, Packet, PacketHook};
use crate::logger::log;

/// Logs every packet it sees and forwards it
///
/// Level 1 logs the header summary, level 2 adds key and value, level 3 logs
/// a hex dump of the whole packet.
#[derive(Debug, Clone, Copy)]
pub struct PacketLogger {
    level: u8,
}

impl PacketLogger {
    pub const MAX_LEVEL: u8 = 3;

    pub fn new(level: u8) -> Self {
        Self {
            level: level.clamp(1, Self::MAX_LEVEL),
        }
    }

    pub fn level(&self) -> u8 {
        self.level
    }

    /// Render `packet` at this logger's level
    pub fn render(&self, packet: &Packet) -> String {
        let mut line = format!(
            "opaque 0x{:x} magic {} opcode 0x{:02x} ({})",
            packet.opaque,
            packet.magic,
            packet.opcode.code(),
            packet.opcode.name()
        );
        if let Some(status) = packet.status() {
            line.push_str(&format!(" result 0x{:04x}", status));
        }
        match self.level {
            1 => {}
            2 => {
                line.push_str(&format!(
                    " key: {} value: {}",
                    packet.key_display(),
                    display_bytes(&packet.value)
                ));
            }
            _ => match packet.encode() {
                Ok(raw) => line.push_str(&format!(" raw: {}", hex::encode(raw))),
                Err(e) => line.push_str(&format!(" raw: <{}>", e)),
            },
        }
        line
    }
}

#[async_trait]
impl PacketHook for PacketLogger {
    fn name(&self) -> &str {
        "logger"
    }

    async fn on_packet(&self, packet: &Packet, ctx: &HookContext<'_>) -> anyhow::Result<HookAction> {
        log::info!(
            conn_id = ctx.conn_id,
            direction = %ctx.direction,
            seq = ctx.seq,
            "{}",
            self.render(packet)
        );
        Ok(HookAction::Forward)
    }
}
