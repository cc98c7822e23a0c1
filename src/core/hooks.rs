//! Hook traits for extensibility
//!
//! Defines the extension points that let packet-level logic be injected into the
//! interception core: the packet hook itself, the context it runs in, and the
//! statistics sink the pipeline reports to.

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;

use super::packet::{display_bytes, Packet};
use super::protocol::Opcode;
use crate::logger::log;

/// Connection identifier assigned by the connection manager
pub type ConnectionId = u64;

/// Which stream of a connection a packet travels on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// client -> server
    Request,
    /// server -> client
    Response,
}

impl Direction {
    pub const BOTH: [Direction; 2] = [Direction::Request, Direction::Response];

    /// Peer a forwarded packet is written to
    pub fn forward_peer(&self) -> Peer {
        match self {
            Direction::Request => Peer::Server,
            Direction::Response => Peer::Client,
        }
    }

    /// Peer a reply is written to (where the packet came from)
    pub fn reply_peer(&self) -> Peer {
        match self {
            Direction::Request => Peer::Client,
            Direction::Response => Peer::Server,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Request => write!(f, "request"),
            Direction::Response => write!(f, "response"),
        }
    }
}

/// One end of a proxied connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Peer {
    Client,
    Server,
}

/// Opcode selector used when registering a hook
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpcodeFilter {
    Exact(Opcode),
    /// Wildcard, matches every opcode
    Any,
}

impl FromStr for OpcodeFilter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "*" | "any" | "ANY" => Ok(OpcodeFilter::Any),
            other => other.parse().map(OpcodeFilter::Exact),
        }
    }
}

impl fmt::Display for OpcodeFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpcodeFilter::Exact(op) => write!(f, "{}", op),
            OpcodeFilter::Any => write!(f, "*"),
        }
    }
}

/// Decision returned by a single hook invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookAction {
    /// Pass the current packet on unchanged
    Forward,
    /// Replace the working packet and continue the chain
    ForwardModified(Packet),
    /// Suppress the packet, no later hook runs
    Drop,
    /// Suppress the packet and answer the sender with this packet instead
    Reply(Packet),
    /// No explicit decision, resolved by the dispatcher's default action
    Pass,
}

/// How a `HookAction::Pass` is resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DefaultAction {
    /// Implicit forward unless a hook drops
    #[default]
    Forward,
    /// Every hook must forward explicitly or the packet is dropped
    Drop,
}

impl FromStr for DefaultAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "forward" => Ok(DefaultAction::Forward),
            "drop" => Ok(DefaultAction::Drop),
            _ => Err(format!("invalid default action '{}', expected forward or drop", s)),
        }
    }
}

/// Per-invocation context handed to a hook
#[derive(Debug, Clone)]
pub struct HookContext<'a> {
    pub conn_id: ConnectionId,
    pub direction: Direction,
    /// Sequence number of the packet on its stream
    pub seq: u64,
    pub hook: &'a str,
}

impl HookContext<'_> {
    /// Log sink available to hooks, tagged with hook name and connection
    pub fn log(&self, msg: &str) {
        log::info!(
            hook = self.hook,
            conn_id = self.conn_id,
            direction = %self.direction,
            seq = self.seq,
            "{}",
            msg
        );
    }

    /// Bytes as text when valid UTF-8, hex otherwise
    pub fn bytes_to_string(&self, bytes: &[u8]) -> String {
        display_bytes(bytes)
    }

    pub fn string_to_bytes(&self, s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }
}

/// A packet hook
///
/// Hooks are shared by every connection and may be invoked concurrently from
/// different connections; any state they keep needs its own synchronization.
/// Within one connection direction invocations are strictly sequential.
#[async_trait]
pub trait PacketHook: Send + Sync {
    /// Name used in logs and drop reasons
    fn name(&self) -> &str;

    /// Inspect a packet and decide what happens to it
    async fn on_packet(&self, packet: &Packet, ctx: &HookContext<'_>) -> anyhow::Result<HookAction>;
}

/// Statistics collector trait for packet tracking
pub trait StatsCollector: Send + Sync {
    /// Packet written to its forward peer
    fn record_forwarded(&self, direction: Direction, opcode: Opcode, bytes: u64);
    /// Packet suppressed by a hook or the default action
    fn record_dropped(&self, direction: Direction, opcode: Opcode);
    /// Packet answered by a hook
    fn record_replied(&self, direction: Direction, opcode: Opcode);
    /// Hook chain failed or the result could not be encoded
    fn record_failed(&self, direction: Direction, opcode: Opcode);
}

/// Stats collector that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStats;

impl StatsCollector for NoopStats {
    fn record_forwarded(&self, _direction: Direction, _opcode: Opcode, _bytes: u64) {}
    fn record_dropped(&self, _direction: Direction, _opcode: Opcode) {}
    fn record_replied(&self, _direction: Direction, _opcode: Opcode) {}
    fn record_failed(&self, _direction: Direction, _opcode: Opcode) {}
}
