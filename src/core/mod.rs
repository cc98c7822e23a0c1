//! Core interception engine
//!
//! This module contains the protocol-facing machinery:
//! - Binary protocol framing and the packet model
//! - Hook traits, registry and dispatch
//! - Per-direction pipelines and the relay plumbing
//! - Connection management

mod connection;
pub mod dispatch;
pub mod hooks;
pub mod packet;
pub mod pipeline;
pub mod protocol;
pub mod registry;
pub mod relay;
mod server;

pub use connection::{ConnectionInfo, ConnectionManager};
pub use dispatch::{DispatchMeta, DispatchResult, Dispatcher, DropReason};
pub use hooks::{
    ConnectionId, DefaultAction, Direction, HookAction, HookContext, OpcodeFilter, PacketHook,
    Peer, StatsCollector,
};
pub use packet::Packet;
pub use pipeline::{Outbound, Pipeline, PipelineSummary};
pub use protocol::{Frame, FrameDecoder, Header, Magic, Opcode};
pub use registry::HookRegistry;
pub use server::{Server, ServerBuilder};
