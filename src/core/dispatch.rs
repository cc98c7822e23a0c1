//! Dispatch engine
//!
//! Runs the hook chain for one packet and resolves a single result. A failing
//! hook (error, panic or deadline breach) drops only the packet it was
//! processing; the chain's partial state is never forwarded.

use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use super::hooks::{ConnectionId, DefaultAction, Direction, HookAction, HookContext};
use super::packet::Packet;
use super::registry::HookRegistry;
use crate::logger::log;

/// Why a packet was not forwarded
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    /// A hook returned `Drop`
    Hook(String),
    /// A hook passed and the default action is drop
    Policy(String),
    /// A hook errored, panicked or timed out
    HookFailure(String),
}

/// Final outcome for one packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchResult {
    /// Forward the packet exactly as received
    Forward(Packet),
    /// Forward a packet some hook replaced
    ForwardModified(Packet),
    Drop(DropReason),
    /// Answer the sender, forward nothing
    Reply(Packet),
}

impl DispatchResult {
    pub fn is_drop(&self) -> bool {
        matches!(self, DispatchResult::Drop(_))
    }
}

/// Connection-level information for one dispatch
#[derive(Debug, Clone, Copy)]
pub struct DispatchMeta {
    pub conn_id: ConnectionId,
    pub direction: Direction,
    pub seq: u64,
}

pub struct Dispatcher {
    registry: Arc<HookRegistry>,
    default_action: DefaultAction,
    hook_timeout: Option<Duration>,
}

impl Dispatcher {
    pub fn new(registry: Arc<HookRegistry>) -> Self {
        Self {
            registry,
            default_action: DefaultAction::default(),
            hook_timeout: None,
        }
    }

    /// Resolve `HookAction::Pass` with `action`
    pub fn with_default_action(mut self, action: DefaultAction) -> Self {
        self.default_action = action;
        self
    }

    /// Treat a hook running longer than `timeout` as failed
    pub fn with_hook_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.hook_timeout = timeout;
        self
    }

    pub fn registry(&self) -> &HookRegistry {
        &self.registry
    }

    pub fn default_action(&self) -> DefaultAction {
        self.default_action
    }

    /// Run the hook chain for `packet` and resolve one result
    pub async fn dispatch(&self, packet: Packet, meta: DispatchMeta) -> DispatchResult {
        let mut working: Option<Packet> = None;

        for entry in self.registry.lookup(meta.direction, packet.opcode) {
            let name = entry.hook.name();
            let ctx = HookContext {
                conn_id: meta.conn_id,
                direction: meta.direction,
                seq: meta.seq,
                hook: name,
            };
            let current = working.as_ref().unwrap_or(&packet);

            let action = match self.invoke(entry.hook.on_packet(current, &ctx)).await {
                Ok(action) => action,
                Err(reason) => {
                    log::warn!(
                        conn_id = meta.conn_id,
                        direction = %meta.direction,
                        seq = meta.seq,
                        opcode = %packet.opcode,
                        hook = name,
                        error = %reason,
                        "Hook failed, dropping packet"
                    );
                    return DispatchResult::Drop(DropReason::HookFailure(name.to_string()));
                }
            };

            match action {
                HookAction::Forward => {}
                HookAction::ForwardModified(modified) => working = Some(modified),
                HookAction::Pass => {
                    if self.default_action == DefaultAction::Drop {
                        log::debug!(
                            conn_id = meta.conn_id,
                            seq = meta.seq,
                            hook = name,
                            "Hook did not forward, dropping by policy"
                        );
                        return DispatchResult::Drop(DropReason::Policy(name.to_string()));
                    }
                }
                HookAction::Drop => {
                    log::debug!(
                        conn_id = meta.conn_id,
                        seq = meta.seq,
                        opcode = %packet.opcode,
                        hook = name,
                        "Packet dropped by hook"
                    );
                    return DispatchResult::Drop(DropReason::Hook(name.to_string()));
                }
                HookAction::Reply(reply) => {
                    log::debug!(
                        conn_id = meta.conn_id,
                        seq = meta.seq,
                        opcode = %packet.opcode,
                        hook = name,
                        "Packet answered by hook"
                    );
                    return DispatchResult::Reply(reply);
                }
            }
        }

        match working {
            Some(modified) => DispatchResult::ForwardModified(modified),
            None => DispatchResult::Forward(packet),
        }
    }

    /// Await one hook call, turning errors, panics and timeouts into a reason
    async fn invoke<F>(&self, call: F) -> Result<HookAction, String>
    where
        F: std::future::Future<Output = anyhow::Result<HookAction>>,
    {
        let guarded = AssertUnwindSafe(call).catch_unwind();
        let outcome = match self.hook_timeout {
            Some(limit) => match tokio::time::timeout(limit, guarded).await {
                Ok(outcome) => outcome,
                Err(_) => return Err(format!("timed out after {:?}", limit)),
            },
            None => guarded.await,
        };

        match outcome {
            Ok(Ok(action)) => Ok(action),
            Ok(Err(e)) => Err(format!("{:#}", e)),
            Err(panic) => Err(panic_message(panic.as_ref())),
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panicked: {}", s)
    } else {
        "panicked".to_string()
    }
}
