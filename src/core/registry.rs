//! Hook registry
//!
//! Ordered hook lists keyed by direction and opcode, plus a wildcard list per
//! direction. Built mutably at startup, then frozen behind an `Arc` and shared
//! read-only by every connection.

use std::collections::HashMap;
use std::sync::Arc;

use super::hooks::{Direction, OpcodeFilter, PacketHook};
use super::protocol::Opcode;

/// A registered hook
#[derive(Clone)]
pub struct HookEntry {
    pub direction: Direction,
    pub filter: OpcodeFilter,
    pub hook: Arc<dyn PacketHook>,
}

impl std::fmt::Debug for HookEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookEntry")
            .field("direction", &self.direction)
            .field("filter", &self.filter)
            .field("hook", &self.hook.name())
            .finish()
    }
}

#[derive(Debug, Default)]
pub struct HookRegistry {
    exact: HashMap<(Direction, Opcode), Vec<HookEntry>>,
    wildcard: HashMap<Direction, Vec<HookEntry>>,
    len: usize,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a hook; registration order is invocation order
    pub fn register(
        &mut self,
        direction: Direction,
        filter: OpcodeFilter,
        hook: Arc<dyn PacketHook>,
    ) {
        let entry = HookEntry {
            direction,
            filter,
            hook,
        };
        match filter {
            OpcodeFilter::Exact(opcode) => self
                .exact
                .entry((direction, opcode))
                .or_default()
                .push(entry),
            OpcodeFilter::Any => self.wildcard.entry(direction).or_default().push(entry),
        }
        self.len += 1;
    }

    /// Hooks for `opcode` on `direction`: exact matches first, then wildcards
    pub fn lookup(&self, direction: Direction, opcode: Opcode) -> impl Iterator<Item = &HookEntry> {
        let exact = self
            .exact
            .get(&(direction, opcode))
            .map(|v| v.as_slice())
            .unwrap_or_default();
        let wildcard = self
            .wildcard
            .get(&direction)
            .map(|v| v.as_slice())
            .unwrap_or_default();
        exact.iter().chain(wildcard.iter())
    }

    /// Whether any hook applies, without walking the chain
    pub fn has_hooks(&self, direction: Direction, opcode: Opcode) -> bool {
        self.lookup(direction, opcode).next().is_some()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::hooks::{HookAction, HookContext};
    use crate::core::packet::Packet;
    use async_trait::async_trait;

    struct Named(&'static str);

    #[async_trait]
    impl PacketHook for Named {
        fn name(&self) -> &str {
            self.0
        }

        async fn on_packet(
            &self,
            _packet: &Packet,
            _ctx: &HookContext<'_>,
        ) -> anyhow::Result<HookAction> {
            Ok(HookAction::Pass)
        }
    }

    fn names<'a>(entries: impl Iterator<Item = &'a HookEntry>) -> Vec<String> {
        entries.map(|e| e.hook.name().to_string()).collect()
    }

    #[test]
    fn test_lookup_exact_then_wildcard_in_registration_order() {
        let mut registry = HookRegistry::new();
        registry.register(Direction::Request, OpcodeFilter::Any, Arc::new(Named("any-1")));
        registry.register(
            Direction::Request,
            OpcodeFilter::Exact(Opcode::Get),
            Arc::new(Named("get-1")),
        );
        registry.register(Direction::Request, OpcodeFilter::Any, Arc::new(Named("any-2")));
        registry.register(
            Direction::Request,
            OpcodeFilter::Exact(Opcode::Get),
            Arc::new(Named("get-2")),
        );

        assert_eq!(
            names(registry.lookup(Direction::Request, Opcode::Get)),
            vec!["get-1", "get-2", "any-1", "any-2"]
        );
        assert_eq!(
            names(registry.lookup(Direction::Request, Opcode::Set)),
            vec!["any-1", "any-2"]
        );
        assert_eq!(registry.len(), 4);
    }

    #[test]
    fn test_lookup_respects_direction() {
        let mut registry = HookRegistry::new();
        registry.register(
            Direction::Response,
            OpcodeFilter::Exact(Opcode::Get),
            Arc::new(Named("resp-get")),
        );

        assert!(!registry.has_hooks(Direction::Request, Opcode::Get));
        assert!(registry.has_hooks(Direction::Response, Opcode::Get));
        assert!(!registry.has_hooks(Direction::Response, Opcode::Set));
    }

    #[test]
    fn test_empty_registry() {
        let registry = HookRegistry::new();
        assert!(registry.is_empty());
        assert_eq!(registry.lookup(Direction::Request, Opcode::Noop).count(), 0);
    }

    #[test]
    fn test_unknown_opcodes_are_distinct_keys() {
        let mut registry = HookRegistry::new();
        registry.register(
            Direction::Request,
            OpcodeFilter::Exact(Opcode::Unknown(0x89)),
            Arc::new(Named("select-bucket")),
        );
        assert!(registry.has_hooks(Direction::Request, Opcode::from(0x89)));
        assert!(!registry.has_hooks(Direction::Request, Opcode::from(0x8a)));
    }
}
