//! Hook file loading
//!
//! Turns a TOML hook file into a populated `HookRegistry`:
//!
//! ```toml
//! default_action = "forward"
//!
//! [[hooks]]
//! kind = "key_counter"
//! direction = "request"
//! opcode = "GET"
//! ```

use serde::Deserialize;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use super::filters::{DropHook, ReplyNotFound};
use super::key_counter::{KeyCounter, KeyCounts};
use super::packet_logger::PacketLogger;
use crate::core::{DefaultAction, Direction, HookRegistry, Opcode, OpcodeFilter, PacketHook};
use crate::error::{ProxyError, Result};
use crate::logger::log;

/// Built-in hook implementations selectable from the hook file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookKind {
    KeyCounter,
    Drop,
    ReplyNotFound,
    Logger,
}

/// Which stream(s) a hook is registered on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DirectionSpec {
    #[default]
    Request,
    Response,
    Both,
}

impl DirectionSpec {
    pub fn directions(&self) -> &'static [Direction] {
        match self {
            DirectionSpec::Request => &[Direction::Request],
            DirectionSpec::Response => &[Direction::Response],
            DirectionSpec::Both => &Direction::BOTH,
        }
    }
}

/// Opcode as written in the file: a name, `*`, or a raw number
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum OpcodeSpec {
    Code(u8),
    Name(String),
}

impl Default for OpcodeSpec {
    fn default() -> Self {
        OpcodeSpec::Name("*".to_string())
    }
}

impl OpcodeSpec {
    pub fn to_filter(&self) -> std::result::Result<OpcodeFilter, String> {
        match self {
            OpcodeSpec::Code(code) => Ok(OpcodeFilter::Exact(Opcode::from(*code))),
            OpcodeSpec::Name(name) => OpcodeFilter::from_str(name),
        }
    }
}

/// One `[[hooks]]` entry
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HookSpec {
    pub kind: HookKind,
    #[serde(default)]
    pub direction: DirectionSpec,
    #[serde(default)]
    pub opcode: OpcodeSpec,
    /// `drop` only: restrict to keys with this prefix
    pub key_prefix: Option<String>,
    /// `logger` only: verbosity 1-3
    pub level: Option<u8>,
}

/// Parsed hook file
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HookFile {
    #[serde(default)]
    pub default_action: DefaultAction,
    #[serde(default)]
    pub hooks: Vec<HookSpec>,
}

impl FromStr for HookFile {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self> {
        let file: HookFile = toml::from_str(s)?;
        for (i, spec) in file.hooks.iter().enumerate() {
            spec.validate()
                .map_err(|e| ProxyError::HookFile(format!("hooks[{}]: {}", i, e)))?;
        }
        Ok(file)
    }
}

impl HookSpec {
    fn validate(&self) -> std::result::Result<(), String> {
        self.opcode.to_filter()?;
        if self.key_prefix.is_some() && self.kind != HookKind::Drop {
            return Err("key_prefix is only valid for kind = \"drop\"".to_string());
        }
        match self.level {
            Some(level) if self.kind != HookKind::Logger => {
                Err(format!("level {} is only valid for kind = \"logger\"", level))
            }
            Some(level) if !(1..=PacketLogger::MAX_LEVEL).contains(&level) => {
                Err(format!("logger level must be 1-3, got {}", level))
            }
            _ => Ok(()),
        }
    }

    /// Instantiate the hook; key counters share `key_counts`
    pub fn build(&self, key_counts: &Arc<KeyCounts>) -> Arc<dyn PacketHook> {
        match self.kind {
            HookKind::KeyCounter => Arc::new(KeyCounter::new(Arc::clone(key_counts))),
            HookKind::Drop => match &self.key_prefix {
                Some(prefix) => Arc::new(DropHook::with_key_prefix(prefix.clone())),
                None => Arc::new(DropHook::new()),
            },
            HookKind::ReplyNotFound => Arc::new(ReplyNotFound),
            HookKind::Logger => Arc::new(PacketLogger::new(self.level.unwrap_or(1))),
        }
    }
}

impl HookFile {
    /// Read and parse a hook file
    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| ProxyError::HookFile(format!("{}: {}", path.display(), e)))?;
        content.parse()
    }

    /// Register every hook in file order
    pub fn register_into(
        &self,
        registry: &mut HookRegistry,
        key_counts: &Arc<KeyCounts>,
    ) -> Result<()> {
        for spec in &self.hooks {
            let filter = spec.opcode.to_filter().map_err(ProxyError::HookFile)?;
            let hook = spec.build(key_counts);
            for &direction in spec.direction.directions() {
                log::debug!(
                    hook = hook.name(),
                    direction = %direction,
                    opcode = %filter,
                    "Hook registered"
                );
                registry.register(direction, filter, Arc::clone(&hook));
            }
        }
        Ok(())
    }
}

/// Register a wildcard packet logger on both directions
pub fn register_packet_logger(registry: &mut HookRegistry, level: u8) {
    let logger: Arc<dyn PacketHook> = Arc::new(PacketLogger::new(level));
    for direction in Direction::BOTH {
        registry.register(direction, OpcodeFilter::Any, Arc::clone(&logger));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
default_action = "drop"

[[hooks]]
kind = "key_counter"
opcode = "CMD_GET"

[[hooks]]
kind = "drop"
direction = "both"
opcode = "*"
key_prefix = "secret:"

[[hooks]]
kind = "logger"
direction = "response"
opcode = 0x04
level = 2
"#;

    #[test]
    fn test_parse_sample() {
        let file: HookFile = SAMPLE.parse().unwrap();
        assert_eq!(file.default_action, DefaultAction::Drop);
        assert_eq!(file.hooks.len(), 3);
        assert_eq!(file.hooks[0].kind, HookKind::KeyCounter);
        assert_eq!(file.hooks[0].direction, DirectionSpec::Request);
        assert_eq!(
            file.hooks[0].opcode.to_filter(),
            Ok(OpcodeFilter::Exact(Opcode::Get))
        );
        assert_eq!(file.hooks[1].opcode.to_filter(), Ok(OpcodeFilter::Any));
        assert_eq!(
            file.hooks[2].opcode.to_filter(),
            Ok(OpcodeFilter::Exact(Opcode::Delete))
        );
    }

    #[test]
    fn test_register_into() {
        let file: HookFile = SAMPLE.parse().unwrap();
        let mut registry = HookRegistry::new();
        let counts = Arc::new(KeyCounts::new());
        file.register_into(&mut registry, &counts).unwrap();

        // The "both" drop hook registers twice
        assert_eq!(registry.len(), 4);
        let names: Vec<&str> = registry
            .lookup(Direction::Request, Opcode::Get)
            .map(|e| e.hook.name())
            .collect();
        assert_eq!(names, vec!["key_counter", "drop"]);
        let names: Vec<&str> = registry
            .lookup(Direction::Response, Opcode::Delete)
            .map(|e| e.hook.name())
            .collect();
        assert_eq!(names, vec!["logger", "drop"]);
    }

    #[test]
    fn test_empty_file_defaults() {
        let file: HookFile = "".parse().unwrap();
        assert_eq!(file.default_action, DefaultAction::Forward);
        assert!(file.hooks.is_empty());
    }

    #[test]
    fn test_rejects_bad_entries() {
        let unknown_kind = "[[hooks]]\nkind = \"rewrite\"\nopcode = \"GET\"\n";
        assert!(matches!(
            unknown_kind.parse::<HookFile>(),
            Err(ProxyError::HookFile(_))
        ));

        let unknown_opcode = "[[hooks]]\nkind = \"drop\"\nopcode = \"FROB\"\n";
        assert!(matches!(
            unknown_opcode.parse::<HookFile>(),
            Err(ProxyError::HookFile(_))
        ));

        let misplaced_prefix = "[[hooks]]\nkind = \"logger\"\nkey_prefix = \"a\"\n";
        assert!(misplaced_prefix.parse::<HookFile>().is_err());

        let bad_level = "[[hooks]]\nkind = \"logger\"\nlevel = 7\n";
        assert!(bad_level.parse::<HookFile>().is_err());

        let unknown_field = "[[hooks]]\nkind = \"drop\"\ncolour = \"red\"\n";
        assert!(unknown_field.parse::<HookFile>().is_err());
    }

    #[tokio::test]
    async fn test_load_from_disk() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("hooks.toml");
        std::fs::write(&path, SAMPLE).unwrap();

        let file = HookFile::load(&path).await.unwrap();
        assert_eq!(file.hooks.len(), 3);

        let missing = HookFile::load(&temp_dir.path().join("nope.toml")).await;
        assert!(matches!(missing, Err(ProxyError::HookFile(_))));
    }

    #[test]
    fn test_register_packet_logger() {
        let mut registry = HookRegistry::new();
        register_packet_logger(&mut registry, 3);
        assert_eq!(registry.len(), 2);
        assert!(registry.has_hooks(Direction::Request, Opcode::Unknown(0xfe)));
        assert!(registry.has_hooks(Direction::Response, Opcode::Set));
    }

    #[tokio::test]
    async fn test_builtin_hooks_decide_for_untargeted_packets() {
        let file: HookFile = r#"
default_action = "drop"

[[hooks]]
kind = "key_counter"

[[hooks]]
kind = "drop"
key_prefix = "secret:"

[[hooks]]
kind = "reply_not_found"

[[hooks]]
kind = "logger"
level = 3
"#
        .parse()
        .unwrap();
        let counts = Arc::new(KeyCounts::new());
        let ctx = crate::core::HookContext {
            conn_id: 1,
            direction: Direction::Response,
            seq: 0,
            hook: "test",
        };
        // A backend response with a key no hook targets
        let response = crate::core::Packet::response(Opcode::Get, 0).with_key("public");

        for spec in &file.hooks {
            let hook = spec.build(&counts);
            let action = hook.on_packet(&response, &ctx).await.unwrap();
            assert_eq!(
                action,
                crate::core::HookAction::Forward,
                "{:?} left the decision to the default action",
                spec.kind
            );
        }
    }
}
