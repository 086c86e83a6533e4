//! Command table: descriptors, registry and per-family handlers.

pub mod generic;
pub mod scripting;
pub mod server_cmd;
pub mod string;
pub mod transaction;

use std::collections::HashMap;
use std::sync::Arc;

use crate::connection::ConnectionContext;

/// Command option bits.
pub mod co {
    pub const READONLY: u32 = 1 << 0;
    pub const WRITE: u32 = 1 << 1;
    pub const FAST: u32 = 1 << 2;
    /// Allowed while the server is loading or shutting down.
    pub const LOADING: u32 = 1 << 3;
    /// Refused when dispatched from inside a script.
    pub const NOSCRIPT: u32 = 1 << 4;
    /// Transactional without positional keys (EXEC, FLUSHDB).
    pub const GLOBAL_TRANS: u32 = 1 << 5;
    pub const ADMIN: u32 = 1 << 6;
}

pub type CmdHandler = fn(&[Vec<u8>], &mut ConnectionContext);

/// Validators run after the arity checks; on failure they write the error
/// themselves and return false.
pub type CmdValidator = fn(&[Vec<u8>], &mut ConnectionContext) -> bool;

/// Immutable descriptor for one command.
///
/// `arity` counts the command name itself: positive means exact, negative
/// means at-least `|arity|`. `first_key`/`last_key`/`key_step` describe
/// which argv slots hold keys; `last_key < 0` means "through the last
/// argument", `key_step == 2` means alternating key/value pairs.
pub struct CommandId {
    name: &'static str,
    opt_mask: u32,
    arity: i32,
    first_key: u32,
    last_key: i32,
    key_step: u32,
    handler: CmdHandler,
    validator: Option<CmdValidator>,
}

impl std::fmt::Debug for CommandId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandId")
            .field("name", &self.name)
            .field("opt_mask", &self.opt_mask)
            .field("arity", &self.arity)
            .finish()
    }
}

impl CommandId {
    pub fn new(
        name: &'static str,
        opt_mask: u32,
        arity: i32,
        first_key: u32,
        last_key: i32,
        key_step: u32,
        handler: CmdHandler,
    ) -> Self {
        debug_assert!(name.bytes().all(|b| b.is_ascii_uppercase() || !b.is_ascii_alphabetic()));
        CommandId {
            name,
            opt_mask,
            arity,
            first_key,
            last_key,
            key_step,
            handler,
            validator: None,
        }
    }

    pub fn with_validator(mut self, validator: CmdValidator) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn opt_mask(&self) -> u32 {
        self.opt_mask
    }

    pub fn arity(&self) -> i32 {
        self.arity
    }

    pub fn first_key_pos(&self) -> u32 {
        self.first_key
    }

    pub fn last_key_pos(&self) -> i32 {
        self.last_key
    }

    pub fn key_arg_step(&self) -> u32 {
        self.key_step
    }

    pub fn is_eval_kind(&self) -> bool {
        self.name == "EVAL" || self.name == "EVALSHA"
    }

    pub fn is_global_trans(&self) -> bool {
        self.opt_mask & co::GLOBAL_TRANS != 0
    }

    /// Whether the dispatcher builds a transaction for this command.
    pub fn is_transactional(&self) -> bool {
        self.first_key > 0 || self.is_global_trans() || self.is_eval_kind()
    }

    pub fn is_multi_key(&self) -> bool {
        self.first_key > 0 && (self.last_key < 0 || self.last_key as u32 > self.first_key)
    }

    /// Half-open `[start, end)` argv range holding keys, clamped to the
    /// actual argument count. Empty for keyless commands.
    pub fn key_range(&self, args_len: usize) -> (usize, usize) {
        if self.first_key == 0 {
            return (0, 0);
        }
        let start = self.first_key as usize;
        let end = if self.last_key < 0 {
            args_len
        } else {
            (self.last_key as usize + 1).min(args_len)
        };
        (start.min(end), end)
    }

    pub fn invoke(&self, args: &[Vec<u8>], ctx: &mut ConnectionContext) {
        (self.handler)(args, ctx);
    }

    /// Runs the attached validator, if any. A failing validator has already
    /// written the error reply.
    pub fn validate(&self, args: &[Vec<u8>], ctx: &mut ConnectionContext) -> bool {
        match self.validator {
            Some(validator) => validator(args, ctx),
            None => true,
        }
    }
}

/// Uppercase name -> descriptor. Built once at startup, immutable after.
#[derive(Debug, Default)]
pub struct CommandRegistry {
    entries: HashMap<&'static str, Arc<CommandId>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the full server command table.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        server_cmd::register(&mut registry);
        transaction::register(&mut registry);
        scripting::register(&mut registry);
        string::register(&mut registry);
        generic::register(&mut registry);
        registry
    }

    pub fn register(&mut self, cid: CommandId) {
        let prev = self.entries.insert(cid.name, Arc::new(cid));
        debug_assert!(prev.is_none(), "duplicate command registration");
    }

    /// Exact-case lookup; the dispatcher uppercases the name first.
    pub fn find(&self, name: &str) -> Option<Arc<CommandId>> {
        self.entries.get(name).cloned()
    }

    pub fn traverse(&self, mut visitor: impl FnMut(&str, &CommandId)) {
        for (name, cid) in &self.entries {
            visitor(name, cid);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// -- argv helpers shared by handlers ----------------------------------------

pub fn arg_as_str(arg: &[u8]) -> Option<&str> {
    std::str::from_utf8(arg).ok()
}

pub fn arg_to_i64(arg: &[u8]) -> Option<i64> {
    arg_as_str(arg)?.parse().ok()
}

pub fn arg_to_u64(arg: &[u8]) -> Option<u64> {
    arg_as_str(arg)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_contains_core_commands_exact_case() {
        let registry = CommandRegistry::with_builtins();
        for name in ["SET", "GET", "MULTI", "EXEC", "EVAL", "EVALSHA", "QUIT"] {
            assert!(registry.find(name).is_some(), "{name} missing");
        }
        assert!(registry.find("set").is_none());
        assert!(registry.find("NOPE").is_none());
    }

    #[test]
    fn transactional_classification() {
        let registry = CommandRegistry::with_builtins();
        assert!(registry.find("SET").unwrap().is_transactional());
        assert!(registry.find("EXEC").unwrap().is_transactional());
        assert!(registry.find("EVAL").unwrap().is_transactional());
        assert!(registry.find("EVALSHA").unwrap().is_transactional());
        assert!(!registry.find("PING").unwrap().is_transactional());
        assert!(!registry.find("MULTI").unwrap().is_transactional());
    }

    #[test]
    fn key_ranges_follow_positions() {
        let registry = CommandRegistry::with_builtins();
        let set = registry.find("SET").unwrap();
        assert_eq!(set.key_range(3), (1, 2));

        let mget = registry.find("MGET").unwrap();
        assert_eq!(mget.key_range(4), (1, 4));

        let mset = registry.find("MSET").unwrap();
        assert_eq!(mset.key_range(5), (1, 5));
        assert_eq!(mset.key_arg_step(), 2);

        let ping = registry.find("PING").unwrap();
        assert_eq!(ping.key_range(1), (0, 0));
    }

    #[test]
    fn multi_key_detection() {
        let registry = CommandRegistry::with_builtins();
        assert!(registry.find("MGET").unwrap().is_multi_key());
        assert!(registry.find("DEL").unwrap().is_multi_key());
        assert!(!registry.find("GET").unwrap().is_multi_key());
        assert!(!registry.find("EXEC").unwrap().is_multi_key());
    }

    #[test]
    fn traverse_visits_every_entry() {
        let registry = CommandRegistry::with_builtins();
        let mut count = 0;
        registry.traverse(|_, _| count += 1);
        assert_eq!(count, registry.len());
    }
}
