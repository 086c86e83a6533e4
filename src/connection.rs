//! Per-connection state: the protocol, auth and transaction machine the
//! dispatcher drives, plus the active reply sink.

use std::collections::HashSet;
use std::sync::Arc;

use crate::command::CommandId;
use crate::dispatch::Service;
use crate::reply::{McReplyBuilder, ReplySink, RespReplyBuilder};
use crate::transaction::Transaction;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Redis,
    Memcache,
}

/// Connection mask bits.
pub const REQ_AUTH: u32 = 1 << 0;
pub const AUTHENTICATED: u32 = 1 << 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecState {
    Inactive,
    /// MULTI seen; commands are being queued.
    Collect,
    /// A queued command failed validation; EXEC must abort.
    Error,
}

/// Present while a script runs on this connection.
#[derive(Debug)]
pub struct ScriptInfo {
    /// Keys declared in the EVAL argv; nested dispatches may only touch
    /// these.
    pub keys: HashSet<Vec<u8>>,
    pub is_write: bool,
}

/// One queued MULTI command: descriptor plus an owned argv copy.
#[derive(Debug)]
pub struct StoredCmd {
    pub cid: Arc<CommandId>,
    pub args: Vec<Vec<u8>>,
}

/// Debug fields recorded after each transactional command.
#[derive(Debug, Default, Clone, Copy)]
pub struct CommandDebug {
    pub clock: u64,
    pub is_ooo: bool,
    pub shards_count: usize,
}

#[derive(Debug)]
pub struct ConnectionState {
    pub db_index: usize,
    pub mask: u32,
    pub exec_state: ExecState,
    pub exec_body: Vec<StoredCmd>,
    pub script_info: Option<ScriptInfo>,
    /// Memcached flags carried across a translated store dispatch.
    pub memcache_flag: u32,
}

impl ConnectionState {
    fn new(mask: u32) -> Self {
        ConnectionState {
            db_index: 0,
            mask,
            exec_state: ExecState::Inactive,
            exec_body: Vec::new(),
            script_info: None,
            memcache_flag: 0,
        }
    }
}

/// Everything a handler invocation sees: the shared service, the mutable
/// connection state, the currently executing command and transaction, and
/// the reply sink.
pub struct ConnectionContext {
    pub service: Arc<Service>,
    pub protocol: Protocol,
    pub conn_state: ConnectionState,
    pub cid: Option<Arc<CommandId>>,
    pub transaction: Option<Arc<Transaction>>,
    pub last_command_debug: CommandDebug,
    reply: ReplySink,
}

impl ConnectionContext {
    pub fn new(service: Arc<Service>, protocol: Protocol) -> Self {
        // The memcached surface has no AUTH command, so password gating
        // applies to redis-protocol connections only.
        let mask = if protocol == Protocol::Redis && service.config.requirepass.is_some() {
            REQ_AUTH
        } else {
            0
        };
        let reply = match protocol {
            Protocol::Redis => ReplySink::Resp(RespReplyBuilder::new()),
            Protocol::Memcache => ReplySink::Mc(McReplyBuilder::new()),
        };
        ConnectionContext {
            service,
            protocol,
            conn_state: ConnectionState::new(mask),
            cid: None,
            transaction: None,
            last_command_debug: CommandDebug::default(),
            reply,
        }
    }

    pub fn reply(&mut self) -> &mut ReplySink {
        &mut self.reply
    }

    pub fn reply_ref(&self) -> &ReplySink {
        &self.reply
    }

    /// Installs a replacement sink, returning the previous one. The caller
    /// is responsible for restoring it on every exit path.
    pub fn swap_sink(&mut self, sink: ReplySink) -> ReplySink {
        std::mem::replace(&mut self.reply, sink)
    }

    pub fn take_output(&mut self) -> Vec<u8> {
        self.reply.take_output()
    }

    pub fn should_close(&self) -> bool {
        self.reply.should_close()
    }

    pub fn under_script(&self) -> bool {
        self.conn_state.script_info.is_some()
    }
}
