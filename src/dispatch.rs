//! The command dispatcher.
//!
//! [`Service`] owns the shared pieces every connection uses: the command
//! table, the sharded store, the server state and the script cache.
//! [`Service::dispatch_command`] is the single entry point for both
//! protocols and for re-entrant dispatch from scripts;
//! [`Service::dispatch_mc`] rewrites parsed memcached commands onto the
//! redis command set and funnels them through the same path.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Notify;
use tracing::{debug, info};

use crate::command::{co, CommandRegistry};
use crate::config::Config;
use crate::connection::{
    ConnectionContext, ExecState, Protocol, StoredCmd, AUTHENTICATED, REQ_AUTH,
};
use crate::error::{wrong_num_args, AUTH_REQUIRED, READONLY_REPLICA};
use crate::mc_protocol::{McCommand, McKind};
use crate::reply::{ReplyBuilder, ReplySink};
use crate::scripting::ScriptCache;
use crate::server_state::{GlobalState, ServerState};
use crate::store::DataStore;
use crate::transaction::Transaction;

pub struct Service {
    pub registry: CommandRegistry,
    pub store: Arc<DataStore>,
    pub state: Arc<ServerState>,
    pub scripts: ScriptCache,
    pub config: Config,
    /// Signalled by SHUTDOWN to stop the accept loops.
    pub shutdown: Notify,
}

impl Service {
    pub fn new(config: Config) -> Arc<Self> {
        let registry = CommandRegistry::with_builtins();
        let store = Arc::new(DataStore::new(config.shards, config.databases));
        let state = Arc::new(ServerState::new(config.replicaof.is_none()));

        registry.traverse(|name, cid| {
            if cid.is_multi_key() {
                let span = if cid.last_key_pos() < 0 {
                    "unlimited".to_string()
                } else {
                    (cid.last_key_pos() as u32 - cid.first_key_pos() + 1).to_string()
                };
                debug!("multi-key command {name}: {span} keys");
            }
        });
        info!(
            commands = registry.len(),
            shards = store.shard_count(),
            "command table ready"
        );

        Arc::new(Service {
            registry,
            store,
            state,
            scripts: ScriptCache::new(),
            config,
            shutdown: Notify::new(),
        })
    }

    pub fn new_conn_ctx(self: &Arc<Self>, protocol: Protocol) -> ConnectionContext {
        ConnectionContext::new(self.clone(), protocol)
    }

    pub fn is_pass_protected(&self) -> bool {
        self.config.requirepass.is_some()
    }

    /// Validates and executes one command against the connection.
    ///
    /// Every pre-execution failure poisons an open MULTI so the eventual
    /// EXEC aborts; once validation passes, the command is either queued
    /// (under MULTI) or executed with transaction state installed.
    pub fn dispatch_command(&self, mut args: Vec<Vec<u8>>, ctx: &mut ConnectionContext) {
        // Pre-execution failures flip a collecting MULTI into the error
        // state so EXEC aborts.
        fn fail(ctx: &mut ConnectionContext, msg: &str) {
            if ctx.conn_state.exec_state != ExecState::Inactive {
                ctx.conn_state.exec_state = ExecState::Error;
            }
            ctx.reply().send_error(msg);
        }

        if args.is_empty() {
            return;
        }
        args[0].make_ascii_uppercase();
        let cmd_str = String::from_utf8_lossy(&args[0]).into_owned();
        let is_trans_cmd = matches!(cmd_str.as_str(), "EXEC" | "MULTI" | "DISCARD");

        let Some(cid) = self.registry.find(&cmd_str) else {
            return fail(ctx, &format!("unknown command '{cmd_str}'"));
        };

        let gstate = self.state.global_state();
        if gstate != GlobalState::Active && cid.opt_mask() & co::LOADING == 0 {
            return fail(ctx, &format!("Can not execute during {}", gstate.name()));
        }

        if ctx.conn_state.mask & (REQ_AUTH | AUTHENTICATED) == REQ_AUTH && cid.name() != "AUTH" {
            return fail(ctx, AUTH_REQUIRED);
        }

        let under_script = ctx.under_script();
        if under_script && cid.opt_mask() & co::NOSCRIPT != 0 {
            return fail(ctx, "This Redis command is not allowed from script");
        }

        let script_is_write = ctx
            .conn_state
            .script_info
            .as_ref()
            .map(|info| info.is_write)
            .unwrap_or(false);
        let is_write_cmd = cid.opt_mask() & co::WRITE != 0 || (under_script && script_is_write);
        let under_multi = ctx.conn_state.exec_state != ExecState::Inactive && !is_trans_cmd;

        if !self.state.is_master() && is_write_cmd {
            return fail(ctx, READONLY_REPLICA);
        }

        let arity = cid.arity();
        if (arity > 0 && args.len() != arity as usize)
            || (arity < 0 && args.len() < arity.unsigned_abs() as usize)
        {
            return fail(ctx, &wrong_num_args(&cmd_str));
        }
        if cid.key_arg_step() == 2 && args.len() % 2 == 0 {
            return fail(ctx, &wrong_num_args(&cmd_str));
        }

        if !cid.validate(&args, ctx) {
            // The validator wrote the error; the MULTI poisoning still
            // applies.
            if ctx.conn_state.exec_state != ExecState::Inactive {
                ctx.conn_state.exec_state = ExecState::Error;
            }
            return;
        }

        if under_multi {
            if cid.opt_mask() & co::ADMIN != 0 {
                return fail(ctx, "Can not run admin commands under transactions");
            }
            if cid.name() == "SELECT" {
                return fail(ctx, "Can not call SELECT within a transaction");
            }
        }

        // Validation passed; this command no longer poisons the MULTI.

        if ctx.conn_state.exec_state != ExecState::Inactive && !is_trans_cmd {
            ctx.conn_state.exec_body.push(StoredCmd {
                cid: cid.clone(),
                args,
            });
            return ctx.reply().send_simple_string("QUEUED");
        }

        let start = Instant::now();
        let mut fresh_tx: Option<Arc<Transaction>> = None;

        if under_script {
            let tx = ctx
                .transaction
                .clone()
                .expect("script dispatch without an enclosing transaction");

            let (kstart, kend) = cid.key_range(args.len());
            let step = cid.key_arg_step().max(1) as usize;
            let undeclared = {
                let script_info = ctx.conn_state.script_info.as_ref().unwrap();
                let mut i = kstart;
                let mut found = false;
                while i < kend {
                    if !script_info.keys.contains(&args[i]) {
                        found = true;
                        break;
                    }
                    i += step;
                }
                found
            };
            if undeclared {
                return ctx
                    .reply()
                    .send_error("script tried accessing undeclared key");
            }

            // Reuse the enclosing transaction, re-pointed at this command.
            tx.set_exec_cmd(cid.clone());
            tx.init_by_args(ctx.conn_state.db_index, &args);
        } else if cid.is_transactional() {
            let tx = Transaction::new(cid.clone(), self.store.clone());
            tx.init_by_args(ctx.conn_state.db_index, &args);
            ctx.last_command_debug.shards_count = tx.unique_shard_cnt();
            ctx.transaction = Some(tx.clone());
            fresh_tx = Some(tx);
        } else {
            ctx.transaction = None;
        }

        ctx.cid = Some(cid.clone());
        cid.invoke(&args, ctx);

        let latency_usec = start.elapsed().as_micros() as u64;
        self.state.metrics.record(&cmd_str, latency_usec);

        if let Some(tx) = fresh_tx {
            ctx.last_command_debug.clock = tx.txid();
            ctx.last_command_debug.is_ooo = tx.is_ooo();
        }

        if !under_script {
            ctx.transaction = None;
        }
    }

    /// Rewrites a parsed memcached command into redis argv and re-enters the
    /// dispatcher. The connection's sink is a memcached writer, so replies
    /// serialize as memcached text.
    pub fn dispatch_mc(&self, cmd: &McCommand, value: &[u8], ctx: &mut ConnectionContext) {
        let mut store_opt: Vec<u8> = Vec::new();
        let cmd_name: &str = match cmd.kind {
            McKind::Set => "SET",
            McKind::Replace => {
                store_opt.extend_from_slice(b"XX");
                "SET"
            }
            McKind::Add => {
                store_opt.extend_from_slice(b"NX");
                "SET"
            }
            McKind::Delete => "DEL",
            McKind::Incr => {
                store_opt.extend_from_slice(cmd.delta.to_string().as_bytes());
                "INCRBY"
            }
            McKind::Decr => {
                store_opt.extend_from_slice(cmd.delta.to_string().as_bytes());
                "DECRBY"
            }
            McKind::Append => "APPEND",
            McKind::Prepend => "PREPEND",
            McKind::Get | McKind::Gets => "MGET",
            McKind::Quit => "QUIT",
            McKind::Stats => {
                crate::command::server_cmd::stats_mc(ctx);
                return;
            }
            McKind::Version => {
                if let ReplySink::Mc(mc) = ctx.reply() {
                    mc.send_direct(&format!("VERSION {}\r\n", env!("CARGO_PKG_VERSION")));
                }
                return;
            }
            McKind::Unknown => {
                if let ReplySink::Mc(mc) = ctx.reply() {
                    mc.send_client_error("bad command line format");
                }
                return;
            }
        };

        let mut args: Vec<Vec<u8>> = Vec::with_capacity(4 + cmd.keys_ext.len());
        args.push(cmd_name.as_bytes().to_vec());
        if !cmd.key.is_empty() {
            args.push(cmd.key.clone());
        }

        if cmd.kind.is_store() {
            args.push(value.to_vec());
            if !store_opt.is_empty() {
                args.push(store_opt);
            }
            if cmd.expire_ts != 0 && cmd_name == "SET" {
                args.push(b"EX".to_vec());
                args.push(cmd.expire_ts.to_string().into_bytes());
            }
            ctx.conn_state.memcache_flag = cmd.flags;
        } else if cmd.kind.is_retrieval() {
            for key in &cmd.keys_ext {
                args.push(key.clone());
            }
        } else if !store_opt.is_empty() {
            args.push(store_opt);
        }

        self.dispatch_command(args, ctx);

        ctx.conn_state.memcache_flag = 0;
    }

    /// Whether an exclusive-intent lock on `key` would currently fail.
    pub fn is_locked(&self, db_index: usize, key: &[u8]) -> bool {
        self.store.key_is_locked(db_index, key)
    }

    /// Whether any shard-global lock is held.
    pub fn is_shard_set_locked(&self) -> bool {
        self.store.shard_set_locked()
    }
}
