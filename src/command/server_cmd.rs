//! Connection and server administration handlers.

use super::{arg_as_str, co, CommandId, CommandRegistry};
use crate::connection::{ConnectionContext, Protocol, AUTHENTICATED};
use crate::error::wrong_num_args;
use crate::reply::{ReplyBuilder, ReplySink};
use crate::server_state::GlobalState;

pub fn register(registry: &mut CommandRegistry) {
    registry.register(CommandId::new("PING", co::FAST, -1, 0, 0, 0, ping));
    registry.register(CommandId::new("ECHO", co::READONLY | co::FAST, 2, 0, 0, 0, echo));
    registry.register(CommandId::new(
        "AUTH",
        co::NOSCRIPT | co::FAST | co::LOADING,
        2,
        0,
        0,
        0,
        auth,
    ));
    registry.register(CommandId::new("QUIT", co::READONLY | co::FAST, 1, 0, 0, 0, quit));
    registry.register(CommandId::new(
        "SHUTDOWN",
        co::ADMIN | co::NOSCRIPT | co::LOADING,
        1,
        0,
        0,
        0,
        shutdown,
    ));
}

fn ping(args: &[Vec<u8>], ctx: &mut ConnectionContext) {
    match args.len() {
        1 => ctx.reply().send_simple_string("PONG"),
        2 => {
            let payload = args[1].clone();
            ctx.reply().send_bulk_string(&payload)
        }
        _ => ctx.reply().send_error(&wrong_num_args("PING")),
    }
}

fn echo(args: &[Vec<u8>], ctx: &mut ConnectionContext) {
    let payload = args[1].clone();
    ctx.reply().send_bulk_string(&payload);
}

fn auth(args: &[Vec<u8>], ctx: &mut ConnectionContext) {
    let Some(expected) = ctx.service.config.requirepass.clone() else {
        return ctx
            .reply()
            .send_error("Client sent AUTH, but no password is set.");
    };
    let matches = arg_as_str(&args[1]).map(|given| given == expected).unwrap_or(false);
    if matches {
        ctx.conn_state.mask |= AUTHENTICATED;
        ctx.reply().send_ok();
    } else {
        ctx.reply().send_error("invalid password");
    }
}

fn quit(_args: &[Vec<u8>], ctx: &mut ConnectionContext) {
    if ctx.protocol == Protocol::Redis {
        ctx.reply().send_ok();
    }
    ctx.reply().close_connection();
}

fn shutdown(_args: &[Vec<u8>], ctx: &mut ConnectionContext) {
    ctx.service
        .state
        .set_global_state(GlobalState::ShuttingDown);
    ctx.service.shutdown.notify_waiters();
    ctx.reply().send_ok();
    ctx.reply().close_connection();
}

/// Memcached `stats`: served out-of-band by the adapter, not via the
/// command table.
pub fn stats_mc(ctx: &mut ConnectionContext) {
    let total = ctx.service.state.metrics.total_requests();
    let keys = ctx.service.store.db_size(0);
    let mut text = String::new();
    text.push_str(&format!("STAT version {}\r\n", env!("CARGO_PKG_VERSION")));
    text.push_str(&format!("STAT cmd_total {total}\r\n"));
    text.push_str(&format!("STAT curr_items {keys}\r\n"));
    text.push_str("END\r\n");
    if let ReplySink::Mc(mc) = ctx.reply() {
        mc.send_direct(&text);
    }
}
