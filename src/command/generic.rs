//! Generic keyspace and connection-scoped command handlers.

use super::{arg_to_i64, co, CommandId, CommandRegistry};
use crate::connection::ConnectionContext;
use crate::error::INVALID_INT;
use crate::reply::ReplyBuilder;
use crate::store::now_millis;

pub fn register(registry: &mut CommandRegistry) {
    registry.register(CommandId::new("DEL", co::WRITE, -2, 1, -1, 1, del));
    registry.register(CommandId::new("EXISTS", co::READONLY | co::FAST, -2, 1, -1, 1, exists));
    registry.register(CommandId::new("EXPIRE", co::WRITE | co::FAST, 3, 1, 1, 1, expire));
    registry.register(CommandId::new("TTL", co::READONLY | co::FAST, 2, 1, 1, 1, ttl));
    registry.register(CommandId::new("SELECT", co::LOADING | co::FAST, 2, 0, 0, 0, select));
    registry.register(CommandId::new(
        "FLUSHDB",
        co::WRITE | co::GLOBAL_TRANS,
        1,
        0,
        0,
        0,
        flushdb,
    ));
}

fn del(args: &[Vec<u8>], ctx: &mut ConnectionContext) {
    let store = ctx.service.store.clone();
    let db = ctx.conn_state.db_index;
    let removed = args[1..].iter().filter(|key| store.remove(db, key)).count();
    ctx.reply().send_long(removed as i64);
}

fn exists(args: &[Vec<u8>], ctx: &mut ConnectionContext) {
    let store = ctx.service.store.clone();
    let db = ctx.conn_state.db_index;
    let found = args[1..]
        .iter()
        .filter(|key| store.get(db, key).is_some())
        .count();
    ctx.reply().send_long(found as i64);
}

fn expire(args: &[Vec<u8>], ctx: &mut ConnectionContext) {
    let Some(seconds) = arg_to_i64(&args[2]) else {
        return ctx.reply().send_error(INVALID_INT);
    };
    let key = &args[1];
    let store = ctx.service.store.clone();
    let applied = store.with_map(ctx.conn_state.db_index, key, |map| {
        if seconds <= 0 {
            return map.remove(key.as_slice()).is_some();
        }
        match map.get_mut(key.as_slice()) {
            Some(entry) => {
                entry.expires_at = Some(now_millis() + (seconds as u64) * 1000);
                true
            }
            None => false,
        }
    });
    ctx.reply().send_long(if applied { 1 } else { 0 });
}

fn ttl(args: &[Vec<u8>], ctx: &mut ConnectionContext) {
    let reply = match ctx.service.store.get(ctx.conn_state.db_index, &args[1]) {
        None => -2,
        Some(entry) => match entry.ttl_millis(now_millis()) {
            -1 => -1,
            ms => (ms + 999) / 1000,
        },
    };
    ctx.reply().send_long(reply);
}

fn select(args: &[Vec<u8>], ctx: &mut ConnectionContext) {
    let index = match arg_to_i64(&args[1]) {
        Some(index) if index >= 0 => index as usize,
        _ => return ctx.reply().send_error(INVALID_INT),
    };
    if index >= ctx.service.store.num_dbs() {
        return ctx.reply().send_error("DB index is out of range");
    }
    ctx.conn_state.db_index = index;
    ctx.reply().send_ok();
}

fn flushdb(_args: &[Vec<u8>], ctx: &mut ConnectionContext) {
    ctx.service.store.flush_db(ctx.conn_state.db_index);
    ctx.reply().send_ok();
}
