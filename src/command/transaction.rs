//! MULTI / EXEC / DISCARD handlers.
//!
//! Queueing happens in the dispatcher; these handlers drive the state
//! transitions and the EXEC replay loop.

use super::{co, CommandId, CommandRegistry};
use crate::connection::{ConnectionContext, ExecState};
use crate::error::EXEC_ABORT;
use crate::reply::ReplyBuilder;

pub fn register(registry: &mut CommandRegistry) {
    registry.register(CommandId::new(
        "MULTI",
        co::NOSCRIPT | co::FAST | co::LOADING,
        1,
        0,
        0,
        0,
        multi,
    ));
    registry.register(CommandId::new(
        "EXEC",
        co::LOADING | co::NOSCRIPT | co::GLOBAL_TRANS,
        1,
        0,
        0,
        0,
        exec,
    ));
    registry.register(CommandId::new(
        "DISCARD",
        co::NOSCRIPT | co::FAST | co::LOADING,
        1,
        0,
        0,
        0,
        discard,
    ));
}

fn multi(_args: &[Vec<u8>], ctx: &mut ConnectionContext) {
    if ctx.conn_state.exec_state != ExecState::Inactive {
        return ctx.reply().send_error("MULTI calls can not be nested");
    }
    ctx.conn_state.exec_state = ExecState::Collect;
    ctx.reply().send_ok();
}

fn exec(_args: &[Vec<u8>], ctx: &mut ConnectionContext) {
    match ctx.conn_state.exec_state {
        ExecState::Inactive => {
            return ctx.reply().send_error("EXEC without MULTI");
        }
        ExecState::Error => {
            ctx.conn_state.exec_state = ExecState::Inactive;
            ctx.conn_state.exec_body.clear();
            return ctx.reply().send_error(EXEC_ABORT);
        }
        ExecState::Collect => {}
    }

    let body = std::mem::take(&mut ctx.conn_state.exec_body);
    ctx.reply().start_array(body.len());

    if !body.is_empty() {
        let tx = ctx
            .transaction
            .clone()
            .expect("EXEC runs under a transaction");
        let db = ctx.conn_state.db_index;
        for stored in &body {
            tx.set_exec_cmd(stored.cid.clone());
            tx.init_by_args(db, &stored.args);
            stored.cid.invoke(&stored.args, ctx);
            if ctx.reply_ref().get_error() {
                break;
            }
        }
        tx.unlock_multi();
    }

    ctx.conn_state.exec_state = ExecState::Inactive;
    ctx.conn_state.exec_body.clear();
}

fn discard(_args: &[Vec<u8>], ctx: &mut ConnectionContext) {
    if ctx.conn_state.exec_state == ExecState::Inactive {
        return ctx.reply().send_error("DISCARD without MULTI");
    }
    ctx.conn_state.exec_state = ExecState::Inactive;
    ctx.conn_state.exec_body.clear();
    ctx.reply().send_ok();
}
