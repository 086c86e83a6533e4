//! EVAL / EVALSHA / SCRIPT handlers and the script-to-dispatcher bridge.

use std::sync::Arc;

use super::{arg_as_str, arg_to_i64, co, CommandId, CommandRegistry};
use crate::connection::{ConnectionContext, ScriptInfo};
use crate::dispatch::Service;
use crate::error::{wrong_num_args, INVALID_INT, SCRIPT_NOT_FOUND};
use crate::reply::{InterpreterReplier, ReplyBuilder, ReplySink};
use crate::scripting::{
    is_hex_digest, AddResult, Interpreter, ObjectExplorer, RunResult, ScriptValue,
};

pub fn register(registry: &mut CommandRegistry) {
    registry.register(
        CommandId::new("EVAL", co::NOSCRIPT, -3, 0, 0, 0, eval).with_validator(eval_validator),
    );
    registry.register(
        CommandId::new("EVALSHA", co::NOSCRIPT, -3, 0, 0, 0, evalsha)
            .with_validator(eval_validator),
    );
    registry.register(CommandId::new("SCRIPT", co::NOSCRIPT, -2, 0, 0, 0, script));
}

/// `argv[2]` must parse as a non-negative int32 no larger than the number of
/// trailing arguments.
pub fn eval_validator(args: &[Vec<u8>], ctx: &mut ConnectionContext) -> bool {
    let num_keys = arg_as_str(&args[2]).and_then(|s| s.parse::<i32>().ok());
    let Some(num_keys) = num_keys.filter(|n| *n >= 0) else {
        ctx.reply().send_error(INVALID_INT);
        return false;
    };
    if num_keys as usize > args.len() - 3 {
        ctx.reply()
            .send_error("Number of keys can't be greater than number of args");
        return false;
    }
    true
}

struct EvalArgs {
    sha: String,
    keys: Vec<Vec<u8>>,
    args: Vec<Vec<u8>>,
}

fn split_eval_args(sha: String, args: &[Vec<u8>]) -> EvalArgs {
    // Already range-checked by the validator.
    let num_keys = arg_to_i64(&args[2]).unwrap_or(0).max(0) as usize;
    EvalArgs {
        sha,
        keys: args[3..3 + num_keys].to_vec(),
        args: args[3 + num_keys..].to_vec(),
    }
}

/// EVAL body numkeys key [key ...] arg [arg ...]
fn eval(args: &[Vec<u8>], ctx: &mut ConnectionContext) {
    let body_text = String::from_utf8_lossy(&args[1]).into_owned();
    let body = body_text.trim();
    if body.is_empty() {
        return ctx.reply().send_null();
    }

    let service = ctx.service.clone();
    let mut interp = service.state.interpreter.lock().unwrap();
    let sha = match interp.add_function(body) {
        AddResult::CompileErr(msg) => return ctx.reply().send_error(&msg),
        AddResult::Ok(sha) => {
            service.scripts.insert(&sha, body);
            sha
        }
        AddResult::AlreadyExists(sha) => sha,
    };

    let eval_args = split_eval_args(sha, args);
    eval_internal(&service, &eval_args, &mut interp, ctx);
}

/// EVALSHA sha1 numkeys key [key ...] arg [arg ...]
fn evalsha(args: &[Vec<u8>], ctx: &mut ConnectionContext) {
    let sha = String::from_utf8_lossy(&args[1]).to_lowercase();

    let service = ctx.service.clone();
    let mut interp = service.state.interpreter.lock().unwrap();
    if !interp.exists(&sha) {
        let body = if sha.len() == 40 {
            service.scripts.get(&sha)
        } else {
            None
        };
        let Some(body) = body else {
            return ctx.reply().send_error(SCRIPT_NOT_FOUND);
        };
        match interp.add_function(&body) {
            AddResult::Ok(computed) | AddResult::AlreadyExists(computed) => {
                debug_assert_eq!(computed, sha)
            }
            AddResult::CompileErr(msg) => return ctx.reply().send_error(&msg),
        }
    }

    let eval_args = split_eval_args(sha, args);
    eval_internal(&service, &eval_args, &mut interp, ctx);
}

/// Shared execution path for both entry points.
///
/// Preconditions: no script is active on this connection, and the
/// dispatcher installed a transaction (EVAL/EVALSHA are transactional).
fn eval_internal(
    service: &Arc<Service>,
    eval_args: &EvalArgs,
    interp: &mut Interpreter,
    ctx: &mut ConnectionContext,
) {
    // Hash shape gate, so a crafted EVALSHA argument can never reach the VM.
    if eval_args.sha.len() != 40 || !is_hex_digest(&eval_args.sha) {
        return ctx.reply().send_error(SCRIPT_NOT_FOUND);
    }

    if !interp.exists(&eval_args.sha) {
        let Some(body) = service.scripts.get(&eval_args.sha) else {
            return ctx.reply().send_error(SCRIPT_NOT_FOUND);
        };
        match interp.add_function(&body) {
            AddResult::Ok(sha) | AddResult::AlreadyExists(sha) => {
                debug_assert_eq!(sha, eval_args.sha)
            }
            AddResult::CompileErr(msg) => return ctx.reply().send_error(&msg),
        }
    }

    debug_assert!(ctx.conn_state.script_info.is_none());
    let tx = ctx
        .transaction
        .clone()
        .expect("scripts run under a transaction");

    // Scripts are conservatively treated as writers until the body is
    // inspected for read-only call sets.
    ctx.conn_state.script_info = Some(ScriptInfo {
        keys: eval_args.keys.iter().cloned().collect(),
        is_write: true,
    });

    if !eval_args.keys.is_empty() {
        tx.schedule();
    }

    interp.set_global_array("KEYS", &eval_args.keys);
    interp.set_global_array("ARGV", &eval_args.args);

    let run_result = {
        let svc = service.clone();
        let mut hook = |argv: Vec<Vec<u8>>| call_from_script(&svc, ctx, argv);
        interp.run_function(&eval_args.sha, &mut hook)
    };

    ctx.conn_state.script_info = None;

    // The multi-key scope ends whether the body succeeded or not.
    if !eval_args.keys.is_empty() {
        tx.unlock_multi();
    }

    match run_result {
        RunResult::Err(error) => {
            let msg = format!("Error running script (call to {}): {error}", eval_args.sha);
            ctx.reply().send_error(&msg);
        }
        RunResult::Ok => {
            if !interp.is_result_safe() {
                ctx.reply().send_error("reached lua stack limit");
            } else {
                let mut serializer = EvalSerializer { rb: ctx.reply() };
                interp.serialize_result(&mut serializer);
            }
        }
    }
    interp.reset_stack();
}

/// Re-entrant dispatch for `redis.call`/`redis.pcall`: installs a replier
/// that captures the reply for the VM, runs the command through the normal
/// dispatch path, and restores the connection's sink.
pub fn call_from_script(
    service: &Arc<Service>,
    ctx: &mut ConnectionContext,
    args: Vec<Vec<u8>>,
) -> ScriptValue {
    debug_assert!(ctx.transaction.is_some());
    let orig = ctx.swap_sink(ReplySink::Script(InterpreterReplier::new()));
    service.dispatch_command(args, ctx);
    match ctx.swap_sink(orig) {
        ReplySink::Script(replier) => replier.into_value(),
        _ => ScriptValue::Nil,
    }
}

/// Streams a script result into the connection's reply builder.
struct EvalSerializer<'a> {
    rb: &'a mut ReplySink,
}

impl ObjectExplorer for EvalSerializer<'_> {
    fn on_bool(&mut self, b: bool) {
        if b {
            self.rb.send_long(1);
        } else {
            self.rb.send_null();
        }
    }

    fn on_string(&mut self, s: &[u8]) {
        self.rb.send_bulk_string(s);
    }

    fn on_int(&mut self, v: i64) {
        self.rb.send_long(v);
    }

    fn on_double(&mut self, v: f64) {
        self.rb.send_double(v);
    }

    fn on_nil(&mut self) {
        self.rb.send_null();
    }

    fn on_status(&mut self, s: &str) {
        self.rb.send_simple_string(s);
    }

    fn on_error(&mut self, s: &str) {
        self.rb.send_error(s);
    }

    fn on_array_start(&mut self, len: usize) {
        // RESP arrays are length-prefixed, so no close event is needed.
        self.rb.start_array(len);
    }

    fn on_array_end(&mut self) {}
}

/// SCRIPT LOAD body | SCRIPT EXISTS sha [sha ...] | SCRIPT FLUSH
fn script(args: &[Vec<u8>], ctx: &mut ConnectionContext) {
    let sub = String::from_utf8_lossy(&args[1]).to_uppercase();
    let service = ctx.service.clone();
    match sub.as_str() {
        "LOAD" => {
            if args.len() != 3 {
                return ctx.reply().send_error(&wrong_num_args("SCRIPT|LOAD"));
            }
            let body_text = String::from_utf8_lossy(&args[2]).into_owned();
            let body = body_text.trim();
            let mut interp = service.state.interpreter.lock().unwrap();
            let sha = match interp.add_function(body) {
                AddResult::CompileErr(msg) => return ctx.reply().send_error(&msg),
                AddResult::Ok(sha) | AddResult::AlreadyExists(sha) => sha,
            };
            service.scripts.insert(&sha, body);
            ctx.reply().send_bulk_string(sha.as_bytes());
        }
        "EXISTS" => {
            if args.len() < 3 {
                return ctx.reply().send_error(&wrong_num_args("SCRIPT|EXISTS"));
            }
            let flags: Vec<i64> = args[2..]
                .iter()
                .map(|arg| {
                    let sha = String::from_utf8_lossy(arg).to_lowercase();
                    i64::from(service.scripts.contains(&sha))
                })
                .collect();
            ctx.reply().start_array(flags.len());
            for flag in flags {
                ctx.reply().send_long(flag);
            }
        }
        "FLUSH" => {
            service.scripts.flush();
            ctx.reply().send_ok();
        }
        _ => {
            let msg = format!(
                "Unknown SCRIPT subcommand or wrong number of arguments for '{sub}'"
            );
            ctx.reply().send_error(&msg);
        }
    }
}
