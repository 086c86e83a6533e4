//! Embedded Lua scripting engine for EVAL / EVALSHA.
//!
//! Embeds Lua 5.4 via `mlua`. The [`Interpreter`] keeps compiled script
//! bodies keyed by their SHA1 and runs each invocation in a fresh VM with
//! `KEYS`, `ARGV` and a `redis` table whose `call`/`pcall` re-enter the
//! dispatcher through a caller-supplied hook. Results come back as a
//! [`ScriptValue`] tree that is replayed through an [`ObjectExplorer`].

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use mlua::prelude::*;

/// Nesting depth past which a script result is considered unsafe to
/// serialize. Mirrors the interpreter stack guard.
const MAX_RESULT_DEPTH: usize = 128;

/// Compute the SHA1 hex digest of a script body.
pub fn sha1_hex(script: &str) -> String {
    sha1_smol::Sha1::from(script).digest().to_string()
}

/// Whether `s` looks like a lowercase/uppercase hex digest (any length).
pub fn is_hex_digest(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Process-wide script cache: SHA1 -> source body. Write-through on first
/// EVAL; EVALSHA consults it when the interpreter misses.
#[derive(Debug, Clone, Default)]
pub struct ScriptCache {
    scripts: Arc<Mutex<HashMap<String, String>>>,
}

impl ScriptCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a body under a known digest. Idempotent.
    pub fn insert(&self, sha: &str, body: &str) {
        let mut map = self.scripts.lock().unwrap();
        map.entry(sha.to_string())
            .or_insert_with(|| body.to_string());
    }

    /// Insert a body, computing and returning its digest (SCRIPT LOAD).
    pub fn load(&self, body: &str) -> String {
        let sha = sha1_hex(body);
        self.insert(&sha, body);
        sha
    }

    pub fn get(&self, sha: &str) -> Option<String> {
        self.scripts.lock().unwrap().get(sha).cloned()
    }

    pub fn contains(&self, sha: &str) -> bool {
        self.scripts.lock().unwrap().contains_key(sha)
    }

    pub fn flush(&self) {
        self.scripts.lock().unwrap().clear();
    }
}

/// Structured script result, protocol-neutral.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptValue {
    Nil,
    Int(i64),
    Double(f64),
    Bulk(Vec<u8>),
    Status(String),
    Error(String),
    Array(Vec<ScriptValue>),
}

/// Visitor over a structured result. Implemented by the serializer that
/// writes a script's return value to the client, and by the collector that
/// captures a nested `redis.call` reply for the VM.
pub trait ObjectExplorer {
    fn on_bool(&mut self, b: bool);
    fn on_string(&mut self, s: &[u8]);
    fn on_int(&mut self, v: i64);
    fn on_double(&mut self, v: f64);
    fn on_nil(&mut self);
    fn on_status(&mut self, s: &str);
    fn on_error(&mut self, s: &str);
    fn on_array_start(&mut self, len: usize);
    fn on_array_end(&mut self);
}

/// Collects explorer events back into a [`ScriptValue`] tree.
#[derive(Debug, Default)]
pub struct ScriptResultCollector {
    root: Option<ScriptValue>,
    stack: Vec<Vec<ScriptValue>>,
}

impl ScriptResultCollector {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, value: ScriptValue) {
        if let Some(frame) = self.stack.last_mut() {
            frame.push(value);
        } else if self.root.is_none() {
            self.root = Some(value);
        }
    }

    /// The collected value; `Nil` if nothing was emitted.
    pub fn into_value(self) -> ScriptValue {
        self.root.unwrap_or(ScriptValue::Nil)
    }
}

impl ObjectExplorer for ScriptResultCollector {
    fn on_bool(&mut self, b: bool) {
        self.push(if b { ScriptValue::Int(1) } else { ScriptValue::Nil });
    }

    fn on_string(&mut self, s: &[u8]) {
        self.push(ScriptValue::Bulk(s.to_vec()));
    }

    fn on_int(&mut self, v: i64) {
        self.push(ScriptValue::Int(v));
    }

    fn on_double(&mut self, v: f64) {
        self.push(ScriptValue::Double(v));
    }

    fn on_nil(&mut self) {
        self.push(ScriptValue::Nil);
    }

    fn on_status(&mut self, s: &str) {
        self.push(ScriptValue::Status(s.to_string()));
    }

    fn on_error(&mut self, s: &str) {
        self.push(ScriptValue::Error(s.to_string()));
    }

    fn on_array_start(&mut self, len: usize) {
        self.stack.push(Vec::with_capacity(len));
    }

    fn on_array_end(&mut self) {
        if let Some(items) = self.stack.pop() {
            self.push(ScriptValue::Array(items));
        }
    }
}

/// Replays a [`ScriptValue`] tree into an explorer.
pub fn explore_value(value: &ScriptValue, explr: &mut dyn ObjectExplorer) {
    match value {
        ScriptValue::Nil => explr.on_nil(),
        ScriptValue::Int(v) => explr.on_int(*v),
        ScriptValue::Double(v) => explr.on_double(*v),
        ScriptValue::Bulk(data) => explr.on_string(data),
        ScriptValue::Status(s) => explr.on_status(s),
        ScriptValue::Error(s) => explr.on_error(s),
        ScriptValue::Array(items) => {
            explr.on_array_start(items.len());
            for item in items {
                explore_value(item, explr);
            }
            explr.on_array_end();
        }
    }
}

pub enum AddResult {
    /// New function compiled; digest returned.
    Ok(String),
    /// Digest already known to this interpreter.
    AlreadyExists(String),
    /// Body failed to compile; error text returned.
    CompileErr(String),
}

#[derive(Debug, PartialEq, Eq)]
pub enum RunResult {
    Ok,
    Err(String),
}

/// The hook `redis.call`/`redis.pcall` invoke with a synthesized argv.
pub type RedisCallHook<'a> = &'a mut dyn FnMut(Vec<Vec<u8>>) -> ScriptValue;

/// A scripting engine handle. Exclusive use is enforced by the mutex it
/// lives behind on the server state; each run binds a fresh VM so no Lua
/// state leaks between invocations.
#[derive(Debug, Default)]
pub struct Interpreter {
    funcs: HashMap<String, String>,
    staged_keys: Vec<Vec<u8>>,
    staged_argv: Vec<Vec<u8>>,
    result: Option<ScriptValue>,
    result_safe: bool,
}

impl Interpreter {
    pub fn new() -> Self {
        Self {
            result_safe: true,
            ..Self::default()
        }
    }

    /// Registers a script body, compile-checking it first.
    pub fn add_function(&mut self, body: &str) -> AddResult {
        let sha = sha1_hex(body);
        if self.funcs.contains_key(&sha) {
            return AddResult::AlreadyExists(sha);
        }
        let lua = Lua::new();
        if let Err(err) = lua.load(body).into_function() {
            return AddResult::CompileErr(format!("Error compiling script: {err}"));
        }
        self.funcs.insert(sha.clone(), body.to_string());
        AddResult::Ok(sha)
    }

    pub fn exists(&self, sha: &str) -> bool {
        self.funcs.contains_key(sha)
    }

    /// Stages a global array (`KEYS` or `ARGV`) for the next run.
    pub fn set_global_array(&mut self, name: &str, values: &[Vec<u8>]) {
        match name {
            "KEYS" => self.staged_keys = values.to_vec(),
            "ARGV" => self.staged_argv = values.to_vec(),
            _ => {}
        }
    }

    /// Runs a previously added function. `redis_call` services nested
    /// `redis.call`/`redis.pcall` invocations from the script.
    pub fn run_function(&mut self, sha: &str, redis_call: RedisCallHook<'_>) -> RunResult {
        let Some(body) = self.funcs.get(sha).cloned() else {
            return RunResult::Err(format!("function {sha} not found"));
        };

        let lua = Lua::new();
        if let Err(err) = self.bind_globals(&lua) {
            return RunResult::Err(err.to_string());
        }

        let hook = RefCell::new(redis_call);
        let outcome: LuaResult<LuaValue> = lua.scope(|scope| {
            let call = scope.create_function_mut(|lua, args: LuaMultiValue| {
                let argv = lua_args_to_argv(&args)?;
                let reply = (*hook.borrow_mut())(argv);
                if let ScriptValue::Error(msg) = &reply {
                    return Err(LuaError::RuntimeError(msg.clone()));
                }
                script_value_to_lua(lua, &reply)
            })?;
            let pcall = scope.create_function_mut(|lua, args: LuaMultiValue| {
                let argv = lua_args_to_argv(&args)?;
                let reply = (*hook.borrow_mut())(argv);
                script_value_to_lua(lua, &reply)
            })?;

            let redis = lua.create_table()?;
            redis.set("call", call)?;
            redis.set("pcall", pcall)?;
            redis.set(
                "error_reply",
                lua.create_function(|lua, msg: LuaString| {
                    let t = lua.create_table()?;
                    t.set("err", msg)?;
                    Ok(LuaValue::Table(t))
                })?,
            )?;
            redis.set(
                "status_reply",
                lua.create_function(|lua, msg: LuaString| {
                    let t = lua.create_table()?;
                    t.set("ok", msg)?;
                    Ok(LuaValue::Table(t))
                })?,
            )?;
            redis.set(
                "log",
                lua.create_function(|_lua, _args: LuaMultiValue| Ok(()))?,
            )?;
            redis.set("LOG_DEBUG", 0)?;
            redis.set("LOG_VERBOSE", 1)?;
            redis.set("LOG_NOTICE", 2)?;
            redis.set("LOG_WARNING", 3)?;
            lua.globals().set("redis", redis)?;

            let func = lua
                .load(&body)
                .set_name(format!("@user_script: {sha}"))
                .into_function()?;
            func.call::<LuaValue>(())
        });

        match outcome {
            Ok(value) => {
                match lua_to_script_value(&value, 0) {
                    Ok(converted) => {
                        self.result = Some(converted);
                        self.result_safe = true;
                    }
                    Err(_) => {
                        self.result = Some(ScriptValue::Nil);
                        self.result_safe = false;
                    }
                }
                RunResult::Ok
            }
            Err(err) => RunResult::Err(flatten_lua_error(&err)),
        }
    }

    /// False when the last run produced a result nested past the stack guard.
    pub fn is_result_safe(&self) -> bool {
        self.result_safe
    }

    /// Replays the last run's result into `explr`.
    pub fn serialize_result(&self, explr: &mut dyn ObjectExplorer) {
        match &self.result {
            Some(value) => explore_value(value, explr),
            None => explr.on_nil(),
        }
    }

    /// Drops the saved result and staged globals.
    pub fn reset_stack(&mut self) {
        self.result = None;
        self.result_safe = true;
        self.staged_keys.clear();
        self.staged_argv.clear();
    }

    fn bind_globals(&self, lua: &Lua) -> LuaResult<()> {
        for (name, values) in [("KEYS", &self.staged_keys), ("ARGV", &self.staged_argv)] {
            let table = lua.create_table()?;
            for (i, value) in values.iter().enumerate() {
                table.set(i + 1, lua.create_string(value)?)?;
            }
            lua.globals().set(name, table)?;
        }
        Ok(())
    }
}

/// Lua error display includes a full traceback; the first line carries the
/// message clients care about.
fn flatten_lua_error(err: &LuaError) -> String {
    let text = err.to_string();
    match text.split_once('\n') {
        Some((first, _)) => first.trim_end().to_string(),
        None => text,
    }
}

struct DepthExceeded;

/// Lua -> result tree, following the redis conversion rules:
/// number -> integer (truncated), string -> bulk, true -> 1, false/nil ->
/// nil, `{ok=...}` -> status, `{err=...}` -> error, array table -> array.
fn lua_to_script_value(value: &LuaValue, depth: usize) -> Result<ScriptValue, DepthExceeded> {
    if depth > MAX_RESULT_DEPTH {
        return Err(DepthExceeded);
    }
    Ok(match value {
        LuaValue::Nil | LuaValue::Boolean(false) => ScriptValue::Nil,
        LuaValue::Boolean(true) => ScriptValue::Int(1),
        LuaValue::Integer(n) => ScriptValue::Int(*n),
        LuaValue::Number(n) => ScriptValue::Int(*n as i64),
        LuaValue::String(s) => ScriptValue::Bulk(s.as_bytes().to_vec()),
        LuaValue::Table(t) => {
            if let Ok(LuaValue::String(s)) = t.get::<LuaValue>("ok") {
                return Ok(ScriptValue::Status(
                    String::from_utf8_lossy(&s.as_bytes()).into_owned(),
                ));
            }
            if let Ok(LuaValue::String(s)) = t.get::<LuaValue>("err") {
                return Ok(ScriptValue::Error(
                    String::from_utf8_lossy(&s.as_bytes()).into_owned(),
                ));
            }
            let len = t.raw_len();
            let mut items = Vec::with_capacity(len);
            for i in 1..=len {
                let item: LuaValue = t.get(i).unwrap_or(LuaValue::Nil);
                // A nil element terminates the array, as in redis.
                if item == LuaValue::Nil {
                    break;
                }
                items.push(lua_to_script_value(&item, depth + 1)?);
            }
            ScriptValue::Array(items)
        }
        _ => ScriptValue::Nil,
    })
}

/// Result tree -> Lua, the inverse mapping: nil -> false, status -> `{ok}`,
/// error -> `{err}`, bulk -> string, array -> table.
fn script_value_to_lua(lua: &Lua, value: &ScriptValue) -> LuaResult<LuaValue> {
    Ok(match value {
        ScriptValue::Nil => LuaValue::Boolean(false),
        ScriptValue::Int(n) => LuaValue::Integer(*n),
        ScriptValue::Double(d) => LuaValue::Number(*d),
        ScriptValue::Bulk(data) => LuaValue::String(lua.create_string(data)?),
        ScriptValue::Status(s) => {
            let t = lua.create_table()?;
            t.set("ok", lua.create_string(s.as_bytes())?)?;
            LuaValue::Table(t)
        }
        ScriptValue::Error(s) => {
            let t = lua.create_table()?;
            t.set("err", lua.create_string(s.as_bytes())?)?;
            LuaValue::Table(t)
        }
        ScriptValue::Array(items) => {
            let t = lua.create_table()?;
            for (i, item) in items.iter().enumerate() {
                t.set(i + 1, script_value_to_lua(lua, item)?)?;
            }
            LuaValue::Table(t)
        }
    })
}

/// `redis.call` argument list -> argv bytes. Only strings and numbers are
/// accepted, matching the redis restriction.
fn lua_args_to_argv(args: &LuaMultiValue) -> LuaResult<Vec<Vec<u8>>> {
    let mut argv = Vec::with_capacity(args.len());
    for value in args {
        match value {
            LuaValue::String(s) => argv.push(s.as_bytes().to_vec()),
            LuaValue::Integer(n) => argv.push(n.to_string().into_bytes()),
            LuaValue::Number(n) => argv.push(format!("{n}").into_bytes()),
            _ => {
                return Err(LuaError::RuntimeError(
                    "Lua redis() command arguments must be strings or integers".to_string(),
                ));
            }
        }
    }
    Ok(argv)
}
