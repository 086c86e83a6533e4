//! Dispatcher behavior, driven through the public service API. Each test
//! builds a service, pushes commands through `dispatch_command`, and
//! asserts on the raw RESP bytes left in the connection's reply sink.

use std::sync::Arc;

use kestrel::config::Config;
use kestrel::connection::{ConnectionContext, Protocol};
use kestrel::dispatch::Service;
use kestrel::mc_protocol::{McCommand, McKind};
use kestrel::scripting::sha1_hex;
use kestrel::server_state::GlobalState;

fn service() -> Arc<Service> {
    Service::new(Config::default())
}

fn service_with(config: Config) -> Arc<Service> {
    Service::new(config)
}

fn conn(service: &Arc<Service>) -> ConnectionContext {
    service.new_conn_ctx(Protocol::Redis)
}

fn run(service: &Arc<Service>, ctx: &mut ConnectionContext, parts: &[&str]) -> String {
    let args = parts.iter().map(|p| p.as_bytes().to_vec()).collect();
    service.dispatch_command(args, ctx);
    String::from_utf8(ctx.take_output()).unwrap()
}

#[test]
fn command_lookup_is_case_insensitive() {
    let service = service();
    let mut ctx = conn(&service);
    assert_eq!(run(&service, &mut ctx, &["set", "a", "1"]), "+OK\r\n");
    assert_eq!(run(&service, &mut ctx, &["GeT", "a"]), "$1\r\n1\r\n");
    assert_eq!(run(&service, &mut ctx, &["PING"]), "+PONG\r\n");
}

#[test]
fn unknown_commands_report_the_uppercased_name() {
    let service = service();
    let mut ctx = conn(&service);
    assert_eq!(
        run(&service, &mut ctx, &["doesnotexist"]),
        "-ERR unknown command 'DOESNOTEXIST'\r\n"
    );
}

#[test]
fn arity_failures_never_reach_the_handler() {
    let service = service();
    let mut ctx = conn(&service);
    assert_eq!(
        run(&service, &mut ctx, &["GET"]),
        "-ERR wrong number of arguments for 'get' command\r\n"
    );
    assert_eq!(
        run(&service, &mut ctx, &["GET", "a", "b"]),
        "-ERR wrong number of arguments for 'get' command\r\n"
    );
    assert_eq!(
        run(&service, &mut ctx, &["SET", "only-key"]),
        "-ERR wrong number of arguments for 'set' command\r\n"
    );
    assert_eq!(service.state.metrics.get("GET"), None);
}

#[test]
fn key_value_pair_commands_require_odd_argv() {
    let service = service();
    let mut ctx = conn(&service);
    // MSET k v k2 — four slots including the name, dangling key.
    assert_eq!(
        run(&service, &mut ctx, &["MSET", "k", "v", "k2"]),
        "-ERR wrong number of arguments for 'mset' command\r\n"
    );
    assert_eq!(run(&service, &mut ctx, &["MSET", "k", "v"]), "+OK\r\n");
    assert_eq!(
        run(&service, &mut ctx, &["MGET", "k", "k2"]),
        "*2\r\n$1\r\nv\r\n$-1\r\n"
    );
}

#[test]
fn auth_gate_blocks_until_password_accepted() {
    let service = service_with(Config {
        requirepass: Some("secret".to_string()),
        ..Config::default()
    });
    let mut ctx = conn(&service);

    assert_eq!(
        run(&service, &mut ctx, &["PING"]),
        "-NOAUTH Authentication required.\r\n"
    );
    assert_eq!(
        run(&service, &mut ctx, &["AUTH", "wrong"]),
        "-ERR invalid password\r\n"
    );
    assert_eq!(
        run(&service, &mut ctx, &["GET", "x"]),
        "-NOAUTH Authentication required.\r\n"
    );
    assert_eq!(run(&service, &mut ctx, &["AUTH", "secret"]), "+OK\r\n");
    assert_eq!(run(&service, &mut ctx, &["PING"]), "+PONG\r\n");
}

#[test]
fn multi_exec_happy_path() {
    let service = service();
    let mut ctx = conn(&service);

    assert_eq!(run(&service, &mut ctx, &["MULTI"]), "+OK\r\n");
    assert_eq!(run(&service, &mut ctx, &["SET", "a", "1"]), "+QUEUED\r\n");
    assert_eq!(run(&service, &mut ctx, &["INCR", "a"]), "+QUEUED\r\n");
    // Queued commands have not executed yet.
    assert!(service.store.get(0, b"a").is_none());

    assert_eq!(run(&service, &mut ctx, &["EXEC"]), "*2\r\n+OK\r\n:2\r\n");
    assert_eq!(run(&service, &mut ctx, &["GET", "a"]), "$1\r\n2\r\n");
}

#[test]
fn queued_validation_failure_aborts_exec() {
    let service = service();
    let mut ctx = conn(&service);

    assert_eq!(run(&service, &mut ctx, &["MULTI"]), "+OK\r\n");
    assert_eq!(
        run(&service, &mut ctx, &["DOESNOTEXIST"]),
        "-ERR unknown command 'DOESNOTEXIST'\r\n"
    );
    // Later valid commands still queue, but the transaction is poisoned.
    assert_eq!(run(&service, &mut ctx, &["SET", "a", "1"]), "+QUEUED\r\n");
    assert_eq!(
        run(&service, &mut ctx, &["EXEC"]),
        "-EXECABORT Transaction discarded because of previous errors\r\n"
    );
    // Nothing ran, and the state machine is back to inactive.
    assert!(service.store.get(0, b"a").is_none());
    assert_eq!(
        run(&service, &mut ctx, &["EXEC"]),
        "-ERR EXEC without MULTI\r\n"
    );
}

#[test]
fn multi_nesting_and_discard() {
    let service = service();
    let mut ctx = conn(&service);

    assert_eq!(run(&service, &mut ctx, &["MULTI"]), "+OK\r\n");
    assert_eq!(
        run(&service, &mut ctx, &["MULTI"]),
        "-ERR MULTI calls can not be nested\r\n"
    );
    assert_eq!(run(&service, &mut ctx, &["SET", "a", "1"]), "+QUEUED\r\n");
    assert_eq!(run(&service, &mut ctx, &["DISCARD"]), "+OK\r\n");
    assert!(service.store.get(0, b"a").is_none());
    assert_eq!(
        run(&service, &mut ctx, &["DISCARD"]),
        "-ERR DISCARD without MULTI\r\n"
    );
}

#[test]
fn select_and_admin_commands_rejected_at_enqueue() {
    let service = service();
    let mut ctx = conn(&service);

    assert_eq!(run(&service, &mut ctx, &["MULTI"]), "+OK\r\n");
    assert_eq!(
        run(&service, &mut ctx, &["SELECT", "1"]),
        "-ERR Can not call SELECT within a transaction\r\n"
    );
    assert_eq!(
        run(&service, &mut ctx, &["SHUTDOWN"]),
        "-ERR Can not run admin commands under transactions\r\n"
    );
    assert_eq!(
        run(&service, &mut ctx, &["EXEC"]),
        "-EXECABORT Transaction discarded because of previous errors\r\n"
    );
    // The rejected SHUTDOWN never executed.
    assert_eq!(service.state.global_state(), GlobalState::Active);
}

#[test]
fn empty_transaction_returns_empty_array() {
    let service = service();
    let mut ctx = conn(&service);
    assert_eq!(run(&service, &mut ctx, &["MULTI"]), "+OK\r\n");
    assert_eq!(run(&service, &mut ctx, &["EXEC"]), "*0\r\n");
}

#[test]
fn replica_refuses_writes_and_serves_reads() {
    let service = service();
    service.state.set_master(false);
    let mut ctx = conn(&service);

    assert_eq!(
        run(&service, &mut ctx, &["SET", "a", "1"]),
        "-READONLY You can't write against a read only replica.\r\n"
    );
    assert!(service.store.get(0, b"a").is_none());
    assert_eq!(run(&service, &mut ctx, &["GET", "a"]), "$-1\r\n");
    assert_eq!(run(&service, &mut ctx, &["PING"]), "+PONG\r\n");
}

#[test]
fn loading_state_refuses_most_commands() {
    let service = service();
    service.state.set_global_state(GlobalState::Loading);
    let mut ctx = conn(&service);

    assert_eq!(
        run(&service, &mut ctx, &["SET", "a", "1"]),
        "-ERR Can not execute during LOADING\r\n"
    );
    // LOADING-flagged commands still pass.
    assert_eq!(run(&service, &mut ctx, &["MULTI"]), "+OK\r\n");
    assert_eq!(run(&service, &mut ctx, &["DISCARD"]), "+OK\r\n");

    service.state.set_global_state(GlobalState::Active);
    assert_eq!(run(&service, &mut ctx, &["SET", "a", "1"]), "+OK\r\n");
}

#[test]
fn select_switches_databases() {
    let service = service();
    let mut ctx = conn(&service);

    assert_eq!(run(&service, &mut ctx, &["SET", "k", "zero"]), "+OK\r\n");
    assert_eq!(run(&service, &mut ctx, &["SELECT", "1"]), "+OK\r\n");
    assert_eq!(run(&service, &mut ctx, &["GET", "k"]), "$-1\r\n");
    assert_eq!(run(&service, &mut ctx, &["SELECT", "0"]), "+OK\r\n");
    assert_eq!(run(&service, &mut ctx, &["GET", "k"]), "$4\r\nzero\r\n");
    assert_eq!(
        run(&service, &mut ctx, &["SELECT", "99"]),
        "-ERR DB index is out of range\r\n"
    );
}

#[test]
fn quit_closes_the_connection() {
    let service = service();
    let mut ctx = conn(&service);
    assert_eq!(run(&service, &mut ctx, &["QUIT"]), "+OK\r\n");
    assert!(ctx.should_close());
}

#[test]
fn metrics_count_dispatched_commands() {
    let service = service();
    let mut ctx = conn(&service);
    run(&service, &mut ctx, &["SET", "a", "1"]);
    run(&service, &mut ctx, &["GET", "a"]);
    run(&service, &mut ctx, &["GET", "a"]);
    assert_eq!(service.state.metrics.get("SET").unwrap().requests, 1);
    assert_eq!(service.state.metrics.get("GET").unwrap().requests, 2);
}

// -- scripting --------------------------------------------------------------

#[test]
fn eval_returns_scalars_and_keys() {
    let service = service();
    let mut ctx = conn(&service);

    assert_eq!(run(&service, &mut ctx, &["EVAL", "return 1", "0"]), ":1\r\n");
    assert_eq!(
        run(&service, &mut ctx, &["EVAL", "return KEYS[1]", "1", "x"]),
        "$1\r\nx\r\n"
    );
    assert_eq!(
        run(&service, &mut ctx, &["EVAL", "return ARGV[1]", "0", "hello"]),
        "$5\r\nhello\r\n"
    );
}

#[test]
fn eval_serializes_nested_arrays() {
    let service = service();
    let mut ctx = conn(&service);
    assert_eq!(
        run(&service, &mut ctx, &["EVAL", "return {1, 2, 3}", "0"]),
        "*3\r\n:1\r\n:2\r\n:3\r\n"
    );
    assert_eq!(
        run(&service, &mut ctx, &["EVAL", "return {1, {2, 'x'}}", "0"]),
        "*2\r\n:1\r\n*2\r\n:2\r\n$1\r\nx\r\n"
    );
}

#[test]
fn eval_empty_body_is_null() {
    let service = service();
    let mut ctx = conn(&service);
    assert_eq!(run(&service, &mut ctx, &["EVAL", "   ", "0"]), "$-1\r\n");
}

#[test]
fn eval_validator_rejects_bad_numkeys() {
    let service = service();
    let mut ctx = conn(&service);
    assert_eq!(
        run(&service, &mut ctx, &["EVAL", "return 1", "abc"]),
        "-ERR value is not an integer or out of range\r\n"
    );
    assert_eq!(
        run(&service, &mut ctx, &["EVAL", "return 1", "-1"]),
        "-ERR value is not an integer or out of range\r\n"
    );
    assert_eq!(
        run(&service, &mut ctx, &["EVAL", "return 1", "5"]),
        "-ERR Number of keys can't be greater than number of args\r\n"
    );
}

#[test]
fn eval_compile_error_reports_text() {
    let service = service();
    let mut ctx = conn(&service);
    let reply = run(&service, &mut ctx, &["EVAL", "this is not lua", "0"]);
    assert!(reply.starts_with("-ERR Error compiling script"));
}

#[test]
fn script_calls_mutate_through_the_dispatcher() {
    let service = service();
    let mut ctx = conn(&service);

    let body = "redis.call('SET', KEYS[1], 'v'); return redis.call('GET', KEYS[1])";
    // The nested SET's +OK lands in the script, never on the wire.
    assert_eq!(
        run(&service, &mut ctx, &["EVAL", body, "1", "k"]),
        "$1\r\nv\r\n"
    );
    assert_eq!(run(&service, &mut ctx, &["GET", "k"]), "$1\r\nv\r\n");
}

#[test]
fn script_status_replies_convert_to_simple_strings() {
    let service = service();
    let mut ctx = conn(&service);
    run(&service, &mut ctx, &["SET", "k", "v"]);
    assert_eq!(
        run(
            &service,
            &mut ctx,
            &["EVAL", "return redis.call('SET', KEYS[1], 'w')", "1", "k"]
        ),
        "+OK\r\n"
    );
}

#[test]
fn undeclared_key_access_fails_the_script() {
    let service = service();
    let mut ctx = conn(&service);
    let reply = run(
        &service,
        &mut ctx,
        &["EVAL", "return redis.call('GET', 'y')", "1", "x"],
    );
    assert!(reply.starts_with("-ERR Error running script (call to "));
    assert!(reply.contains("script tried accessing undeclared key"));
    // The connection is healthy afterwards.
    assert_eq!(run(&service, &mut ctx, &["PING"]), "+PONG\r\n");
}

#[test]
fn script_key_locks_are_released_after_eval() {
    let service = service();
    let mut ctx = conn(&service);
    run(&service, &mut ctx, &["EVAL", "return redis.call('GET', KEYS[1])", "1", "x"]);
    assert!(!service.is_locked(0, b"x"));
    assert!(!service.is_shard_set_locked());
}

#[test]
fn evalsha_round_trips_across_connections() {
    let service = service();
    let mut ctx = conn(&service);

    assert_eq!(run(&service, &mut ctx, &["EVAL", "return 42", "0"]), ":42\r\n");
    let sha = sha1_hex("return 42");
    assert_eq!(run(&service, &mut ctx, &["EVALSHA", &sha, "0"]), ":42\r\n");

    // A different connection reaches the same cached script, including via
    // an uppercase digest.
    let mut other = conn(&service);
    assert_eq!(run(&service, &mut other, &["EVALSHA", &sha, "0"]), ":42\r\n");
    let upper = sha.to_uppercase();
    assert_eq!(run(&service, &mut other, &["EVALSHA", &upper, "0"]), ":42\r\n");
}

#[test]
fn evalsha_rejects_malformed_digests() {
    let service = service();
    let mut ctx = conn(&service);

    let reply = run(&service, &mut ctx, &["EVALSHA", "abc", "0"]);
    assert!(reply.starts_with("-NOSCRIPT"));

    let not_hex = "z".repeat(40);
    let reply = run(&service, &mut ctx, &["EVALSHA", &not_hex, "0"]);
    assert!(reply.starts_with("-NOSCRIPT"));

    let unknown = "a".repeat(40);
    let reply = run(&service, &mut ctx, &["EVALSHA", &unknown, "0"]);
    assert!(reply.starts_with("-NOSCRIPT"));
}

#[test]
fn eval_is_rejected_inside_scripts() {
    let service = service();
    let mut ctx = conn(&service);
    let reply = run(
        &service,
        &mut ctx,
        &["EVAL", "return redis.call('EVAL', 'return 1', '0')", "0"],
    );
    assert!(reply.contains("not allowed from script"));
}

#[test]
fn script_load_exists_flush() {
    let service = service();
    let mut ctx = conn(&service);

    let sha = sha1_hex("return 7");
    let reply = run(&service, &mut ctx, &["SCRIPT", "LOAD", "return 7"]);
    assert_eq!(reply, format!("$40\r\n{sha}\r\n"));

    assert_eq!(
        run(&service, &mut ctx, &["SCRIPT", "EXISTS", &sha, "ffffffff"]),
        "*2\r\n:1\r\n:0\r\n"
    );
    assert_eq!(run(&service, &mut ctx, &["SCRIPT", "FLUSH"]), "+OK\r\n");
    assert_eq!(
        run(&service, &mut ctx, &["SCRIPT", "EXISTS", &sha]),
        "*1\r\n:0\r\n"
    );
}

#[test]
fn scripts_under_multi_queue_like_any_command() {
    let service = service();
    let mut ctx = conn(&service);
    assert_eq!(run(&service, &mut ctx, &["MULTI"]), "+OK\r\n");
    assert_eq!(
        run(&service, &mut ctx, &["EVAL", "return 5", "0"]),
        "+QUEUED\r\n"
    );
    assert_eq!(run(&service, &mut ctx, &["EXEC"]), "*1\r\n:5\r\n");
}

// -- memcached adapter ------------------------------------------------------

fn mc_conn(service: &Arc<Service>) -> ConnectionContext {
    service.new_conn_ctx(Protocol::Memcache)
}

fn store_cmd(kind: McKind, key: &str, flags: u32, expire: u32) -> McCommand {
    McCommand {
        kind,
        key: key.as_bytes().to_vec(),
        keys_ext: Vec::new(),
        flags,
        expire_ts: expire,
        delta: 0,
        noreply: false,
    }
}

fn get_cmd(keys: &[&str]) -> McCommand {
    McCommand {
        kind: McKind::Get,
        key: Vec::new(),
        keys_ext: keys.iter().map(|k| k.as_bytes().to_vec()).collect(),
        flags: 0,
        expire_ts: 0,
        delta: 0,
        noreply: false,
    }
}

fn run_mc(
    service: &Arc<Service>,
    ctx: &mut ConnectionContext,
    cmd: &McCommand,
    value: &[u8],
) -> String {
    service.dispatch_mc(cmd, value, ctx);
    String::from_utf8(ctx.take_output()).unwrap()
}

#[test]
fn mc_set_then_get_echoes_flags() {
    let service = service();
    let mut ctx = mc_conn(&service);

    let reply = run_mc(&service, &mut ctx, &store_cmd(McKind::Set, "foo", 7, 0), b"bar");
    assert_eq!(reply, "STORED\r\n");
    // The flag is stashed only for the duration of the dispatch.
    assert_eq!(ctx.conn_state.memcache_flag, 0);

    let reply = run_mc(&service, &mut ctx, &get_cmd(&["foo", "missing"]), b"");
    assert_eq!(reply, "VALUE foo 7 3\r\nbar\r\nEND\r\n");
}

#[test]
fn mc_add_and_replace_translate_to_conditional_sets() {
    let service = service();
    let mut ctx = mc_conn(&service);

    assert_eq!(
        run_mc(&service, &mut ctx, &store_cmd(McKind::Replace, "k", 0, 0), b"v"),
        "NOT_STORED\r\n"
    );
    assert_eq!(
        run_mc(&service, &mut ctx, &store_cmd(McKind::Add, "k", 0, 0), b"v"),
        "STORED\r\n"
    );
    assert_eq!(
        run_mc(&service, &mut ctx, &store_cmd(McKind::Add, "k", 0, 0), b"w"),
        "NOT_STORED\r\n"
    );
    assert_eq!(
        run_mc(&service, &mut ctx, &store_cmd(McKind::Replace, "k", 0, 0), b"w"),
        "STORED\r\n"
    );
    assert_eq!(service.store.get(0, b"k").unwrap().value, b"w");
}

#[test]
fn mc_set_with_exptime_becomes_a_ttl() {
    let service = service();
    let mut ctx = mc_conn(&service);
    run_mc(&service, &mut ctx, &store_cmd(McKind::Set, "t", 0, 100), b"v");
    let entry = service.store.get(0, b"t").unwrap();
    assert!(entry.expires_at.is_some());
}

#[test]
fn mc_incr_decr_and_delete() {
    let service = service();
    let mut ctx = mc_conn(&service);
    run_mc(&service, &mut ctx, &store_cmd(McKind::Set, "n", 0, 0), b"10");

    let incr = McCommand {
        delta: 5,
        ..store_cmd(McKind::Incr, "n", 0, 0)
    };
    assert_eq!(run_mc(&service, &mut ctx, &incr, b""), "15\r\n");

    let decr = McCommand {
        delta: 3,
        ..store_cmd(McKind::Decr, "n", 0, 0)
    };
    assert_eq!(run_mc(&service, &mut ctx, &decr, b""), "12\r\n");

    let delete = store_cmd(McKind::Delete, "n", 0, 0);
    assert_eq!(run_mc(&service, &mut ctx, &delete, b""), "1\r\n");
    assert_eq!(run_mc(&service, &mut ctx, &delete, b""), "0\r\n");
}

#[test]
fn mc_append_and_prepend() {
    let service = service();
    let mut ctx = mc_conn(&service);
    run_mc(&service, &mut ctx, &store_cmd(McKind::Set, "s", 0, 0), b"mid");
    run_mc(&service, &mut ctx, &store_cmd(McKind::Append, "s", 0, 0), b"-end");
    run_mc(&service, &mut ctx, &store_cmd(McKind::Prepend, "s", 0, 0), b"start-");
    assert_eq!(service.store.get(0, b"s").unwrap().value, b"start-mid-end");
}

#[test]
fn mc_version_and_unknown() {
    let service = service();
    let mut ctx = mc_conn(&service);

    let version = store_cmd(McKind::Version, "", 0, 0);
    let reply = run_mc(&service, &mut ctx, &version, b"");
    assert!(reply.starts_with("VERSION "));
    assert!(reply.ends_with("\r\n"));

    let unknown = store_cmd(McKind::Unknown, "", 0, 0);
    assert_eq!(
        run_mc(&service, &mut ctx, &unknown, b""),
        "CLIENT_ERROR bad command line format\r\n"
    );
}

#[test]
fn mc_stats_reports_counters() {
    let service = service();
    let mut ctx = mc_conn(&service);
    run_mc(&service, &mut ctx, &store_cmd(McKind::Set, "a", 0, 0), b"1");

    let stats = store_cmd(McKind::Stats, "", 0, 0);
    let reply = run_mc(&service, &mut ctx, &stats, b"");
    assert!(reply.contains("STAT version "));
    assert!(reply.contains("STAT curr_items 1"));
    assert!(reply.ends_with("END\r\n"));
}

#[test]
fn lock_queries_are_quiet_at_rest() {
    let service = service();
    assert!(!service.is_locked(0, b"anything"));
    assert!(!service.is_shard_set_locked());
}
