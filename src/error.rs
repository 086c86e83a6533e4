//! Error types and the canonical client-facing error strings.
//!
//! Command handlers report failures to the client by writing them through
//! the reply builder and returning normally. `KestrelError` carries the
//! crate's internal failure paths: RESP frame decode, memcached request
//! parse, and socket I/O in the connection loops.

#[derive(Debug, thiserror::Error)]
pub enum KestrelError {
    /// RESP frame decode failure; rendered as a `-ERR Protocol error:`
    /// reply before the connection is closed.
    #[error("ERR Protocol error: {0}")]
    Protocol(String),

    /// Pre-formatted memcached error line (`CLIENT_ERROR ...`, `ERROR`),
    /// written to the wire verbatim.
    #[error("{0}")]
    McProtocol(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type KestrelResult<T> = Result<T, KestrelError>;

/// `EVAL`/`EVALSHA` numkeys (and any other integer argument) that fails to parse.
pub const INVALID_INT: &str = "value is not an integer or out of range";

/// Unknown or uncached script hash. Carries its own error code, so the reply
/// builder writes it verbatim instead of prefixing `-ERR`.
pub const SCRIPT_NOT_FOUND: &str = "-NOSCRIPT No matching script. Please use EVAL.";

pub const AUTH_REQUIRED: &str = "-NOAUTH Authentication required.";

pub const READONLY_REPLICA: &str = "-READONLY You can't write against a read only replica.";

pub const EXEC_ABORT: &str = "-EXECABORT Transaction discarded because of previous errors";

pub const SYNTAX_ERR: &str = "syntax error";

/// Canonical arity failure text, shared by the dispatcher and handlers.
pub fn wrong_num_args(cmd: &str) -> String {
    let lowered = cmd.to_ascii_lowercase();
    format!("wrong number of arguments for '{lowered}' command")
}
