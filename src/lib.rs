//! # Kestrel
//!
//! An in-memory key-value server speaking two wire protocols — RESP2 and
//! the memcached text protocol — over one command-dispatch core. The
//! dispatcher validates commands against a metadata table, routes them
//! through a sharded transaction layer, honors MULTI/EXEC semantics, and
//! hosts Lua scripting (EVAL/EVALSHA) with re-entrant command dispatch.

pub mod command;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod mc_protocol;
pub mod metrics;
pub mod reply;
pub mod resp;
pub mod scripting;
pub mod server;
pub mod server_state;
pub mod store;
pub mod transaction;
