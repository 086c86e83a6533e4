//! Reply builders: the capability surface handlers write responses through.
//!
//! Three variants sit behind the [`ReplySink`] tagged enum: a RESP writer
//! for redis-protocol clients, a text writer for memcached clients, and the
//! [`InterpreterReplier`] that captures replies for a running script instead
//! of the wire. Handlers only see the [`ReplyBuilder`] trait, so the same
//! command implementations serve every protocol.

use crate::scripting::{ObjectExplorer, ScriptResultCollector, ScriptValue};

/// One element of an MGET response; carries the memcached flags so the text
/// protocol can echo them in `VALUE` lines.
#[derive(Debug, Clone, PartialEq)]
pub struct GetResp {
    pub key: Vec<u8>,
    pub mc_flag: u32,
    pub value: Vec<u8>,
}

/// Capability set shared by every reply variant.
pub trait ReplyBuilder {
    fn send_ok(&mut self);
    /// Store acknowledgement: `+OK` on RESP, `STORED` on memcached.
    fn send_stored(&mut self);
    fn send_simple_string(&mut self, s: &str);
    fn send_bulk_string(&mut self, s: &[u8]);
    fn send_error(&mut self, s: &str);
    fn send_null(&mut self);
    fn send_null_array(&mut self);
    fn send_long(&mut self, v: i64);
    fn send_double(&mut self, v: f64);
    fn send_string_arr(&mut self, arr: &[Vec<u8>]);
    fn send_simple_str_arr(&mut self, arr: &[&str]);
    fn send_mget_response(&mut self, resp: &[Option<GetResp>]);
    /// Begin a nested array of exactly `len` elements.
    fn start_array(&mut self, len: usize);
    fn close_connection(&mut self);
    /// Whether any prior call on this builder emitted an error.
    fn get_error(&self) -> bool;
}

fn format_double(v: f64) -> String {
    if v == v.trunc() && v.is_finite() && v.abs() < 1e17 {
        format!("{}", v as i64)
    } else {
        format!("{v}")
    }
}

// ---------------------------------------------------------------------------
// RESP wire writer
// ---------------------------------------------------------------------------

/// Buffers RESP2 bytes for one reply; the connection task flushes the buffer
/// after each dispatch.
#[derive(Debug, Default)]
pub struct RespReplyBuilder {
    buf: Vec<u8>,
    has_error: bool,
    close: bool,
}

impl RespReplyBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drains the buffered bytes. The error flag is scoped to one buffered
    /// batch, so draining resets it.
    pub fn take_output(&mut self) -> Vec<u8> {
        self.has_error = false;
        std::mem::take(&mut self.buf)
    }

    pub fn should_close(&self) -> bool {
        self.close
    }
}

impl ReplyBuilder for RespReplyBuilder {
    fn send_ok(&mut self) {
        self.buf.extend_from_slice(b"+OK\r\n");
    }

    fn send_stored(&mut self) {
        self.send_ok();
    }

    fn send_simple_string(&mut self, s: &str) {
        self.buf.push(b'+');
        self.buf.extend_from_slice(s.as_bytes());
        self.buf.extend_from_slice(b"\r\n");
    }

    fn send_bulk_string(&mut self, s: &[u8]) {
        self.buf.push(b'$');
        self.buf.extend_from_slice(s.len().to_string().as_bytes());
        self.buf.extend_from_slice(b"\r\n");
        self.buf.extend_from_slice(s);
        self.buf.extend_from_slice(b"\r\n");
    }

    fn send_error(&mut self, s: &str) {
        self.has_error = true;
        self.buf.push(b'-');
        if let Some(coded) = s.strip_prefix('-') {
            self.buf.extend_from_slice(coded.as_bytes());
        } else {
            self.buf.extend_from_slice(b"ERR ");
            self.buf.extend_from_slice(s.as_bytes());
        }
        self.buf.extend_from_slice(b"\r\n");
    }

    fn send_null(&mut self) {
        self.buf.extend_from_slice(b"$-1\r\n");
    }

    fn send_null_array(&mut self) {
        self.buf.extend_from_slice(b"*-1\r\n");
    }

    fn send_long(&mut self, v: i64) {
        self.buf.push(b':');
        self.buf.extend_from_slice(v.to_string().as_bytes());
        self.buf.extend_from_slice(b"\r\n");
    }

    fn send_double(&mut self, v: f64) {
        let text = format_double(v);
        self.send_bulk_string(text.as_bytes());
    }

    fn send_string_arr(&mut self, arr: &[Vec<u8>]) {
        self.start_array(arr.len());
        for item in arr {
            self.send_bulk_string(item);
        }
    }

    fn send_simple_str_arr(&mut self, arr: &[&str]) {
        self.start_array(arr.len());
        for item in arr {
            self.send_simple_string(item);
        }
    }

    fn send_mget_response(&mut self, resp: &[Option<GetResp>]) {
        self.start_array(resp.len());
        for item in resp {
            match item {
                Some(r) => self.send_bulk_string(&r.value),
                None => self.send_null(),
            }
        }
    }

    fn start_array(&mut self, len: usize) {
        self.buf.push(b'*');
        self.buf.extend_from_slice(len.to_string().as_bytes());
        self.buf.extend_from_slice(b"\r\n");
    }

    fn close_connection(&mut self) {
        self.close = true;
    }

    fn get_error(&self) -> bool {
        self.has_error
    }
}

// ---------------------------------------------------------------------------
// Memcached text writer
// ---------------------------------------------------------------------------

/// Text-protocol writer. Only the operations the memcached adapter can
/// produce are meaningful; the rest degrade to plain lines.
#[derive(Debug, Default)]
pub struct McReplyBuilder {
    buf: Vec<u8>,
    has_error: bool,
    close: bool,
}

impl McReplyBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take_output(&mut self) -> Vec<u8> {
        self.has_error = false;
        std::mem::take(&mut self.buf)
    }

    pub fn should_close(&self) -> bool {
        self.close
    }

    pub fn send_client_error(&mut self, msg: &str) {
        self.has_error = true;
        self.buf.extend_from_slice(b"CLIENT_ERROR ");
        self.buf.extend_from_slice(msg.as_bytes());
        self.buf.extend_from_slice(b"\r\n");
    }

    /// Pre-formatted text, CRLF included by the caller (VERSION, STAT lines).
    pub fn send_direct(&mut self, text: &str) {
        self.buf.extend_from_slice(text.as_bytes());
    }

    fn line(&mut self, text: &str) {
        self.buf.extend_from_slice(text.as_bytes());
        self.buf.extend_from_slice(b"\r\n");
    }
}

impl ReplyBuilder for McReplyBuilder {
    fn send_ok(&mut self) {
        self.line("OK");
    }

    fn send_stored(&mut self) {
        self.line("STORED");
    }

    fn send_simple_string(&mut self, s: &str) {
        self.line(s);
    }

    fn send_bulk_string(&mut self, s: &[u8]) {
        self.buf.extend_from_slice(s);
        self.buf.extend_from_slice(b"\r\n");
    }

    fn send_error(&mut self, s: &str) {
        self.has_error = true;
        let text = s.strip_prefix('-').unwrap_or(s);
        self.buf.extend_from_slice(b"SERVER_ERROR ");
        self.buf.extend_from_slice(text.as_bytes());
        self.buf.extend_from_slice(b"\r\n");
    }

    fn send_null(&mut self) {
        // Conditional stores (ADD on existing, REPLACE on missing) surface
        // here after the SET NX/XX translation.
        self.line("NOT_STORED");
    }

    fn send_null_array(&mut self) {
        self.line("END");
    }

    fn send_long(&mut self, v: i64) {
        self.line(&v.to_string());
    }

    fn send_double(&mut self, v: f64) {
        self.line(&format_double(v));
    }

    fn send_string_arr(&mut self, arr: &[Vec<u8>]) {
        for item in arr {
            self.send_bulk_string(item);
        }
        self.line("END");
    }

    fn send_simple_str_arr(&mut self, arr: &[&str]) {
        for item in arr {
            self.line(item);
        }
        self.line("END");
    }

    fn send_mget_response(&mut self, resp: &[Option<GetResp>]) {
        for item in resp.iter().flatten() {
            self.buf.extend_from_slice(b"VALUE ");
            self.buf.extend_from_slice(&item.key);
            self.buf
                .extend_from_slice(format!(" {} {}\r\n", item.mc_flag, item.value.len()).as_bytes());
            self.buf.extend_from_slice(&item.value);
            self.buf.extend_from_slice(b"\r\n");
        }
        self.line("END");
    }

    fn start_array(&mut self, _len: usize) {}

    fn close_connection(&mut self) {
        self.close = true;
    }

    fn get_error(&self) -> bool {
        self.has_error
    }
}

// ---------------------------------------------------------------------------
// Script-side replier
// ---------------------------------------------------------------------------

/// Captures the reply of a command dispatched from inside a script and
/// forwards it into the script's result collector instead of the wire.
///
/// Nested array lengths are tracked as `(saved_elem_count, target_len)`
/// frames; once a frame's element count reaches its target the array-end
/// event fires and the unwind continues into the parent frame.
#[derive(Debug, Default)]
pub struct InterpreterReplier {
    explr: ScriptResultCollector,
    array_len: Vec<(usize, usize)>,
    num_elems: usize,
    has_error: bool,
}

impl InterpreterReplier {
    pub fn new() -> Self {
        Self::default()
    }

    /// The captured reply tree.
    pub fn into_value(self) -> ScriptValue {
        self.explr.into_value()
    }

    fn post_item(&mut self) {
        self.num_elems += 1;
        while let Some(&(saved, target)) = self.array_len.last() {
            if self.num_elems != target {
                break;
            }
            self.num_elems = saved;
            self.explr.on_array_end();
            self.array_len.pop();
        }
    }
}

impl ReplyBuilder for InterpreterReplier {
    fn send_ok(&mut self) {
        self.send_simple_string("OK");
    }

    fn send_stored(&mut self) {
        debug_assert!(self.array_len.is_empty());
        self.send_simple_string("OK");
    }

    fn send_simple_string(&mut self, s: &str) {
        if self.array_len.is_empty() {
            self.explr.on_status(s);
        } else {
            self.explr.on_string(s.as_bytes());
        }
        self.post_item();
    }

    fn send_bulk_string(&mut self, s: &[u8]) {
        self.explr.on_string(s);
        self.post_item();
    }

    fn send_error(&mut self, s: &str) {
        debug_assert!(self.array_len.is_empty());
        self.has_error = true;
        self.explr.on_error(s);
    }

    fn send_null(&mut self) {
        self.explr.on_nil();
        self.post_item();
    }

    fn send_null_array(&mut self) {
        self.explr.on_array_start(0);
        self.explr.on_array_end();
        self.post_item();
    }

    fn send_long(&mut self, v: i64) {
        self.explr.on_int(v);
        self.post_item();
    }

    fn send_double(&mut self, v: f64) {
        self.explr.on_double(v);
        self.post_item();
    }

    fn send_string_arr(&mut self, arr: &[Vec<u8>]) {
        self.explr.on_array_start(arr.len());
        for item in arr {
            self.explr.on_string(item);
        }
        self.explr.on_array_end();
        self.post_item();
    }

    fn send_simple_str_arr(&mut self, arr: &[&str]) {
        self.explr.on_array_start(arr.len());
        for item in arr {
            self.explr.on_string(item.as_bytes());
        }
        self.explr.on_array_end();
        self.post_item();
    }

    fn send_mget_response(&mut self, resp: &[Option<GetResp>]) {
        debug_assert!(self.array_len.is_empty());
        self.explr.on_array_start(resp.len());
        for item in resp {
            match item {
                Some(r) => self.explr.on_string(&r.value),
                None => self.explr.on_nil(),
            }
        }
        self.explr.on_array_end();
        self.post_item();
    }

    fn start_array(&mut self, len: usize) {
        self.explr.on_array_start(len);
        if len == 0 {
            self.explr.on_array_end();
            self.post_item();
        } else {
            self.array_len.push((self.num_elems + 1, len));
            self.num_elems = 0;
        }
    }

    fn close_connection(&mut self) {}

    fn get_error(&self) -> bool {
        self.has_error
    }
}

// ---------------------------------------------------------------------------
// Tagged sink
// ---------------------------------------------------------------------------

/// The reply sink installed on a connection. Swapped to the `Script` variant
/// for the duration of a nested dispatch from a script.
#[derive(Debug)]
pub enum ReplySink {
    Resp(RespReplyBuilder),
    Mc(McReplyBuilder),
    Script(InterpreterReplier),
}

impl ReplySink {
    fn inner(&mut self) -> &mut dyn ReplyBuilder {
        match self {
            ReplySink::Resp(b) => b,
            ReplySink::Mc(b) => b,
            ReplySink::Script(b) => b,
        }
    }

    fn inner_ref(&self) -> &dyn ReplyBuilder {
        match self {
            ReplySink::Resp(b) => b,
            ReplySink::Mc(b) => b,
            ReplySink::Script(b) => b,
        }
    }

    /// Drains the buffered wire bytes; empty for the script variant.
    pub fn take_output(&mut self) -> Vec<u8> {
        match self {
            ReplySink::Resp(b) => b.take_output(),
            ReplySink::Mc(b) => b.take_output(),
            ReplySink::Script(_) => Vec::new(),
        }
    }

    pub fn should_close(&self) -> bool {
        match self {
            ReplySink::Resp(b) => b.should_close(),
            ReplySink::Mc(b) => b.should_close(),
            ReplySink::Script(_) => false,
        }
    }
}

impl ReplyBuilder for ReplySink {
    fn send_ok(&mut self) {
        self.inner().send_ok();
    }
    fn send_stored(&mut self) {
        self.inner().send_stored();
    }
    fn send_simple_string(&mut self, s: &str) {
        self.inner().send_simple_string(s);
    }
    fn send_bulk_string(&mut self, s: &[u8]) {
        self.inner().send_bulk_string(s);
    }
    fn send_error(&mut self, s: &str) {
        self.inner().send_error(s);
    }
    fn send_null(&mut self) {
        self.inner().send_null();
    }
    fn send_null_array(&mut self) {
        self.inner().send_null_array();
    }
    fn send_long(&mut self, v: i64) {
        self.inner().send_long(v);
    }
    fn send_double(&mut self, v: f64) {
        self.inner().send_double(v);
    }
    fn send_string_arr(&mut self, arr: &[Vec<u8>]) {
        self.inner().send_string_arr(arr);
    }
    fn send_simple_str_arr(&mut self, arr: &[&str]) {
        self.inner().send_simple_str_arr(arr);
    }
    fn send_mget_response(&mut self, resp: &[Option<GetResp>]) {
        self.inner().send_mget_response(resp);
    }
    fn start_array(&mut self, len: usize) {
        self.inner().start_array(len);
    }
    fn close_connection(&mut self) {
        self.inner().close_connection();
    }
    fn get_error(&self) -> bool {
        self.inner_ref().get_error()
    }
}
