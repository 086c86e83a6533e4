//! Streaming RESP2 decoder.
//!
//! The decoder is incremental: feed it a `BytesMut` that accumulates socket
//! reads and call [`decode`] until it returns `None`. Inline commands (plain
//! text lines) are accepted and normalized into multi-bulk arrays, the same
//! way redis-server treats them.

use bytes::{Buf, BytesMut};

use crate::error::{KestrelError, KestrelResult};

/// One decoded RESP2 value.
#[derive(Debug, Clone, PartialEq)]
pub enum RespFrame {
    /// `+OK\r\n`
    Simple(String),
    /// `-ERR ...\r\n`
    Error(String),
    /// `:42\r\n`
    Integer(i64),
    /// `$n\r\n...\r\n`, `None` for the `$-1` null bulk
    Bulk(Option<Vec<u8>>),
    /// `*n\r\n...`, `None` for the `*-1` null array
    Array(Option<Vec<RespFrame>>),
}

impl RespFrame {
    /// Encodes the frame back into RESP bytes. Used by the CLI to send
    /// requests; server replies are produced by the reply builders instead.
    pub fn encode(&self, out: &mut Vec<u8>) {
        match self {
            RespFrame::Simple(s) => {
                out.push(b'+');
                out.extend_from_slice(s.as_bytes());
                out.extend_from_slice(b"\r\n");
            }
            RespFrame::Error(s) => {
                out.push(b'-');
                out.extend_from_slice(s.as_bytes());
                out.extend_from_slice(b"\r\n");
            }
            RespFrame::Integer(n) => {
                out.push(b':');
                out.extend_from_slice(n.to_string().as_bytes());
                out.extend_from_slice(b"\r\n");
            }
            RespFrame::Bulk(None) => out.extend_from_slice(b"$-1\r\n"),
            RespFrame::Bulk(Some(data)) => {
                out.push(b'$');
                out.extend_from_slice(data.len().to_string().as_bytes());
                out.extend_from_slice(b"\r\n");
                out.extend_from_slice(data);
                out.extend_from_slice(b"\r\n");
            }
            RespFrame::Array(None) => out.extend_from_slice(b"*-1\r\n"),
            RespFrame::Array(Some(items)) => {
                out.push(b'*');
                out.extend_from_slice(items.len().to_string().as_bytes());
                out.extend_from_slice(b"\r\n");
                for item in items {
                    item.encode(out);
                }
            }
        }
    }

    /// Returns the frame payload as bytes when it is string-like.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            RespFrame::Bulk(Some(data)) => Some(data),
            RespFrame::Simple(s) => Some(s.as_bytes()),
            _ => None,
        }
    }
}

const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;
const MAX_MULTIBULK_LEN: i64 = 1024 * 1024;
const MAX_INLINE_LEN: usize = 64 * 1024;

/// Attempts to decode one complete frame from `buf`.
///
/// Returns `Ok(None)` when more bytes are needed; the buffer is left intact
/// in that case. On success the consumed bytes are removed from `buf`.
///
/// # Errors
///
/// Returns [`KestrelError::Protocol`] with the text to report to the
/// client. The connection should be closed afterwards.
pub fn decode(buf: &mut BytesMut) -> KestrelResult<Option<RespFrame>> {
    decode_impl(buf).map_err(KestrelError::Protocol)
}

fn decode_impl(buf: &mut BytesMut) -> Result<Option<RespFrame>, String> {
    if buf.is_empty() {
        return Ok(None);
    }
    match buf[0] {
        b'+' | b'-' | b':' | b'$' | b'*' => match parse_at(buf, 0)? {
            Some((frame, consumed)) => {
                buf.advance(consumed);
                Ok(Some(frame))
            }
            None => Ok(None),
        },
        _ => decode_inline(buf),
    }
}

fn parse_at(buf: &[u8], pos: usize) -> Result<Option<(RespFrame, usize)>, String> {
    let Some(line_end) = find_crlf(buf, pos + 1) else {
        return Ok(None);
    };
    let payload = &buf[pos + 1..line_end];
    let next = line_end + 2;

    match buf[pos] {
        b'+' => Ok(Some((
            RespFrame::Simple(String::from_utf8_lossy(payload).into_owned()),
            next - pos,
        ))),
        b'-' => Ok(Some((
            RespFrame::Error(String::from_utf8_lossy(payload).into_owned()),
            next - pos,
        ))),
        b':' => {
            let n = parse_int(payload).ok_or("invalid integer")?;
            Ok(Some((RespFrame::Integer(n), next - pos)))
        }
        b'$' => {
            let len = parse_int(payload).ok_or("invalid bulk length")?;
            if len == -1 {
                return Ok(Some((RespFrame::Bulk(None), next - pos)));
            }
            if len < 0 || len > MAX_BULK_LEN {
                return Err("invalid bulk length".into());
            }
            let len = len as usize;
            if buf.len() < next + len + 2 {
                return Ok(None);
            }
            if &buf[next + len..next + len + 2] != b"\r\n" {
                return Err("expected CRLF after bulk payload".into());
            }
            let data = buf[next..next + len].to_vec();
            Ok(Some((RespFrame::Bulk(Some(data)), next + len + 2 - pos)))
        }
        b'*' => {
            let len = parse_int(payload).ok_or("invalid multibulk length")?;
            if len < 0 {
                return Ok(Some((RespFrame::Array(None), next - pos)));
            }
            if len > MAX_MULTIBULK_LEN {
                return Err("invalid multibulk length".into());
            }
            let mut items = Vec::with_capacity(len as usize);
            let mut cursor = next;
            for _ in 0..len {
                match parse_at(buf, cursor)? {
                    Some((item, consumed)) => {
                        items.push(item);
                        cursor += consumed;
                    }
                    None => return Ok(None),
                }
            }
            Ok(Some((RespFrame::Array(Some(items)), cursor - pos)))
        }
        other => Err(format!("unexpected type byte '{}'", other as char)),
    }
}

fn decode_inline(buf: &mut BytesMut) -> Result<Option<RespFrame>, String> {
    let Some(line_end) = find_crlf(buf, 0) else {
        if buf.len() > MAX_INLINE_LEN {
            return Err("too big inline request".into());
        }
        return Ok(None);
    };
    let line = String::from_utf8_lossy(&buf[..line_end]).into_owned();
    buf.advance(line_end + 2);

    let tokens = split_inline(&line)?;
    let items = tokens
        .into_iter()
        .map(|t| RespFrame::Bulk(Some(t.into_bytes())))
        .collect();
    Ok(Some(RespFrame::Array(Some(items))))
}

fn find_crlf(buf: &[u8], from: usize) -> Option<usize> {
    if buf.len() < from + 2 {
        return None;
    }
    buf[from..]
        .windows(2)
        .position(|w| w == b"\r\n")
        .map(|i| i + from)
}

fn parse_int(payload: &[u8]) -> Option<i64> {
    std::str::from_utf8(payload).ok()?.parse().ok()
}

/// Whitespace tokenizer for inline commands, honoring double-quoted strings
/// with the usual backslash escapes and raw single-quoted strings.
fn split_inline(line: &str) -> Result<Vec<String>, String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut chars = line.chars().peekable();
    let mut in_quotes = false;

    while let Some(ch) = chars.next() {
        if in_quotes {
            match ch {
                '"' => in_quotes = false,
                '\\' => {
                    let escaped = chars.next().ok_or("unbalanced quotes in request")?;
                    current.push(match escaped {
                        'n' => '\n',
                        'r' => '\r',
                        't' => '\t',
                        other => other,
                    });
                }
                other => current.push(other),
            }
            continue;
        }
        match ch {
            '"' => in_quotes = true,
            '\'' => {
                for inner in chars.by_ref() {
                    if inner == '\'' {
                        break;
                    }
                    current.push(inner);
                }
            }
            c if c.is_whitespace() => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            other => current.push(other),
        }
    }
    if in_quotes {
        return Err("unbalanced quotes in request".into());
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    Ok(tokens)
}
