//! Streaming parser for the memcached ASCII protocol.
//!
//! Storage commands (`set key flags exptime bytes [noreply]`) are followed
//! by a data block of exactly `bytes` octets plus CRLF; everything else is a
//! single line. The parser consumes nothing until a full request is
//! buffered, so partial socket reads are handled by calling it again.

use bytes::{Buf, BytesMut};

use crate::error::{KestrelError, KestrelResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum McKind {
    Set,
    Add,
    Replace,
    Append,
    Prepend,
    Delete,
    Incr,
    Decr,
    Get,
    Gets,
    Quit,
    Stats,
    Version,
    Unknown,
}

impl McKind {
    pub fn is_store(self) -> bool {
        matches!(
            self,
            McKind::Set | McKind::Add | McKind::Replace | McKind::Append | McKind::Prepend
        )
    }

    pub fn is_retrieval(self) -> bool {
        matches!(self, McKind::Get | McKind::Gets)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct McCommand {
    pub kind: McKind,
    pub key: Vec<u8>,
    /// Keys of a multi-key `get`/`gets`.
    pub keys_ext: Vec<Vec<u8>>,
    pub flags: u32,
    /// Relative expiry in seconds; 0 means no expiry.
    pub expire_ts: u32,
    pub delta: u64,
    pub noreply: bool,
}

impl McCommand {
    fn new(kind: McKind) -> Self {
        McCommand {
            kind,
            key: Vec::new(),
            keys_ext: Vec::new(),
            flags: 0,
            expire_ts: 0,
            delta: 0,
            noreply: false,
        }
    }
}

/// One parsed request: the command plus the data block for store commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct McRequest {
    pub cmd: McCommand,
    pub value: Vec<u8>,
}

const MAX_LINE_LEN: usize = 8 * 1024;

/// Attempts to parse one request. `Ok(None)` means more bytes are needed.
///
/// # Errors
///
/// Returns [`KestrelError::McProtocol`] carrying a pre-formatted error
/// line (without CRLF); the offending request is consumed so the
/// connection can continue.
pub fn parse(buf: &mut BytesMut) -> KestrelResult<Option<McRequest>> {
    let Some(line_end) = find_crlf(buf) else {
        if buf.len() > MAX_LINE_LEN {
            buf.clear();
            return Err(KestrelError::McProtocol("ERROR".to_string()));
        }
        return Ok(None);
    };

    let line = String::from_utf8_lossy(&buf[..line_end]).into_owned();
    let tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens.is_empty() {
        buf.advance(line_end + 2);
        return Err(KestrelError::McProtocol("ERROR".to_string()));
    }

    let name = tokens[0].to_ascii_lowercase();
    match name.as_str() {
        "set" | "add" | "replace" | "append" | "prepend" => {
            parse_store(&name, &tokens, buf, line_end)
        }
        "get" | "gets" => {
            let kind = if name == "get" { McKind::Get } else { McKind::Gets };
            buf.advance(line_end + 2);
            if tokens.len() < 2 {
                return Err(KestrelError::McProtocol("ERROR".to_string()));
            }
            let mut cmd = McCommand::new(kind);
            cmd.keys_ext = tokens[1..].iter().map(|t| t.as_bytes().to_vec()).collect();
            Ok(Some(McRequest {
                cmd,
                value: Vec::new(),
            }))
        }
        "delete" => {
            buf.advance(line_end + 2);
            if tokens.len() < 2 {
                return Err(KestrelError::McProtocol("ERROR".to_string()));
            }
            let mut cmd = McCommand::new(McKind::Delete);
            cmd.key = tokens[1].as_bytes().to_vec();
            cmd.noreply = tokens.last() == Some(&"noreply");
            Ok(Some(McRequest {
                cmd,
                value: Vec::new(),
            }))
        }
        "incr" | "decr" => {
            buf.advance(line_end + 2);
            if tokens.len() < 3 {
                return Err(KestrelError::McProtocol("ERROR".to_string()));
            }
            let kind = if name == "incr" { McKind::Incr } else { McKind::Decr };
            let mut cmd = McCommand::new(kind);
            cmd.key = tokens[1].as_bytes().to_vec();
            cmd.delta = tokens[2].parse().map_err(|_| {
                KestrelError::McProtocol("CLIENT_ERROR invalid numeric delta argument".to_string())
            })?;
            cmd.noreply = tokens.last() == Some(&"noreply");
            Ok(Some(McRequest {
                cmd,
                value: Vec::new(),
            }))
        }
        "quit" => {
            buf.advance(line_end + 2);
            Ok(Some(McRequest {
                cmd: McCommand::new(McKind::Quit),
                value: Vec::new(),
            }))
        }
        "version" => {
            buf.advance(line_end + 2);
            Ok(Some(McRequest {
                cmd: McCommand::new(McKind::Version),
                value: Vec::new(),
            }))
        }
        "stats" => {
            buf.advance(line_end + 2);
            let mut cmd = McCommand::new(McKind::Stats);
            if let Some(section) = tokens.get(1) {
                cmd.key = section.as_bytes().to_vec();
            }
            Ok(Some(McRequest {
                cmd,
                value: Vec::new(),
            }))
        }
        _ => {
            buf.advance(line_end + 2);
            Ok(Some(McRequest {
                cmd: McCommand::new(McKind::Unknown),
                value: Vec::new(),
            }))
        }
    }
}

fn parse_store(
    name: &str,
    tokens: &[&str],
    buf: &mut BytesMut,
    line_end: usize,
) -> KestrelResult<Option<McRequest>> {
    if tokens.len() < 5 {
        buf.advance(line_end + 2);
        return Err(KestrelError::McProtocol(
            "CLIENT_ERROR bad command line format".to_string(),
        ));
    }

    let kind = match name {
        "set" => McKind::Set,
        "add" => McKind::Add,
        "replace" => McKind::Replace,
        "append" => McKind::Append,
        _ => McKind::Prepend,
    };

    let parse_num = |token: &str| -> Result<u64, ()> { token.parse().map_err(|_| ()) };

    let key = tokens[1].as_bytes().to_vec();
    let flags = parse_num(tokens[2]);
    let exptime = parse_num(tokens[3]);
    let bytes = parse_num(tokens[4]);
    let (flags, exptime, bytes) = match (flags, exptime, bytes) {
        (Ok(f), Ok(e), Ok(b)) => (f as u32, e as u32, b as usize),
        _ => {
            buf.advance(line_end + 2);
            return Err(KestrelError::McProtocol(
                "CLIENT_ERROR bad command line format".to_string(),
            ));
        }
    };
    let noreply = tokens.get(5) == Some(&"noreply");

    let total = line_end + 2 + bytes + 2;
    if buf.len() < total {
        return Ok(None);
    }

    let data_start = line_end + 2;
    if &buf[data_start + bytes..total] != b"\r\n" {
        buf.advance(total);
        return Err(KestrelError::McProtocol(
            "CLIENT_ERROR bad data chunk".to_string(),
        ));
    }

    let value = buf[data_start..data_start + bytes].to_vec();
    buf.advance(total);

    let mut cmd = McCommand::new(kind);
    cmd.key = key;
    cmd.flags = flags;
    cmd.expire_ts = exptime;
    cmd.noreply = noreply;
    Ok(Some(McRequest { cmd, value }))
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    if buf.len() < 2 {
        return None;
    }
    buf.windows(2).position(|w| w == b"\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buf(data: &str) -> BytesMut {
        BytesMut::from(data)
    }

    #[test]
    fn parses_set_with_data_block() {
        let mut b = buf("set foo 13 0 3\r\nbar\r\n");
        let req = parse(&mut b).unwrap().unwrap();
        assert_eq!(req.cmd.kind, McKind::Set);
        assert_eq!(req.cmd.key, b"foo");
        assert_eq!(req.cmd.flags, 13);
        assert_eq!(req.cmd.expire_ts, 0);
        assert!(!req.cmd.noreply);
        assert_eq!(req.value, b"bar");
        assert!(b.is_empty());
    }

    #[test]
    fn set_noreply_flag_is_detected() {
        let mut b = buf("set foo 0 0 2 noreply\r\nhi\r\n");
        let req = parse(&mut b).unwrap().unwrap();
        assert!(req.cmd.noreply);
    }

    #[test]
    fn incomplete_data_block_waits() {
        let mut b = buf("set foo 0 0 10\r\nhal");
        assert_eq!(parse(&mut b).unwrap(), None);
        assert_eq!(&b[..], b"set foo 0 0 10\r\nhal");
    }

    #[test]
    fn bad_data_chunk_is_rejected_and_consumed() {
        let mut b = buf("set foo 0 0 3\r\nbarX*");
        let err = parse(&mut b).unwrap_err();
        assert_eq!(err.to_string(), "CLIENT_ERROR bad data chunk");
        assert!(b.is_empty());
    }

    #[test]
    fn parses_multi_key_get() {
        let mut b = buf("get a b c\r\n");
        let req = parse(&mut b).unwrap().unwrap();
        assert_eq!(req.cmd.kind, McKind::Get);
        assert_eq!(
            req.cmd.keys_ext,
            vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]
        );
    }

    #[test]
    fn parses_incr_delta() {
        let mut b = buf("incr counter 5\r\n");
        let req = parse(&mut b).unwrap().unwrap();
        assert_eq!(req.cmd.kind, McKind::Incr);
        assert_eq!(req.cmd.key, b"counter");
        assert_eq!(req.cmd.delta, 5);

        let mut b = buf("incr counter five\r\n");
        assert_eq!(
            parse(&mut b).unwrap_err().to_string(),
            "CLIENT_ERROR invalid numeric delta argument"
        );
    }

    #[test]
    fn parses_delete_and_quit_and_version() {
        let mut b = buf("delete foo noreply\r\nquit\r\nversion\r\n");
        let req = parse(&mut b).unwrap().unwrap();
        assert_eq!(req.cmd.kind, McKind::Delete);
        assert_eq!(req.cmd.key, b"foo");
        assert!(req.cmd.noreply);
        assert_eq!(parse(&mut b).unwrap().unwrap().cmd.kind, McKind::Quit);
        assert_eq!(parse(&mut b).unwrap().unwrap().cmd.kind, McKind::Version);
    }

    #[test]
    fn unknown_commands_surface_as_unknown_kind() {
        let mut b = buf("frobnicate a b\r\n");
        let req = parse(&mut b).unwrap().unwrap();
        assert_eq!(req.cmd.kind, McKind::Unknown);
    }

    #[test]
    fn malformed_store_line_is_an_error() {
        let mut b = buf("set foo 0 0\r\n");
        assert_eq!(
            parse(&mut b).unwrap_err().to_string(),
            "CLIENT_ERROR bad command line format"
        );
        assert!(b.is_empty());
    }
}
