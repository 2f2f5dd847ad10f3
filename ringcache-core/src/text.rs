//! The ASCII text codec: request line/payload assembly, and a
//! byte-stream parser that classifies replies according to the shape tag
//! of the request currently at the head of a node's FIFO.
//!
//! Pending value bytes are always consumed before the buffer is scanned
//! for the next `\r\n`, so a payload that happens to contain a CRLF is
//! never mis-parsed as a line boundary.

use crate::binary;
use crate::error::Error;
use std::collections::HashMap;
use std::convert::TryFrom;

/// Which dialect of the ElastiCache config-endpoint block a `Config`
/// request expects back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigDialect {
    /// `CONFIG cluster <flags> <bytes>\r\n<payload>\r\nEND\r\n`
    Modern,
    /// `VALUE AmazonElastiCache:cluster <flags> <bytes>\r\n<payload>\r\nEND\r\n`
    Legacy,
}

/// The shape of reply a request expects, attached to each queued request
/// so the parser knows how to interpret the next bytes off the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseShape {
    SingleLine,
    Multiline,
    Stats,
    Config(ConfigDialect),
    /// A single binary frame: 24-byte header, then a body whose length the
    /// header itself declares. Never mixed with the line-based shapes
    /// above on the same connection.
    Binary,
}

/// A parsed `SingleLine` reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineReply {
    Stored,
    Deleted,
    Ok,
    Touched,
    Exists,
    NotFound,
    NotStored,
    Int(i64),
    Raw(String),
}

/// One `VALUE` block out of a multiline response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueEntry {
    pub key: Vec<u8>,
    pub flags: u32,
    pub cas: Option<u64>,
    pub data: Vec<u8>,
}

/// The full result of a multiline (`get`/`gets`) response: the values
/// found, plus (when the caller supplied a requested-key list) the keys
/// that were *not* found, so the cluster can emit `miss` events for them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MultilineReply {
    pub values: Vec<ValueEntry>,
    pub missing_keys: Vec<Vec<u8>>,
}

/// A fully classified reply, ready to be handed back to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Line(LineReply),
    Values(MultilineReply),
    Stats(HashMap<String, String>),
    Config(Vec<u8>),
    Binary(binary::Packet),
}

enum PayloadKind {
    Value { key: Vec<u8>, flags: u32, cas: Option<u64> },
    Config,
}

enum Mode {
    Line,
    Payload { remaining: usize, kind: PayloadKind },
    BinaryHeader,
    BinaryBody { header: binary::Header },
}

/// Per-request incremental parser. One instance is created per queued
/// request (see `Node`'s FIFO) and fed bytes as they arrive; it is not
/// reused across requests because a fresh shape/dialect may differ.
pub struct ReplyParser {
    shape: ResponseShape,
    requested_keys: Option<Vec<Vec<u8>>>,
    mode: Mode,
    values: Vec<ValueEntry>,
    stats: HashMap<String, String>,
    config_payload: Vec<u8>,
}

impl ReplyParser {
    pub fn new(shape: ResponseShape, requested_keys: Option<Vec<Vec<u8>>>) -> Self {
        let mode = match shape {
            ResponseShape::Binary => Mode::BinaryHeader,
            _ => Mode::Line,
        };
        ReplyParser {
            shape,
            requested_keys,
            mode,
            values: Vec::new(),
            stats: HashMap::new(),
            config_payload: Vec::new(),
        }
    }

    /// Try to make progress parsing `buf`, removing consumed bytes from
    /// its front. Returns `Ok(Some(reply))` once the whole reply for this
    /// request's shape has arrived, `Ok(None)` if more bytes are needed,
    /// or `Err` on a protocol error line or malformed frame.
    pub fn feed(&mut self, buf: &mut Vec<u8>) -> Result<Option<Reply>, Error> {
        loop {
            match &self.mode {
                Mode::BinaryHeader => {
                    if buf.len() < binary::HEADER_LEN {
                        return Ok(None);
                    }
                    let header_bytes: Vec<u8> = buf.drain(..binary::HEADER_LEN).collect();
                    let header = binary::Header::try_from(&header_bytes[..])?;
                    self.mode = Mode::BinaryBody { header };
                }
                Mode::BinaryBody { header } => {
                    let header = *header;
                    let body_len = header.body_len as usize;
                    if buf.len() < body_len {
                        return Ok(None);
                    }
                    let body: Vec<u8> = buf.drain(..body_len).collect();
                    let packet = binary::Packet::from_response_body(header, &body)?;
                    return Ok(Some(Reply::Binary(packet)));
                }
                Mode::Payload { remaining, .. } => {
                    let need = remaining + 2; // payload + trailing CRLF
                    if buf.len() < need {
                        return Ok(None);
                    }
                    let remaining = *remaining;
                    let data: Vec<u8> = buf.drain(..remaining).collect();
                    let crlf: Vec<u8> = buf.drain(..2).collect();
                    if crlf != b"\r\n" {
                        return Err(Error::Protocol(
                            "missing CRLF terminator after value payload".into(),
                        ));
                    }
                    let kind = match std::mem::replace(&mut self.mode, Mode::Line) {
                        Mode::Payload { kind, .. } => kind,
                        Mode::Line => unreachable!(),
                    };
                    match kind {
                        PayloadKind::Value { key, flags, cas } => {
                            self.values.push(ValueEntry { key, flags, cas, data });
                        }
                        PayloadKind::Config => {
                            self.config_payload = data;
                        }
                    }
                }
                Mode::Line => {
                    let line = match take_line(buf) {
                        Some(line) => line,
                        None => return Ok(None),
                    };
                    if let Some(out) = self.handle_line(&line)? {
                        return Ok(Some(out));
                    }
                }
            }
        }
    }

    fn handle_line(&mut self, line: &[u8]) -> Result<Option<Reply>, Error> {
        if is_error_line(line) {
            return Err(Error::Protocol(String::from_utf8_lossy(line).into_owned()));
        }

        match self.shape {
            ResponseShape::SingleLine => Ok(Some(Reply::Line(classify_line(line)))),
            ResponseShape::Multiline => self.handle_multiline_line(line),
            ResponseShape::Stats => self.handle_stats_line(line),
            ResponseShape::Config(_) => self.handle_config_line(line),
            ResponseShape::Binary => unreachable!("binary replies are framed, not line-based"),
        }
    }

    fn handle_multiline_line(&mut self, line: &[u8]) -> Result<Option<Reply>, Error> {
        if line == b"END" {
            let found: std::collections::HashSet<Vec<u8>> =
                self.values.iter().map(|v| v.key.clone()).collect();
            let missing_keys = match &self.requested_keys {
                Some(keys) => keys
                    .iter()
                    .filter(|k| !found.contains(*k))
                    .cloned()
                    .collect(),
                None => Vec::new(),
            };
            return Ok(Some(Reply::Values(MultilineReply {
                values: std::mem::take(&mut self.values),
                missing_keys,
            })));
        }

        let header = parse_value_header(line)?;
        self.mode = Mode::Payload {
            remaining: header.bytes,
            kind: PayloadKind::Value {
                key: header.key,
                flags: header.flags,
                cas: header.cas,
            },
        };
        Ok(None)
    }

    fn handle_stats_line(&mut self, line: &[u8]) -> Result<Option<Reply>, Error> {
        if line == b"END" {
            return Ok(Some(Reply::Stats(std::mem::take(&mut self.stats))));
        }
        if let Some(rest) = line.strip_prefix(b"STAT ") {
            let text = String::from_utf8_lossy(rest);
            if let Some((name, value)) = text.split_once(' ') {
                self.stats.insert(name.to_string(), value.to_string());
            }
        }
        Ok(None)
    }

    fn handle_config_line(&mut self, line: &[u8]) -> Result<Option<Reply>, Error> {
        if line == b"END" {
            return Ok(Some(Reply::Config(std::mem::take(&mut self.config_payload))));
        }
        let text = String::from_utf8_lossy(line);
        let parts: Vec<&str> = text.split_whitespace().collect();
        let dialect = match self.shape {
            ResponseShape::Config(d) => d,
            _ => unreachable!(),
        };
        let expected_head: &[&str] = match dialect {
            ConfigDialect::Modern => &["CONFIG", "cluster"],
            ConfigDialect::Legacy => &["VALUE", "AmazonElastiCache:cluster"],
        };
        if parts.len() < expected_head.len() + 2 || &parts[..expected_head.len()] != expected_head {
            return Err(Error::Protocol(format!("malformed config header line: {}", text)));
        }
        let bytes: usize = parts[parts.len() - 1]
            .parse()
            .map_err(|_| Error::Protocol(format!("malformed config byte count: {}", text)))?;
        self.mode = Mode::Payload {
            remaining: bytes,
            kind: PayloadKind::Config,
        };
        Ok(None)
    }
}

struct ValueHeader {
    key: Vec<u8>,
    flags: u32,
    bytes: usize,
    cas: Option<u64>,
}

fn parse_value_header(line: &[u8]) -> Result<ValueHeader, Error> {
    let text = String::from_utf8_lossy(line);
    let parts: Vec<&str> = text.split_whitespace().collect();
    if parts.len() < 4 || parts[0] != "VALUE" {
        return Err(Error::Protocol(format!("malformed VALUE header: {}", text)));
    }
    let flags: u32 = parts[2]
        .parse()
        .map_err(|_| Error::Protocol(format!("malformed VALUE flags: {}", text)))?;
    let bytes: usize = parts[3]
        .parse()
        .map_err(|_| Error::Protocol(format!("malformed VALUE byte count: {}", text)))?;
    let cas = match parts.get(4) {
        Some(s) => Some(
            s.parse::<u64>()
                .map_err(|_| Error::Protocol(format!("malformed VALUE cas: {}", text)))?,
        ),
        None => None,
    };
    Ok(ValueHeader {
        key: parts[1].as_bytes().to_vec(),
        flags,
        bytes,
        cas,
    })
}

fn is_error_line(line: &[u8]) -> bool {
    line.starts_with(b"ERROR") || line.starts_with(b"CLIENT_ERROR") || line.starts_with(b"SERVER_ERROR")
}

fn classify_line(line: &[u8]) -> LineReply {
    match line {
        b"STORED" => LineReply::Stored,
        b"DELETED" => LineReply::Deleted,
        b"OK" => LineReply::Ok,
        b"TOUCHED" => LineReply::Touched,
        b"EXISTS" => LineReply::Exists,
        b"NOT_FOUND" => LineReply::NotFound,
        b"NOT_STORED" => LineReply::NotStored,
        _ => match std::str::from_utf8(line) {
            Ok(s) => match s.parse::<i64>() {
                Ok(n) => LineReply::Int(n),
                Err(_) => LineReply::Raw(s.to_string()),
            },
            Err(_) => LineReply::Raw(String::from_utf8_lossy(line).into_owned()),
        },
    }
}

/// Drain one `\r\n`-terminated line (without the terminator) from the
/// front of `buf`, or return `None` if no full line is buffered yet.
fn take_line(buf: &mut Vec<u8>) -> Option<Vec<u8>> {
    let pos = buf.windows(2).position(|w| w == b"\r\n")?;
    let mut line: Vec<u8> = buf.drain(..pos + 2).collect();
    line.truncate(pos);
    Some(line)
}

/// Build a bare command line: `<parts joined by spaces>\r\n`.
pub fn command_line(parts: &[&[u8]]) -> Vec<u8> {
    let mut out = parts.join(&b' ');
    out.extend_from_slice(b"\r\n");
    out
}

/// Build a storage command (`set`/`add`/`replace`/`append`/`prepend`):
/// `<name> <key> <flags> <exptime> <bytes>\r\n<payload>\r\n`.
pub fn storage_command(name: &str, key: &[u8], flags: u32, exptime: u32, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(name.as_bytes());
    out.push(b' ');
    out.extend_from_slice(key);
    out.extend_from_slice(format!(" {} {} {}\r\n", flags, exptime, payload.len()).as_bytes());
    out.extend_from_slice(payload);
    out.extend_from_slice(b"\r\n");
    out
}

pub fn get_command(keys: &[&[u8]]) -> Vec<u8> {
    let mut parts: Vec<&[u8]> = vec![b"get"];
    parts.extend_from_slice(keys);
    command_line(&parts)
}

pub fn delete_command(key: &[u8]) -> Vec<u8> {
    command_line(&[b"delete", key])
}

pub fn incr_command(key: &[u8], delta: u64) -> Vec<u8> {
    let delta = delta.to_string();
    command_line(&[b"incr", key, delta.as_bytes()])
}

pub fn decr_command(key: &[u8], delta: u64) -> Vec<u8> {
    let delta = delta.to_string();
    command_line(&[b"decr", key, delta.as_bytes()])
}

pub fn touch_command(key: &[u8], exptime: u32) -> Vec<u8> {
    let exptime = exptime.to_string();
    command_line(&[b"touch", key, exptime.as_bytes()])
}

pub fn flush_command() -> Vec<u8> {
    command_line(&[b"flush_all"])
}

pub fn stats_command() -> Vec<u8> {
    command_line(&[b"stats"])
}

pub fn version_command() -> Vec<u8> {
    command_line(&[b"version"])
}

pub fn config_get_cluster_command(dialect: ConfigDialect) -> Vec<u8> {
    match dialect {
        ConfigDialect::Modern => command_line(&[b"config", b"get", b"cluster"]),
        ConfigDialect::Legacy => get_command(&[b"AmazonElastiCache:cluster"]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_all(parser: &mut ReplyParser, mut bytes: &[u8], chunk_sizes: &[usize]) -> Result<Option<Reply>, Error> {
        let mut buf = Vec::new();
        let mut out = None;
        for &n in chunk_sizes {
            let n = n.min(bytes.len());
            buf.extend_from_slice(&bytes[..n]);
            bytes = &bytes[n..];
            if let Some(reply) = parser.feed(&mut buf)? {
                out = Some(reply);
            }
        }
        if !bytes.is_empty() {
            buf.extend_from_slice(bytes);
            if let Some(reply) = parser.feed(&mut buf)? {
                out = Some(reply);
            }
        }
        Ok(out)
    }

    #[test]
    fn single_line_literals() {
        let mut buf = b"STORED\r\n".to_vec();
        let mut p = ReplyParser::new(ResponseShape::SingleLine, None);
        assert_eq!(p.feed(&mut buf).unwrap(), Some(Reply::Line(LineReply::Stored)));

        let mut buf = b"NOT_STORED\r\n".to_vec();
        let mut p = ReplyParser::new(ResponseShape::SingleLine, None);
        assert_eq!(p.feed(&mut buf).unwrap(), Some(Reply::Line(LineReply::NotStored)));

        let mut buf = b"42\r\n".to_vec();
        let mut p = ReplyParser::new(ResponseShape::SingleLine, None);
        assert_eq!(p.feed(&mut buf).unwrap(), Some(Reply::Line(LineReply::Int(42))));
    }

    #[test]
    fn single_line_protocol_error() {
        let mut buf = b"CLIENT_ERROR bad command line format\r\n".to_vec();
        let mut p = ReplyParser::new(ResponseShape::SingleLine, None);
        assert!(p.feed(&mut buf).is_err());
    }

    #[test]
    fn multiline_values_and_miss_tracking() {
        let requested = vec![b"a".to_vec(), b"b".to_vec(), b"missing".to_vec()];
        let mut p = ReplyParser::new(ResponseShape::Multiline, Some(requested));
        let mut buf = b"VALUE a 0 3\r\nfoo\r\nVALUE b 0 3\r\nbar\r\nEND\r\n".to_vec();
        let reply = p.feed(&mut buf).unwrap().unwrap();
        match reply {
            Reply::Values(m) => {
                assert_eq!(m.values.len(), 2);
                assert_eq!(m.values[0].key, b"a");
                assert_eq!(m.values[0].data, b"foo");
                assert_eq!(m.values[1].key, b"b");
                assert_eq!(m.values[1].data, b"bar");
                assert_eq!(m.missing_keys, vec![b"missing".to_vec()]);
            }
            _ => panic!("expected Values"),
        }
    }

    #[test]
    fn multiline_survives_arbitrary_fragmentation() {
        let whole = b"VALUE a 0 3\r\nfoo\r\nVALUE b 0 3\r\nbar\r\nEND\r\n".to_vec();
        let mut p = ReplyParser::new(ResponseShape::Multiline, None);
        // Fragment byte-by-byte, including splits inside a length header
        // and immediately after a payload's trailing CRLF.
        let chunk_sizes: Vec<usize> = std::iter::repeat(1).take(whole.len()).collect();
        let reply = feed_all(&mut p, &whole, &chunk_sizes).unwrap().unwrap();
        match reply {
            Reply::Values(m) => assert_eq!(m.values.len(), 2),
            _ => panic!("expected Values"),
        }
    }

    #[test]
    fn multiline_payload_containing_crlf_is_not_misparsed() {
        // A payload containing \r\n must not be treated as a line boundary:
        // the byte-count is authoritative.
        let mut p = ReplyParser::new(ResponseShape::Multiline, None);
        let mut buf = b"VALUE a 0 6\r\nfo\r\nbr\r\nEND\r\n".to_vec();
        let reply = p.feed(&mut buf).unwrap().unwrap();
        match reply {
            Reply::Values(m) => {
                assert_eq!(m.values.len(), 1);
                assert_eq!(m.values[0].data, b"fo\r\nbr");
            }
            _ => panic!("expected Values"),
        }
    }

    #[test]
    fn stats_block() {
        let mut p = ReplyParser::new(ResponseShape::Stats, None);
        let mut buf = b"STAT pid 123\r\nSTAT uptime 456\r\nEND\r\n".to_vec();
        let reply = p.feed(&mut buf).unwrap().unwrap();
        match reply {
            Reply::Stats(map) => {
                assert_eq!(map.get("pid"), Some(&"123".to_string()));
                assert_eq!(map.get("uptime"), Some(&"456".to_string()));
            }
            _ => panic!("expected Stats"),
        }
    }

    #[test]
    fn config_modern_and_legacy_are_distinct_shapes() {
        let mut p = ReplyParser::new(ResponseShape::Config(ConfigDialect::Modern), None);
        let mut buf = b"CONFIG cluster 0 5\r\n1\nabc\r\nEND\r\n".to_vec();
        let reply = p.feed(&mut buf).unwrap().unwrap();
        assert_eq!(reply, Reply::Config(b"1\nabc".to_vec()));

        let mut p = ReplyParser::new(ResponseShape::Config(ConfigDialect::Legacy), None);
        let mut buf = b"VALUE AmazonElastiCache:cluster 0 5\r\n1\nabc\r\nEND\r\n".to_vec();
        let reply = p.feed(&mut buf).unwrap().unwrap();
        assert_eq!(reply, Reply::Config(b"1\nabc".to_vec()));

        // Feeding the legacy shape with a modern-dialect header is rejected,
        // not silently accepted: the two shapes are never unified.
        let mut p = ReplyParser::new(ResponseShape::Config(ConfigDialect::Legacy), None);
        let mut buf = b"CONFIG cluster 0 5\r\n1\nabc\r\nEND\r\n".to_vec();
        assert!(p.feed(&mut buf).is_err());
    }

    #[test]
    fn storage_command_frames_payload_by_length() {
        let cmd = storage_command("set", b"foo", 0, 0, b"bar");
        assert_eq!(cmd, b"set foo 0 0 3\r\nbar\r\n");
    }

    #[test]
    fn binary_shape_parses_header_then_body() {
        let packet = binary::Packet {
            header: binary::Header {
                magic: binary::MAGIC_RESPONSE,
                opcode: binary::OP_GET,
                key_length: 0,
                extras_length: 4,
                data_type: 0,
                status: 0,
                body_len: 7,
                opaque: 0,
                cas: 0,
            },
            extras: vec![0, 0, 0, 0],
            key: Vec::new(),
            value: b"bar".to_vec(),
        };
        let buf = packet.to_bytes();
        let mut p = ReplyParser::new(ResponseShape::Binary, None);
        let reply = feed_all(&mut p, &buf, &[1; 64]).unwrap().unwrap();
        assert_eq!(reply, Reply::Binary(packet));
    }
}
