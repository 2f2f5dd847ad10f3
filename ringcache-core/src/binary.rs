//! The binary protocol codec: the 24-byte header, opcodes, and the
//! frames needed for the SASL handshake and, optionally, binary data
//! commands.

use crate::error::Error;
use std::convert::TryFrom;

pub const MAGIC_REQUEST: u8 = 0x80;
pub const MAGIC_RESPONSE: u8 = 0x81;

pub const OP_GET: u8 = 0x00;
pub const OP_SET: u8 = 0x01;
pub const OP_ADD: u8 = 0x02;
pub const OP_REPLACE: u8 = 0x03;
pub const OP_DELETE: u8 = 0x04;
pub const OP_INCR: u8 = 0x05;
pub const OP_DECR: u8 = 0x06;
pub const OP_QUIT: u8 = 0x07;
pub const OP_FLUSH: u8 = 0x08;
pub const OP_NOOP: u8 = 0x0a;
pub const OP_VERSION: u8 = 0x0b;
pub const OP_APPEND: u8 = 0x0e;
pub const OP_PREPEND: u8 = 0x0f;
pub const OP_STAT: u8 = 0x10;
pub const OP_TOUCH: u8 = 0x1c;
pub const OP_SASL_LIST_MECHS: u8 = 0x20;
pub const OP_SASL_AUTH: u8 = 0x21;
pub const OP_SASL_STEP: u8 = 0x22;

const STATUS_OK: u16 = 0x0000;
pub const STATUS_KEY_NOT_FOUND: u16 = 0x0001;
const STATUS_AUTH_ERROR: u16 = 0x0020;
const STATUS_AUTH_CONTINUE: u16 = 0x0021;

/// The 24-byte frame header, network byte order throughout.
#[derive(Debug, Default, PartialEq, Eq, Clone, Copy)]
pub struct Header {
    pub magic: u8,
    pub opcode: u8,
    pub key_length: u16,
    pub extras_length: u8,
    pub data_type: u8,
    pub status: u16,
    pub body_len: u32,
    pub opaque: u32,
    pub cas: u64,
}

pub const HEADER_LEN: usize = 24;

impl Header {
    pub fn to_bytes(self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0] = self.magic;
        out[1] = self.opcode;
        out[2..4].copy_from_slice(&self.key_length.to_be_bytes());
        out[4] = self.extras_length;
        out[5] = self.data_type;
        out[6..8].copy_from_slice(&self.status.to_be_bytes());
        out[8..12].copy_from_slice(&self.body_len.to_be_bytes());
        out[12..16].copy_from_slice(&self.opaque.to_be_bytes());
        out[16..24].copy_from_slice(&self.cas.to_be_bytes());
        out
    }
}

impl TryFrom<&[u8]> for Header {
    type Error = Error;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        if bytes.len() < HEADER_LEN {
            return Err(Error::Protocol("binary header shorter than 24 bytes".into()));
        }
        Ok(Header {
            magic: bytes[0],
            opcode: bytes[1],
            key_length: u16::from_be_bytes([bytes[2], bytes[3]]),
            extras_length: bytes[4],
            data_type: bytes[5],
            status: u16::from_be_bytes([bytes[6], bytes[7]]),
            body_len: u32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
            opaque: u32::from_be_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]),
            cas: u64::from_be_bytes([
                bytes[16], bytes[17], bytes[18], bytes[19], bytes[20], bytes[21], bytes[22],
                bytes[23],
            ]),
        })
    }
}

/// A full binary frame: header plus extras/key/value, split according to
/// the header's own length fields.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: Header,
    pub extras: Vec<u8>,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl Packet {
    pub fn request(opcode: u8, extras: Vec<u8>, key: Vec<u8>, value: Vec<u8>) -> Self {
        let body_len = (extras.len() + key.len() + value.len()) as u32;
        Packet {
            header: Header {
                magic: MAGIC_REQUEST,
                opcode,
                key_length: key.len() as u16,
                extras_length: extras.len() as u8,
                data_type: 0,
                status: 0,
                body_len,
                opaque: 0,
                cas: 0,
            },
            extras,
            key,
            value,
        }
    }

    /// Split a response body (everything after the 24-byte header) into
    /// extras/key/value per the header's length fields.
    pub fn from_response_body(header: Header, body: &[u8]) -> Result<Self, Error> {
        if body.len() != header.body_len as usize {
            return Err(Error::Protocol("binary body length mismatch".into()));
        }
        if header.magic != MAGIC_RESPONSE {
            return Err(Error::Protocol(format!("unexpected binary magic: 0x{:02x}", header.magic)));
        }
        let (extras, rest) = body.split_at(header.extras_length as usize);
        let (key, value) = rest.split_at(header.key_length as usize);
        Ok(Packet {
            header,
            extras: extras.to_vec(),
            key: key.to_vec(),
            value: value.to_vec(),
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.extras.len() + self.key.len() + self.value.len());
        out.extend_from_slice(&self.header.to_bytes());
        out.extend_from_slice(&self.extras);
        out.extend_from_slice(&self.key);
        out.extend_from_slice(&self.value);
        out
    }

    /// Succeed iff the response status is 0x0000; otherwise map the status
    /// to an `Error` carrying its canonical name.
    pub fn error_for_status(&self) -> Result<(), Error> {
        if self.header.status == STATUS_OK {
            return Ok(());
        }
        Err(Error::Protocol(status_name(self.header.status).to_string()))
    }
}

fn status_name(status: u16) -> &'static str {
    match status {
        0x0000 => "no error",
        0x0001 => "key not found",
        0x0002 => "key exists",
        0x0003 => "value too large",
        0x0004 => "invalid arguments",
        0x0005 => "item not stored",
        0x0006 => "incr/decr on non-numeric value",
        0x0007 => "vbucket belongs to another server",
        0x0008 => "authentication error",
        0x0009 => "authentication continue",
        0x0081 => "unknown command",
        0x0082 => "out of memory",
        0x0083 => "not supported",
        0x0084 => "internal error",
        0x0085 => "busy",
        0x0086 => "temporary failure",
        _ => "unknown status",
    }
}

/// Extras for SET/ADD/REPLACE: 4-byte flags + 4-byte exptime.
pub fn store_extras(flags: u32, exptime: u32) -> Vec<u8> {
    [flags.to_be_bytes(), exptime.to_be_bytes()].concat()
}

/// Extras for INCR/DECR: 8-byte delta + 8-byte initial + 4-byte exptime.
pub fn arith_extras(delta: u64, initial: u64, exptime: u32) -> Vec<u8> {
    [&delta.to_be_bytes()[..], &initial.to_be_bytes()[..], &exptime.to_be_bytes()[..]].concat()
}

/// Extras for TOUCH/FLUSH: 4-byte exptime.
pub fn exptime_extras(exptime: u32) -> Vec<u8> {
    exptime.to_be_bytes().to_vec()
}

/// Parse a big-endian 64-bit integer out of an INCR/DECR response value.
pub fn parse_u64_value(value: &[u8]) -> Result<u64, Error> {
    let bytes: [u8; 8] = value
        .try_into()
        .map_err(|_| Error::Protocol("incr/decr response value is not 8 bytes".into()))?;
    Ok(u64::from_be_bytes(bytes))
}

/// SASL `LIST_MECHS` request: no key, no value.
pub fn sasl_list_mechs_request() -> Packet {
    Packet::request(OP_SASL_LIST_MECHS, Vec::new(), Vec::new(), Vec::new())
}

/// SASL PLAIN `AUTH` request: key = "PLAIN", value = `\0user\0pass`.
pub fn sasl_plain_auth_request(username: &str, password: &str) -> Packet {
    let value = format!("\0{}\0{}", username, password).into_bytes();
    Packet::request(OP_SASL_AUTH, Vec::new(), b"PLAIN".to_vec(), value)
}

/// Interpret a SASL AUTH response: 0x0000 authenticates, 0x0020
/// fails, 0x0021 ("continue") never occurs for PLAIN and is treated as a
/// protocol error since this client never issues a SASL STEP.
pub fn sasl_auth_outcome(status: u16) -> Result<(), Error> {
    match status {
        STATUS_OK => Ok(()),
        STATUS_AUTH_ERROR => Err(Error::AuthFailed),
        STATUS_AUTH_CONTINUE => Err(Error::Protocol(
            "SASL mechanism requires multi-step negotiation, which PLAIN does not use".into(),
        )),
        other => Err(Error::Protocol(status_name(other).to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips_through_bytes() {
        let header = Header {
            magic: MAGIC_REQUEST,
            opcode: OP_GET,
            key_length: 5,
            extras_length: 0,
            data_type: 0,
            status: 0,
            body_len: 5,
            opaque: 7,
            cas: 99,
        };
        let bytes = header.to_bytes();
        let parsed = Header::try_from(&bytes[..]).unwrap();
        assert_eq!(header, parsed);
    }

    #[test]
    fn packet_splits_body_by_header_lengths() {
        let header = Header {
            magic: MAGIC_RESPONSE,
            opcode: OP_GET,
            key_length: 3,
            extras_length: 4,
            data_type: 0,
            status: 0,
            body_len: 10,
            opaque: 0,
            cas: 0,
        };
        let body = [b"flag".as_ref(), b"foo".as_ref(), b"bar".as_ref()].concat();
        assert_eq!(body.len(), 10);
        let packet = Packet::from_response_body(header, &body).unwrap();
        assert_eq!(packet.extras, b"flag");
        assert_eq!(packet.key, b"foo");
        assert_eq!(packet.value, b"bar");
    }

    #[test]
    fn sasl_auth_status_mapping() {
        assert!(sasl_auth_outcome(0x0000).is_ok());
        assert!(matches!(sasl_auth_outcome(0x0020), Err(Error::AuthFailed)));
        assert!(sasl_auth_outcome(0x0021).is_err());
    }

    #[test]
    fn incr_value_parses_big_endian_u64() {
        let bytes = 42u64.to_be_bytes();
        assert_eq!(parse_u64_value(&bytes).unwrap(), 42);
    }
}
