//! Endpoint string grammar: `host[:port]`, `[ipv6]:port`, or bare
//! `host`. A `memcache://` scheme prefix is accepted and stripped. Missing
//! or unparseable ports default to 11211; an unclosed `[` is an error.

use std::fmt::{self, Display, Formatter};

pub const DEFAULT_PORT: u16 = 11211;
const SCHEME_PREFIX: &str = "memcache://";

/// A (host, port) pair identifying one cache server.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Endpoint {
            host: host.into(),
            port,
        }
    }

    /// Parse a `host[:port]` / `[ipv6]:port` / bare-host string, stripping
    /// an optional `memcache://` scheme. Returns an error only for an
    /// unclosed `[`; any other malformed port is silently defaulted.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let raw = raw.strip_prefix(SCHEME_PREFIX).unwrap_or(raw);

        if let Some(rest) = raw.strip_prefix('[') {
            let close = rest.find(']').ok_or_else(|| format!("unclosed '[' in endpoint '{}'", raw))?;
            let host = &rest[..close];
            let tail = &rest[close + 1..];
            let port = tail
                .strip_prefix(':')
                .and_then(|p| if p.is_empty() { None } else { p.parse::<u16>().ok() })
                .unwrap_or(DEFAULT_PORT);
            return Ok(Endpoint::new(host, port));
        }

        match raw.rsplit_once(':') {
            Some((host, port_str)) => {
                let port = port_str.parse::<u16>().unwrap_or(DEFAULT_PORT);
                Ok(Endpoint::new(host, port))
            }
            None => Ok(Endpoint::new(raw, DEFAULT_PORT)),
        }
    }

    /// `host:port` identity, with IPv6 hosts bracketed. Port 0 degenerates
    /// the identity to the bare host (a local/unix-domain-style endpoint).
    pub fn id(&self) -> String {
        if self.port == 0 {
            return self.host.clone();
        }
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl Display for Endpoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id())
    }
}
