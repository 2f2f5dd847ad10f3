use std::error::Error as StdError;
use std::fmt::{self, Display, Formatter};
use std::io;

/// The stable set of error kinds a cluster operation can fail with.
///
/// Names follow the policy table in the design doc: callers match on
/// `Error::kind()` rather than the `Display` text, which is free to
/// change.
#[derive(Debug)]
pub enum Error {
    /// A key failed [`crate::key::validate`] (empty, too long, or contains
    /// whitespace/NUL).
    InvalidKey(Vec<u8>),
    /// `command()` was called on a node that has not reached `Ready`.
    NotConnected,
    /// The socket closed while requests were still pending. Carries a short
    /// reason (`"remote closed"`, `"reset for reconnection"`, ...).
    ConnectionClosed(&'static str),
    /// The node's inactivity timeout fired.
    ConnectionTimeout,
    /// SASL authentication was attempted and rejected.
    AuthFailed,
    /// The server replied with `ERROR`/`CLIENT_ERROR`/`SERVER_ERROR`, a
    /// malformed frame, or a non-zero binary status.
    Protocol(String),
    /// The hash ring has no nodes to route to.
    NoNodes,
    /// Fetching or parsing the auto-discovery config endpoint failed.
    Discovery(String),
    /// `add_node` was called with an id already present in the cluster.
    DuplicateNode(String),
    /// A transport-level I/O failure not otherwise classified above.
    Io(io::Error),
}

impl Error {
    /// Whether the retry layer is allowed to retry a request that failed
    /// with this error, independent of the request's own idempotence flag.
    /// Caller-fault errors are never retried; `AuthFailed` is fatal
    /// for the node; everything transport- or protocol-shaped is retryable
    /// when the request itself is idempotent.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ConnectionClosed(_) | Error::ConnectionTimeout | Error::Protocol(_) | Error::Io(_)
        )
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidKey(key) => write!(f, "invalid key ({} bytes)", key.len()),
            Error::NotConnected => write!(f, "node is not connected"),
            Error::ConnectionClosed(reason) => write!(f, "connection closed: {}", reason),
            Error::ConnectionTimeout => write!(f, "connection timed out"),
            Error::AuthFailed => write!(f, "SASL authentication failed"),
            Error::Protocol(line) => write!(f, "protocol error: {}", line),
            Error::NoNodes => write!(f, "no nodes available to route key"),
            Error::Discovery(msg) => write!(f, "auto-discovery error: {}", msg),
            Error::DuplicateNode(id) => write!(f, "node '{}' already exists", id),
            Error::Io(err) => write!(f, "io error: {}", err),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}
