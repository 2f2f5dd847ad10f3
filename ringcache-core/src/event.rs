//! The observable event surface. The source's
//! Node.js-style `EventEmitter` is rendered as a `tokio::sync::broadcast`
//! channel: `Node::subscribe()`/`Cluster::subscribe()` return a
//! `Receiver<Event>` rather than registering callbacks.

use crate::discovery::Topology;

/// Broadcast channel capacity. Slow subscribers that fall behind this many
/// events will observe a `RecvError::Lagged`, per `tokio::sync::broadcast`
/// semantics; this is an explicit, documented trade-off rather than
/// unbounded buffering.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// One observable occurrence, tagged with the originating node id where
/// the source event is node-scoped.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Connect { node: String },
    Authenticated { node: String },
    Hit { node: String, key: Vec<u8>, value: Vec<u8> },
    Miss { node: String, key: Vec<u8> },
    Error { node: Option<String>, message: String },
    Timeout { node: String },
    Close { node: String },
    AutoDiscover { topology: Topology },
    AutoDiscoverUpdate { topology: Topology },
    AutoDiscoverError { message: String },
}
