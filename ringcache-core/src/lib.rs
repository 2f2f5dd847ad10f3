//! Runtime-agnostic core for a memcache-protocol cluster client: wire
//! codecs (text and binary/SASL), a Ketama consistent-hash ring with a
//! modulo fallback, a per-node connection actor, a cluster controller,
//! and an auto-discovery poller. A concrete async-runtime crate (such as
//! `ringcache-tokio`) supplies the [`node::Transport`] implementation;
//! everything here is otherwise self-contained.

pub mod binary;
pub mod cluster;
pub mod discovery;
pub mod endpoint;
pub mod error;
pub mod event;
pub mod key;
pub mod modulo;
pub mod node;
pub mod ring;
pub mod text;
#[cfg(test)]
pub(crate) mod test_support;

pub use cluster::{Cluster, ClusterConfig, HashProvider, HashProviderKind, RetryBackoff};
pub use discovery::{AutoDiscoveryConfig, DiscoveredNode, Topology};
pub use endpoint::Endpoint;
pub use error::Error;
pub use event::Event;
pub use node::{Credentials, Node, NodeConfig, Transport};
pub use ring::Ring;
