//! The cluster controller: owns a node set and one hash provider,
//! routes keyed operations, fans broadcast operations out in parallel,
//! applies the retry/backoff policy, and reconciles topology updates from
//! auto-discovery.

use crate::binary;
use crate::discovery::{self, AutoDiscoveryConfig, DiscoveredNode, Poller, Topology};
use crate::endpoint::Endpoint;
use crate::error::Error;
use crate::event::Event;
use crate::key;
use crate::modulo::ModuloHash;
use crate::node::{CommandOpts, Credentials, Node, NodeConfig, Transport};
use crate::ring::Ring;
use crate::text::{self, ConfigDialect, LineReply, MultilineReply, Reply, ResponseShape, ValueEntry};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// Which distribution strategy routes keys to nodes.
#[derive(Debug, Clone)]
pub enum HashProvider {
    Ketama(Ring),
    Modulo(ModuloHash),
}

impl HashProvider {
    fn get_node(&self, key: &[u8]) -> Option<&str> {
        match self {
            HashProvider::Ketama(ring) => ring.get_node(key),
            HashProvider::Modulo(hash) => hash.get_node(key),
        }
    }

    fn add_node(&mut self, id: &str, weight: u32) {
        match self {
            HashProvider::Ketama(ring) => ring.add_node(id, weight),
            HashProvider::Modulo(hash) => hash.add_node(id, weight),
        }
    }

    fn remove_node(&mut self, id: &str) {
        match self {
            HashProvider::Ketama(ring) => ring.remove_node(id),
            HashProvider::Modulo(hash) => hash.remove_node(id),
        }
    }
}

/// Constant or exponential retry delay.
#[derive(Clone)]
pub enum RetryBackoff {
    Constant,
    Exponential { factor: u32 },
}

impl RetryBackoff {
    fn delay_for(&self, attempt: u32, base_delay: Duration) -> Duration {
        match self {
            RetryBackoff::Constant => base_delay,
            RetryBackoff::Exponential { factor } => base_delay * factor.saturating_pow(attempt),
        }
    }
}

/// Cluster-wide configuration.
#[derive(Clone)]
pub struct ClusterConfig {
    pub hash_provider: HashProviderKind,
    pub node_config: NodeConfig,
    pub retries: u32,
    pub retry_delay: Duration,
    pub retry_backoff: RetryBackoff,
    pub retry_only_idempotent: bool,
    pub auto_discovery: AutoDiscoveryConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashProviderKind {
    Ketama,
    Modulo,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        ClusterConfig {
            hash_provider: HashProviderKind::Ketama,
            node_config: NodeConfig::default(),
            retries: 0,
            retry_delay: Duration::from_millis(100),
            retry_backoff: RetryBackoff::Constant,
            retry_only_idempotent: true,
            auto_discovery: AutoDiscoveryConfig::default(),
        }
    }
}

struct Inner<T: Transport> {
    nodes: HashMap<String, Node<T>>,
    hash: HashProvider,
    topology_version: Option<u64>,
}

/// The user-facing cluster object. Cloning shares the same node set and
/// background discovery task.
pub struct Cluster<T: Transport> {
    inner: Arc<Mutex<Inner<T>>>,
    config: ClusterConfig,
    events: broadcast::Sender<Event>,
    discovery_handle: Arc<Mutex<Option<tokio::task::JoinHandle<()>>>>,
}

impl<T: Transport> Clone for Cluster<T> {
    fn clone(&self) -> Self {
        Cluster {
            inner: self.inner.clone(),
            config: self.config.clone(),
            events: self.events.clone(),
            discovery_handle: self.discovery_handle.clone(),
        }
    }
}

impl<T: Transport> Cluster<T> {
    /// Build a cluster from a list of initial endpoint strings.
    pub fn new(initial_nodes: &[&str], config: ClusterConfig) -> Result<Self, Error> {
        let mut nodes = HashMap::new();
        let mut topology: Vec<(String, u32)> = Vec::new();
        for raw in initial_nodes {
            let endpoint = Endpoint::parse(raw).map_err(Error::Discovery)?;
            let id = endpoint.id();
            let node = Node::spawn(id.clone(), endpoint, config.node_config.clone());
            topology.push((id.clone(), config.node_config.weight));
            nodes.insert(id, node);
        }

        let hash = match config.hash_provider {
            HashProviderKind::Ketama => HashProvider::Ketama(Ring::from_nodes(
                50,
                topology.iter().map(|(id, w)| (id.as_str(), *w)),
            )),
            HashProviderKind::Modulo => HashProvider::Modulo(ModuloHash::from_nodes(
                topology.iter().map(|(id, w)| (id.as_str(), *w)),
            )),
        };

        let (events, _) = broadcast::channel(crate::event::EVENT_CHANNEL_CAPACITY);

        Ok(Cluster {
            inner: Arc::new(Mutex::new(Inner { nodes, hash, topology_version: None })),
            config,
            events,
            discovery_handle: Arc::new(Mutex::new(None)),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    fn emit(&self, event: Event) {
        let _ = self.events.send(event);
    }

    /// Connect every node in parallel and start auto-discovery if
    /// configured.
    pub async fn connect(&self) -> Result<(), Error> {
        let nodes: Vec<Node<T>> = {
            let inner = self.inner.lock().unwrap();
            inner.nodes.values().cloned().collect()
        };
        let results = futures::future::join_all(nodes.iter().map(|n| n.connect())).await;
        for result in results {
            result?;
        }

        if self.config.auto_discovery.enabled {
            self.start_auto_discovery();
        }
        Ok(())
    }

    /// Stop discovery and disconnect every node.
    pub async fn disconnect(&self) {
        if let Some(handle) = self.discovery_handle.lock().unwrap().take() {
            handle.abort();
        }
        let nodes: Vec<Node<T>> = {
            let inner = self.inner.lock().unwrap();
            inner.nodes.values().cloned().collect()
        };
        futures::future::join_all(nodes.iter().map(|n| n.disconnect())).await;
    }

    /// The graceful form: best-effort `quit` on every node, then stop
    /// discovery.
    pub async fn quit(&self) {
        if let Some(handle) = self.discovery_handle.lock().unwrap().take() {
            handle.abort();
        }
        let nodes: Vec<Node<T>> = {
            let inner = self.inner.lock().unwrap();
            inner.nodes.values().cloned().collect()
        };
        futures::future::join_all(nodes.iter().map(|n| n.quit())).await;
    }

    // -- Node management ---------------------------------------------------

    pub fn add_node(&self, raw_endpoint: &str, weight: u32) -> Result<(), Error> {
        let endpoint = Endpoint::parse(raw_endpoint).map_err(Error::Discovery)?;
        let id = endpoint.id();
        let mut inner = self.inner.lock().unwrap();
        if inner.nodes.contains_key(&id) {
            return Err(Error::DuplicateNode(id));
        }
        let mut node_config = self.config.node_config.clone();
        node_config.weight = weight;
        let node = Node::spawn(id.clone(), endpoint, node_config);
        inner.hash.add_node(&id, weight);
        inner.nodes.insert(id, node);
        Ok(())
    }

    pub fn remove_node(&self, id: &str) -> Option<Node<T>> {
        let mut inner = self.inner.lock().unwrap();
        inner.hash.remove_node(id);
        inner.nodes.remove(id)
    }

    pub fn get_node(&self, id: &str) -> Option<Node<T>> {
        self.inner.lock().unwrap().nodes.get(id).cloned()
    }

    pub fn get_node_for_key(&self, key: &[u8]) -> Result<Node<T>, Error> {
        let inner = self.inner.lock().unwrap();
        let id = inner.hash.get_node(key).ok_or(Error::NoNodes)?;
        inner.nodes.get(id).cloned().ok_or(Error::NoNodes)
    }

    pub fn node_ids(&self) -> Vec<String> {
        self.inner.lock().unwrap().nodes.keys().cloned().collect()
    }

    fn all_nodes(&self) -> Vec<Node<T>> {
        self.inner.lock().unwrap().nodes.values().cloned().collect()
    }

    // -- Keyed operations ---------------------------------------------------

    pub async fn get(&self, k: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        let result = self.gets(&[k]).await?;
        Ok(result.into_iter().next().map(|(_, entry)| entry.data))
    }

    /// Groups requested keys by target node, issues one multi-get per node
    /// in parallel, and merges the per-node results back into a single
    /// list ordered the way the caller listed `keys` (misses are simply
    /// absent, never left as holes).
    pub async fn gets(&self, keys: &[&[u8]]) -> Result<Vec<(Vec<u8>, ValueEntry)>, Error> {
        for k in keys {
            key::validate(k)?;
        }

        let mut by_node: HashMap<String, Vec<Vec<u8>>> = HashMap::new();
        {
            let inner = self.inner.lock().unwrap();
            for k in keys {
                let id = inner.hash.get_node(k).ok_or(Error::NoNodes)?;
                by_node.entry(id.to_string()).or_default().push(k.to_vec());
            }
        }

        let futs = by_node.into_iter().map(|(id, node_keys)| {
            let node = self.get_node(&id);
            let reason = format!("get on missing node '{}'", id);
            async move {
                let node = node.ok_or(Error::Discovery(reason))?;
                let key_refs: Vec<&[u8]> = node_keys.iter().map(|k| k.as_slice()).collect();
                let bytes = text::get_command(&key_refs);
                let opts = CommandOpts::new(ResponseShape::Multiline)
                    .idempotent()
                    .with_requested_keys(node_keys);
                let reply = self.run_with_retry(&node, bytes, opts).await?;
                match reply {
                    Reply::Values(values) => Ok(values),
                    _ => Err(Error::Protocol("expected a multiline reply".into())),
                }
            }
        });

        let per_node: Vec<Result<MultilineReply, Error>> = futures::future::join_all(futs).await;

        let mut found: HashMap<Vec<u8>, ValueEntry> = HashMap::new();
        for result in per_node {
            let values = result?;
            for entry in values.values {
                found.insert(entry.key.clone(), entry);
            }
        }

        Ok(keys
            .iter()
            .filter_map(|k| found.get(*k).cloned().map(|entry| (k.to_vec(), entry)))
            .collect())
    }

    /// The binary-protocol equivalent of [`Cluster::get`]: a single `GET`
    /// frame through `binary::Packet` instead of the ASCII codec. Needed on
    /// servers that only accept the binary protocol once SASL has
    /// authenticated the connection.
    pub async fn get_binary(&self, k: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        key::validate(k)?;
        let node = self.get_node_for_key(k)?;
        let request = binary::Packet::request(binary::OP_GET, Vec::new(), k.to_vec(), Vec::new());
        let opts = CommandOpts::new(ResponseShape::Binary).idempotent();
        let reply = self.run_with_retry(&node, request.to_bytes(), opts).await?;
        match reply {
            Reply::Binary(packet) if packet.header.status == binary::STATUS_KEY_NOT_FOUND => Ok(None),
            Reply::Binary(packet) => packet.error_for_status().map(|()| Some(packet.value)),
            _ => Err(Error::Protocol("expected a binary reply".into())),
        }
    }

    /// The binary-protocol equivalent of [`Cluster::set`].
    pub async fn set_binary(&self, k: &[u8], value: &[u8], flags: u32, exptime: u32) -> Result<(), Error> {
        key::validate(k)?;
        let node = self.get_node_for_key(k)?;
        let extras = binary::store_extras(flags, exptime);
        let request = binary::Packet::request(binary::OP_SET, extras, k.to_vec(), value.to_vec());
        let opts = CommandOpts::new(ResponseShape::Binary);
        let reply = self.run_with_retry(&node, request.to_bytes(), opts).await?;
        match reply {
            Reply::Binary(packet) => packet.error_for_status(),
            _ => Err(Error::Protocol("expected a binary reply".into())),
        }
    }

    pub async fn set(&self, k: &[u8], value: &[u8], flags: u32, exptime: u32) -> Result<(), Error> {
        self.storage_command("set", k, value, flags, exptime, false).await
    }

    pub async fn add(&self, k: &[u8], value: &[u8], flags: u32, exptime: u32) -> Result<(), Error> {
        self.storage_command("add", k, value, flags, exptime, false).await
    }

    pub async fn replace(&self, k: &[u8], value: &[u8], flags: u32, exptime: u32) -> Result<(), Error> {
        self.storage_command("replace", k, value, flags, exptime, false).await
    }

    pub async fn append(&self, k: &[u8], value: &[u8]) -> Result<(), Error> {
        self.storage_command("append", k, value, 0, 0, false).await
    }

    pub async fn prepend(&self, k: &[u8], value: &[u8]) -> Result<(), Error> {
        self.storage_command("prepend", k, value, 0, 0, false).await
    }

    async fn storage_command(
        &self,
        name: &str,
        k: &[u8],
        value: &[u8],
        flags: u32,
        exptime: u32,
        idempotent: bool,
    ) -> Result<(), Error> {
        key::validate(k)?;
        let node = self.get_node_for_key(k)?;
        let bytes = text::storage_command(name, k, flags, exptime, value);
        let mut opts = CommandOpts::new(ResponseShape::SingleLine);
        if idempotent {
            opts = opts.idempotent();
        }
        let reply = self.run_with_retry(&node, bytes, opts).await?;
        match reply {
            Reply::Line(LineReply::Stored) => Ok(()),
            Reply::Line(other) => Err(Error::Protocol(format!("unexpected storage reply: {:?}", other))),
            _ => Err(Error::Protocol("expected a single-line reply".into())),
        }
    }

    /// `true` iff the server reports deletion; `false` on `NOT_FOUND`.
    pub async fn delete(&self, k: &[u8]) -> Result<bool, Error> {
        key::validate(k)?;
        let node = self.get_node_for_key(k)?;
        let bytes = text::delete_command(k);
        let opts = CommandOpts::new(ResponseShape::SingleLine);
        let reply = self.run_with_retry(&node, bytes, opts).await?;
        match reply {
            Reply::Line(LineReply::Deleted) => Ok(true),
            Reply::Line(LineReply::NotFound) => Ok(false),
            Reply::Line(other) => Err(Error::Protocol(format!("unexpected delete reply: {:?}", other))),
            _ => Err(Error::Protocol("expected a single-line reply".into())),
        }
    }

    pub async fn incr(&self, k: &[u8], delta: u64) -> Result<Option<u64>, Error> {
        self.arith_command(text::incr_command(k, delta), k).await
    }

    pub async fn decr(&self, k: &[u8], delta: u64) -> Result<Option<u64>, Error> {
        self.arith_command(text::decr_command(k, delta), k).await
    }

    async fn arith_command(&self, bytes: Vec<u8>, k: &[u8]) -> Result<Option<u64>, Error> {
        key::validate(k)?;
        let node = self.get_node_for_key(k)?;
        let opts = CommandOpts::new(ResponseShape::SingleLine);
        let reply = self.run_with_retry(&node, bytes, opts).await?;
        match reply {
            Reply::Line(LineReply::Int(n)) => Ok(Some(n as u64)),
            Reply::Line(LineReply::NotFound) => Ok(None),
            Reply::Line(other) => Err(Error::Protocol(format!("unexpected arithmetic reply: {:?}", other))),
            _ => Err(Error::Protocol("expected a single-line reply".into())),
        }
    }

    pub async fn touch(&self, k: &[u8], exptime: u32) -> Result<bool, Error> {
        key::validate(k)?;
        let node = self.get_node_for_key(k)?;
        let bytes = text::touch_command(k, exptime);
        let opts = CommandOpts::new(ResponseShape::SingleLine);
        let reply = self.run_with_retry(&node, bytes, opts).await?;
        match reply {
            Reply::Line(LineReply::Touched) => Ok(true),
            Reply::Line(LineReply::NotFound) => Ok(false),
            Reply::Line(other) => Err(Error::Protocol(format!("unexpected touch reply: {:?}", other))),
            _ => Err(Error::Protocol("expected a single-line reply".into())),
        }
    }

    // -- Broadcast operations ------------------------------------------------

    /// Fans out to every node in parallel; returns `true` iff every node
    /// acknowledged.
    pub async fn flush(&self) -> Result<bool, Error> {
        let nodes = self.all_nodes();
        let futs = nodes.iter().map(|node| {
            let bytes = text::flush_command();
            let opts = CommandOpts::new(ResponseShape::SingleLine);
            async move { self.run_with_retry(node, bytes, opts).await }
        });
        let results = futures::future::join_all(futs).await;
        let mut all_ok = true;
        for result in results {
            match result? {
                Reply::Line(LineReply::Ok) => {}
                _ => all_ok = false,
            }
        }
        Ok(all_ok)
    }

    /// Returns a map keyed by node-id.
    pub async fn stats(&self) -> Result<HashMap<String, HashMap<String, String>>, Error> {
        let inner_nodes: Vec<(String, Node<T>)> = {
            let inner = self.inner.lock().unwrap();
            inner.nodes.iter().map(|(id, n)| (id.clone(), n.clone())).collect()
        };
        let futs = inner_nodes.into_iter().map(|(id, node)| async move {
            let bytes = text::stats_command();
            let opts = CommandOpts::new(ResponseShape::Stats);
            let reply = self.run_with_retry(&node, bytes, opts).await?;
            match reply {
                Reply::Stats(map) => Ok((id, map)),
                _ => Err(Error::Protocol("expected a stats reply".into())),
            }
        });
        let results: Vec<Result<(String, HashMap<String, String>), Error>> =
            futures::future::join_all(futs).await;
        results.into_iter().collect()
    }

    /// Returns the first node's version reply.
    pub async fn version(&self) -> Result<String, Error> {
        let nodes = self.all_nodes();
        let node = nodes.first().ok_or(Error::NoNodes)?;
        let bytes = text::version_command();
        let opts = CommandOpts::new(ResponseShape::SingleLine);
        let reply = self.run_with_retry(node, bytes, opts).await?;
        match reply {
            Reply::Line(LineReply::Raw(v)) => Ok(v),
            Reply::Line(other) => Err(Error::Protocol(format!("unexpected version reply: {:?}", other))),
            _ => Err(Error::Protocol("expected a single-line reply".into())),
        }
    }

    // -- Retry policy --------------------------------------------------------

    async fn run_with_retry(&self, node: &Node<T>, bytes: Vec<u8>, opts: CommandOpts) -> Result<Reply, Error> {
        let idempotent = opts.idempotent;
        let shape = opts.shape;
        let requested_keys = opts.requested_keys.clone();

        let mut attempt = 0;
        loop {
            let this_opts = CommandOpts {
                shape,
                requested_keys: requested_keys.clone(),
                idempotent,
            };
            let result = node.command(bytes.clone(), this_opts).await;
            match result {
                Ok(reply) => return Ok(reply),
                Err(err) => {
                    let may_retry = attempt < self.config.retries
                        && err.is_retryable()
                        && (!self.config.retry_only_idempotent || idempotent);
                    if !may_retry {
                        return Err(err);
                    }
                    warn!(attempt, node = node.id(), error = %err, "retrying command");
                    let _ = node.reconnect().await;
                    let delay = self.config.retry_backoff.delay_for(attempt, self.config.retry_delay);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    // -- Auto-discovery --------------------------------------------------------

    fn start_auto_discovery(&self) {
        let cluster = self.clone();
        let interval = self.config.auto_discovery.polling_interval;
        let handle = tokio::spawn(async move {
            let poller = Poller::new(interval);
            if let Err(err) = cluster.discovery_poll_once().await {
                cluster.emit(Event::AutoDiscoverError { message: err.to_string() });
            }
            poller
                .run(|| {
                    let cluster = cluster.clone();
                    async move { cluster.discovery_poll_once().await }
                })
                .await;
        });
        *self.discovery_handle.lock().unwrap() = Some(handle);
    }

    /// One fetch-diff-reconcile cycle. Kept `pub(crate)` so tests can
    /// drive it without waiting on the real polling interval.
    pub(crate) async fn discovery_poll_once(&self) -> Result<(), Error> {
        let config_endpoint = self.resolve_config_endpoint()?;
        let dialect = self.config.auto_discovery.dialect;

        let config_node = self.ensure_config_node(&config_endpoint).await?;
        let topology = self.fetch_topology_from(&config_node, dialect).await?;

        self.emit(Event::AutoDiscover { topology: topology.clone() });
        self.reconcile(topology)
    }

    fn resolve_config_endpoint(&self) -> Result<Endpoint, Error> {
        if let Some(endpoint) = &self.config.auto_discovery.config_endpoint {
            return Ok(endpoint.clone());
        }
        let inner = self.inner.lock().unwrap();
        inner
            .nodes
            .values()
            .next()
            .map(|n| n.endpoint().clone())
            .ok_or(Error::NoNodes)
    }

    async fn ensure_config_node(&self, endpoint: &Endpoint) -> Result<Node<T>, Error> {
        let id = endpoint.id();
        if let Some(node) = self.get_node(&id) {
            node.connect().await?;
            return Ok(node);
        }
        let node = Node::spawn(id, endpoint.clone(), self.config.node_config.clone());
        node.connect().await?;
        Ok(node)
    }

    async fn fetch_topology_from(&self, node: &Node<T>, dialect: ConfigDialect) -> Result<Topology, Error> {
        let bytes = text::config_get_cluster_command(dialect);
        let opts = CommandOpts::new(ResponseShape::Config(dialect));
        let reply = node.command(bytes, opts).await.map_err(|e| Error::Discovery(e.to_string()))?;
        match reply {
            Reply::Config(payload) => discovery::parse_topology(&payload),
            _ => Err(Error::Discovery("expected a config reply".into())),
        }
    }

    /// Gates everything on the topology's version: an unchanged version is
    /// a no-op, regardless of what the node-id sets happen to look like. A
    /// changed version always records the new version and emits
    /// `AutoDiscoverUpdate`, even when membership reconciliation itself
    /// (`new ∖ current` added, `current ∖ new` removed) turns out to be a
    /// no-op. An empty new topology keeps the existing ring and raises
    /// `AutoDiscoverError` instead of evicting every node.
    fn reconcile(&self, topology: Topology) -> Result<(), Error> {
        if topology.nodes.is_empty() {
            self.emit(Event::AutoDiscoverError {
                message: "auto-discovery reported an empty topology; keeping current ring".into(),
            });
            return Ok(());
        }

        let version_changed = {
            let mut inner = self.inner.lock().unwrap();
            let changed = inner.topology_version != Some(topology.version);
            inner.topology_version = Some(topology.version);
            changed
        };
        if !version_changed {
            return Ok(());
        }

        let current_ids = self.node_ids();
        let (added, removed): (Vec<DiscoveredNode>, Vec<String>) = discovery::diff_topology(&current_ids, &topology);

        for node in &added {
            let raw = node.endpoint().id();
            if let Err(err) = self.add_node(&raw, self.config.node_config.weight) {
                error!(node = %raw, error = %err, "auto-discovery failed to add node");
                self.emit(Event::Error { node: None, message: err.to_string() });
            }
        }
        for id in &removed {
            self.remove_node(id);
        }

        info!(version = topology.version, added = added.len(), removed = removed.len(), "topology reconciled");
        self.emit(Event::AutoDiscoverUpdate { topology });
        Ok(())
    }
}

/// SASL credentials applied to every node.
pub fn credentials(username: impl Into<String>, password: impl Into<String>) -> Credentials {
    Credentials {
        username: username.into(),
        password: password.into(),
    }
}
