//! Auto-discovery: a periodic poll of a configuration endpoint that
//! diffs the reported topology against the current ring and asks the
//! cluster to reconcile.

use crate::endpoint::Endpoint;
use crate::error::Error;
use crate::text::ConfigDialect;
use std::time::Duration;
use tracing::{debug, warn};

/// One server reported by the config endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredNode {
    pub hostname: String,
    pub ip: Option<String>,
    pub port: u16,
}

impl DiscoveredNode {
    /// Node-id preference: IP when non-empty, hostname otherwise,
    /// bracketing IPv6 the same way `Endpoint::id` does.
    pub fn id(&self) -> String {
        let host = match &self.ip {
            Some(ip) if !ip.is_empty() => ip.as_str(),
            _ => self.hostname.as_str(),
        };
        Endpoint {
            host: host.to_string(),
            port: self.port,
        }
        .id()
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint {
            host: match &self.ip {
                Some(ip) if !ip.is_empty() => ip.clone(),
                _ => self.hostname.clone(),
            },
            port: self.port,
        }
    }
}

/// A versioned snapshot of cluster membership.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub version: u64,
    pub nodes: Vec<DiscoveredNode>,
}

/// Parse the two-line config-endpoint payload: a decimal version line,
/// then a whitespace-separated list of
/// `hostname|ip|port` triples.
pub fn parse_topology(payload: &[u8]) -> Result<Topology, Error> {
    let text = String::from_utf8_lossy(payload);
    let mut lines = text.lines().map(str::trim).filter(|l| !l.is_empty());

    let version_line = lines
        .next()
        .ok_or_else(|| Error::Discovery("config payload is missing the version line".into()))?;
    let version: u64 = version_line
        .parse()
        .map_err(|_| Error::Discovery(format!("malformed topology version: {}", version_line)))?;

    let entries_line = lines
        .next()
        .ok_or_else(|| Error::Discovery("config payload is missing the node list line".into()))?;

    let mut nodes = Vec::new();
    for triple in entries_line.split_whitespace() {
        nodes.push(parse_node_triple(triple)?);
    }

    Ok(Topology { version, nodes })
}

fn parse_node_triple(triple: &str) -> Result<DiscoveredNode, Error> {
    let parts: Vec<&str> = triple.split('|').collect();
    if parts.len() != 3 {
        return Err(Error::Discovery(format!("malformed topology entry: {}", triple)));
    }
    let hostname = parts[0].to_string();
    let ip = if parts[1].is_empty() { None } else { Some(parts[1].to_string()) };
    let port: u16 = parts[2]
        .parse()
        .map_err(|_| Error::Discovery(format!("malformed topology port: {}", triple)))?;
    if port == 0 {
        return Err(Error::Discovery(format!("topology port out of range: {}", triple)));
    }
    Ok(DiscoveredNode { hostname, ip, port })
}

/// Auto-discovery settings.
#[derive(Debug, Clone)]
pub struct AutoDiscoveryConfig {
    pub enabled: bool,
    pub config_endpoint: Option<Endpoint>,
    pub polling_interval: Duration,
    pub dialect: ConfigDialect,
}

impl Default for AutoDiscoveryConfig {
    fn default() -> Self {
        AutoDiscoveryConfig {
            enabled: false,
            config_endpoint: None,
            polling_interval: Duration::from_millis(60_000),
            dialect: ConfigDialect::Modern,
        }
    }
}

/// One fetch-and-parse cycle against a config-endpoint connection. The
/// connection itself is supplied by the caller (the cluster owns the
/// node that talks to the config endpoint); this function only frames
/// the request and classifies the reply.
pub async fn fetch_topology<F, Fut>(dialect: ConfigDialect, send_config_request: F) -> Result<Topology, Error>
where
    F: FnOnce(ConfigDialect) -> Fut,
    Fut: std::future::Future<Output = Result<Vec<u8>, Error>>,
{
    let payload = send_config_request(dialect).await?;
    parse_topology(&payload)
}

/// Diff two topologies into (added, removed) id sets: `new \ current` is
/// added, `current \ new` is removed.
pub fn diff_topology(current_ids: &[String], new_topology: &Topology) -> (Vec<DiscoveredNode>, Vec<String>) {
    use std::collections::HashSet;

    let new_ids: HashSet<String> = new_topology.nodes.iter().map(|n| n.id()).collect();
    let current_set: HashSet<&String> = current_ids.iter().collect();

    let added: Vec<DiscoveredNode> = new_topology
        .nodes
        .iter()
        .filter(|n| !current_set.contains(&n.id()))
        .cloned()
        .collect();
    let removed: Vec<String> = current_ids
        .iter()
        .filter(|id| !new_ids.contains(*id))
        .cloned()
        .collect();

    (added, removed)
}

/// Drives the periodic poll loop. `poll_once` is injected by the cluster
/// (it knows how to reach the config-endpoint node and how to reconcile);
/// this type only owns the scheduling, re-entrancy guard, and non-fatal
/// error handling.
pub struct Poller {
    interval: Duration,
}

impl Poller {
    pub fn new(interval: Duration) -> Self {
        Poller { interval }
    }

    /// Run forever, calling `poll_once` on a fixed cadence. A poll that is
    /// still running when the next tick arrives is skipped, not queued;
    /// failures are logged and do not stop the loop.
    pub async fn run<F, Fut>(&self, mut poll_once: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<(), Error>>,
    {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            match poll_once().await {
                Ok(()) => debug!("auto-discovery poll completed"),
                Err(err) => warn!(error = %err, "auto-discovery poll failed, will retry next tick"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_version_and_node_list() {
        let payload = b"1\nhost-a|10.0.0.1|11211 host-b||11212\n";
        let topology = parse_topology(payload).unwrap();
        assert_eq!(topology.version, 1);
        assert_eq!(topology.nodes.len(), 2);
        assert_eq!(topology.nodes[0].hostname, "host-a");
        assert_eq!(topology.nodes[0].ip.as_deref(), Some("10.0.0.1"));
        assert_eq!(topology.nodes[0].port, 11211);
        assert_eq!(topology.nodes[1].ip, None);
    }

    #[test]
    fn id_prefers_ip_over_hostname() {
        let node = DiscoveredNode {
            hostname: "host-a".into(),
            ip: Some("10.0.0.1".into()),
            port: 11211,
        };
        assert_eq!(node.id(), "10.0.0.1:11211");

        let node = DiscoveredNode {
            hostname: "host-b".into(),
            ip: None,
            port: 11212,
        };
        assert_eq!(node.id(), "host-b:11212");
    }

    #[test]
    fn rejects_port_out_of_range() {
        assert!(parse_node_triple("host|ip|0").is_err());
        assert!(parse_node_triple("host|ip|not-a-port").is_err());
    }

    #[test]
    fn rejects_malformed_entry_shape() {
        assert!(parse_node_triple("host|ip").is_err());
    }

    #[test]
    fn missing_lines_are_discovery_errors() {
        assert!(parse_topology(b"").is_err());
        assert!(parse_topology(b"1\n").is_err());
    }

    #[test]
    fn diff_computes_added_and_removed_ids() {
        let current = vec!["a:11211".to_string()];
        let topology = Topology {
            version: 2,
            nodes: vec![
                DiscoveredNode { hostname: "a".into(), ip: None, port: 11211 },
                DiscoveredNode { hostname: "b".into(), ip: None, port: 11211 },
            ],
        };
        let (added, removed) = diff_topology(&current, &topology);
        assert_eq!(added.len(), 1);
        assert_eq!(added[0].id(), "b:11211");
        assert!(removed.is_empty());
    }

    #[test]
    fn diff_detects_removed_ids() {
        let current = vec!["a:11211".to_string(), "b:11211".to_string()];
        let topology = Topology {
            version: 3,
            nodes: vec![DiscoveredNode { hostname: "a".into(), ip: None, port: 11211 }],
        };
        let (added, removed) = diff_topology(&current, &topology);
        assert!(added.is_empty());
        assert_eq!(removed, vec!["b:11211".to_string()]);
    }
}
