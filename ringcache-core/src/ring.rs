//! The Ketama-style consistent-hash ring. A node of weight `w`
//! contributes `w * base_weight` virtual entries to the sorted clock;
//! `get_node`/`get_nodes` walk that clock to route a key.

use sha1::{Digest, Sha1};
use std::collections::BTreeSet;

const DEFAULT_BASE_WEIGHT: u32 = 50;

/// The 32-bit signed hash used to place entries on the clock: the first
/// four bytes of SHA-1(bytes), read big-endian.
pub fn hash32(bytes: &[u8]) -> i32 {
    let digest = Sha1::digest(bytes);
    i32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

/// A consistent-hash ring over a set of node ids. Holds no connections
/// itself; `Cluster` looks up a node id here and then looks up the
/// corresponding `Node` handle in its own map.
#[derive(Debug, Clone)]
pub struct Ring {
    base_weight: u32,
    /// Sorted ascending by hash. Ties broken by insertion order, which is
    /// immaterial for correctness.
    clock: Vec<(i32, String)>,
}

impl Default for Ring {
    fn default() -> Self {
        Ring::new(DEFAULT_BASE_WEIGHT)
    }
}

impl Ring {
    pub fn new(base_weight: u32) -> Self {
        Ring {
            base_weight,
            clock: Vec::new(),
        }
    }

    /// Build a ring from an initial (id, weight) topology in one pass:
    /// cheaper than repeated `add_node` since the clock is sorted once.
    pub fn from_nodes<'a>(base_weight: u32, nodes: impl IntoIterator<Item = (&'a str, u32)>) -> Self {
        let mut ring = Ring::new(base_weight);
        for (id, weight) in nodes {
            ring.clock.extend(virtual_entries(id, weight, base_weight));
        }
        ring.clock.sort_by_key(|(hash, _)| *hash);
        ring
    }

    /// Add or update a node's entries. `weight == 0` removes the node
    /// re-adding an existing id fully replaces its entries so a
    /// weight change is atomic. Negative weights are not representable
    /// (`u32`) and are rejected by the caller's type before reaching here.
    pub fn add_node(&mut self, id: &str, weight: u32) {
        self.clock.retain(|(_, node_id)| node_id != id);
        if weight > 0 {
            self.clock.extend(virtual_entries(id, weight, self.base_weight));
            self.clock.sort_by_key(|(hash, _)| *hash);
        }
    }

    pub fn remove_node(&mut self, id: &str) {
        self.add_node(id, 0);
    }

    pub fn is_empty(&self) -> bool {
        self.clock.is_empty()
    }

    pub fn len(&self) -> usize {
        distinct_owners(&self.clock).len()
    }

    /// Locate the node owning `key`: hash the key, find the first clock
    /// entry with hash >= target, wrapping to index 0 if none exists.
    pub fn get_node(&self, key: &[u8]) -> Option<&str> {
        if self.clock.is_empty() {
            return None;
        }
        let idx = self.index_for(key);
        Some(self.clock[idx].1.as_str())
    }

    /// Walk the clock from the primary index, collecting up to
    /// `min(n, node_count)` *distinct* owners in ring order.
    pub fn get_nodes(&self, key: &[u8], n: usize) -> Vec<&str> {
        if self.clock.is_empty() || n == 0 {
            return Vec::new();
        }
        let target = self.index_for(key);
        let want = n.min(self.len());
        let mut seen = BTreeSet::new();
        let mut out = Vec::with_capacity(want);
        for offset in 0..self.clock.len() {
            let (_, id) = &self.clock[(target + offset) % self.clock.len()];
            if seen.insert(id.as_str()) {
                out.push(id.as_str());
                if out.len() == want {
                    break;
                }
            }
        }
        out
    }

    fn index_for(&self, key: &[u8]) -> usize {
        let target = hash32(key);
        match self.clock.binary_search_by_key(&target, |(hash, _)| *hash) {
            Ok(idx) => idx,
            Err(idx) if idx < self.clock.len() => idx,
            Err(_) => 0,
        }
    }
}

fn virtual_entries(id: &str, weight: u32, base_weight: u32) -> Vec<(i32, String)> {
    (1..=(weight * base_weight))
        .map(|i| (hash32(format!("{}\0{}", id, i).as_bytes()), id.to_string()))
        .collect()
}

fn distinct_owners(clock: &[(i32, String)]) -> BTreeSet<&str> {
    clock.iter().map(|(_, id)| id.as_str()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn lookup_is_pure_while_ring_is_unchanged() {
        let ring = Ring::from_nodes(50, vec![("a", 1), ("b", 1), ("c", 1)]);
        let first = ring.get_node(b"some-key").map(String::from);
        for _ in 0..10 {
            assert_eq!(ring.get_node(b"some-key").map(String::from), first);
        }
    }

    #[test]
    fn three_equal_weight_nodes_distribute_within_tolerance() {
        let ring = Ring::from_nodes(50, vec![("a", 1), ("b", 1), ("c", 1)]);
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for i in 0..300 {
            let key = format!("key-{}", i);
            let owner = ring.get_node(key.as_bytes()).unwrap();
            *counts.entry(owner).or_insert(0) += 1;
        }
        for count in counts.values() {
            assert!(*count >= 75 && *count <= 125, "count {} out of range", count);
        }
    }

    #[test]
    fn weighted_node_receives_proportionally_more() {
        let ring = Ring::from_nodes(50, vec![("heavy", 3), ("light", 1)]);
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for i in 0..400 {
            let key = format!("key-{}", i);
            let owner = ring.get_node(key.as_bytes()).unwrap();
            *counts.entry(owner).or_insert(0) += 1;
        }
        let heavy = counts["heavy"];
        let light = counts["light"];
        assert!(heavy > light);
        assert!(heavy >= 2 * light && heavy <= 4 * light);
    }

    #[test]
    fn adding_one_node_moves_a_bounded_fraction_of_keys() {
        let mut before = Ring::from_nodes(50, vec![("a", 1), ("b", 1), ("c", 1)]);
        let keys: Vec<String> = (0..2000).map(|i| format!("key-{}", i)).collect();
        let before_owners: Vec<&str> = keys.iter().map(|k| before.get_node(k.as_bytes()).unwrap()).collect();

        before.add_node("d", 1);
        let after_owners: Vec<&str> = keys.iter().map(|k| before.get_node(k.as_bytes()).unwrap()).collect();

        let moved = before_owners.iter().zip(after_owners.iter()).filter(|(a, b)| a != b).count();
        let clock_len = before.clock.len();
        let expected_bound = (50 * keys.len()) / clock_len + keys.len() / 10;
        assert!(moved <= expected_bound, "moved {} keys, expected roughly <= {}", moved, expected_bound);
    }

    #[test]
    fn removing_node_removes_exactly_its_entries() {
        let mut ring = Ring::from_nodes(50, vec![("a", 1), ("b", 2)]);
        assert_eq!(ring.clock.len(), 150);
        ring.remove_node("b");
        assert_eq!(ring.clock.len(), 50);
        assert!(ring.clock.iter().all(|(_, id)| id == "a"));
    }

    #[test]
    fn re_adding_existing_node_replaces_its_entries_atomically() {
        let mut ring = Ring::from_nodes(50, vec![("a", 1)]);
        assert_eq!(ring.clock.len(), 50);
        ring.add_node("a", 3);
        assert_eq!(ring.clock.len(), 150);
    }

    #[test]
    fn get_nodes_returns_distinct_owners_in_ring_order() {
        let ring = Ring::from_nodes(50, vec![("a", 1), ("b", 1), ("c", 1)]);
        let replicas = ring.get_nodes(b"some-key", 2);
        assert_eq!(replicas.len(), 2);
        assert_ne!(replicas[0], replicas[1]);
    }

    #[test]
    fn empty_ring_has_no_owner() {
        let ring = Ring::default();
        assert_eq!(ring.get_node(b"x"), None);
        assert!(ring.get_nodes(b"x", 3).is_empty());
    }
}
