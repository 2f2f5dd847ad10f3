//! The simpler modulo-hash distribution alternative: no
//! minimal-motion guarantee, but trivial to reason about.

use crate::ring::hash32;

/// `get_node(key) = node_list[ H32(key) mod |node_list| ]`, where
/// `node_list` replicates each id `weight` times so weighted nodes get a
/// proportionally larger share.
#[derive(Debug, Clone, Default)]
pub struct ModuloHash {
    node_list: Vec<String>,
}

impl ModuloHash {
    pub fn new() -> Self {
        ModuloHash { node_list: Vec::new() }
    }

    pub fn from_nodes<'a>(nodes: impl IntoIterator<Item = (&'a str, u32)>) -> Self {
        let mut hash = ModuloHash::new();
        for (id, weight) in nodes {
            hash.add_node(id, weight);
        }
        hash
    }

    pub fn add_node(&mut self, id: &str, weight: u32) {
        self.node_list.retain(|n| n != id);
        for _ in 0..weight {
            self.node_list.push(id.to_string());
        }
    }

    pub fn remove_node(&mut self, id: &str) {
        self.node_list.retain(|n| n != id);
    }

    pub fn is_empty(&self) -> bool {
        self.node_list.is_empty()
    }

    pub fn get_node(&self, key: &[u8]) -> Option<&str> {
        if self.node_list.is_empty() {
            return None;
        }
        let h = hash32(key) as u32; // unsigned 32-bit view
        let idx = (h as usize) % self.node_list.len();
        Some(self.node_list[idx].as_str())
    }
}
