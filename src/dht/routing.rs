use std::collections::VecDeque;

use parking_lot::RwLock;

use super::node::{Node, NodeId, PeerAddr};
use crate::constants::NUM_BUCKETS;

#[derive(Debug)]
struct Bucket {
    k: usize,
    nodes: VecDeque<Node>,
    replacement_cache: VecDeque<Node>,
}

impl Bucket {
    fn new(k: usize) -> Self {
        Self {
            k,
            nodes: VecDeque::with_capacity(k),
            replacement_cache: VecDeque::with_capacity(k),
        }
    }

    fn add(&mut self, node: Node) -> bool {
        if let Some(pos) = self.nodes.iter().position(|n| n.id == node.id) {
            if let Some(mut existing) = self.nodes.remove(pos) {
                existing.addr = node.addr;
                existing.touch();
                self.nodes.push_back(existing);
            }
            return true;
        }

        if self.nodes.len() < self.k {
            self.nodes.push_back(node);
            return true;
        }

        if self.replacement_cache.iter().all(|n| n.id != node.id) {
            if self.replacement_cache.len() >= self.k {
                self.replacement_cache.pop_front();
            }
            self.replacement_cache.push_back(node);
        }

        false
    }

    fn remove(&mut self, id: &NodeId) -> Option<Node> {
        let pos = self.nodes.iter().position(|n| &n.id == id)?;
        let removed = self.nodes.remove(pos);

        if let Some(replacement) = self.replacement_cache.pop_back() {
            self.nodes.push_back(replacement);
        }

        removed
    }

    fn get_mut(&mut self, id: &NodeId) -> Option<&mut Node> {
        self.nodes.iter_mut().find(|n| &n.id == id)
    }

    fn oldest(&self) -> Option<&Node> {
        self.nodes.front()
    }
}

/// K-bucket routing table keyed by XOR distance to the local id.
pub struct RoutingTable {
    k: usize,
    our_id: RwLock<NodeId>,
    buckets: Vec<RwLock<Bucket>>,
}

impl RoutingTable {
    pub fn new(our_id: NodeId, k: usize) -> Self {
        let buckets = (0..NUM_BUCKETS)
            .map(|_| RwLock::new(Bucket::new(k)))
            .collect();

        Self {
            k,
            our_id: RwLock::new(our_id),
            buckets,
        }
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn our_id(&self) -> NodeId {
        *self.our_id.read()
    }

    /// Returns `true` if the node is now in its bucket.
    pub fn add_node(&self, node: Node) -> bool {
        let our_id = self.our_id();
        if node.id == our_id {
            return false;
        }

        let bucket_idx = our_id.bucket_index(&node.id);
        self.buckets[bucket_idx].write().add(node)
    }

    pub fn remove_node(&self, id: &NodeId) -> Option<Node> {
        let bucket_idx = self.our_id().bucket_index(id);
        self.buckets[bucket_idx].write().remove(id)
    }

    pub fn remove_by_addr(&self, addr: &PeerAddr) -> Option<Node> {
        let node = self.find_by_addr(addr)?;
        self.remove_node(&node.id)
    }

    pub fn mark_failed(&self, id: &NodeId) {
        let bucket_idx = self.our_id().bucket_index(id);
        let mut bucket = self.buckets[bucket_idx].write();

        if let Some(node) = bucket.get_mut(id) {
            node.fail();

            if node.is_bad() {
                bucket.remove(id);
            }
        }
    }

    /// Up to `count` known nodes ordered by XOR distance to `target`.
    pub fn closest(&self, target: &NodeId, count: usize) -> Vec<Node> {
        let mut nodes: Vec<Node> = Vec::new();

        for bucket in &self.buckets {
            let bucket = bucket.read();
            nodes.extend(bucket.nodes.iter().filter(|n| !n.is_bad()).cloned());
        }

        nodes.sort_by(|a, b| target.cmp_distance(&a.id, &b.id));
        nodes.truncate(count);
        nodes
    }

    pub fn node_count(&self) -> usize {
        self.buckets.iter().map(|b| b.read().nodes.len()).sum()
    }

    pub fn all_nodes(&self) -> Vec<Node> {
        let mut nodes = Vec::new();
        for bucket in &self.buckets {
            nodes.extend(bucket.read().nodes.iter().cloned());
        }
        nodes
    }

    pub fn find_by_addr(&self, addr: &PeerAddr) -> Option<Node> {
        for bucket in &self.buckets {
            let bucket = bucket.read();
            if let Some(node) = bucket.nodes.iter().find(|n| &n.addr == addr) {
                return Some(node.clone());
            }
        }
        None
    }

    pub fn stale_buckets(&self) -> Vec<usize> {
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, b)| b.read().oldest().is_some_and(|n| n.is_stale()))
            .map(|(i, _)| i)
            .collect()
    }

    /// Switches the local id and re-buckets every known node around it.
    pub fn rekey(&self, new_id: NodeId) {
        let nodes = self.all_nodes();
        for bucket in &self.buckets {
            let mut bucket = bucket.write();
            bucket.nodes.clear();
            bucket.replacement_cache.clear();
        }
        *self.our_id.write() = new_id;
        for node in nodes {
            self.add_node(node);
        }
    }
}
