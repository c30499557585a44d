//! Collaborator contracts consumed by the search engine, with in-memory
//! implementations.
//!
//! - [`SearchStore`]: per-search candidate queue ([`MemorySearchStore`])
//! - [`NodeStore`]: the routing table ([`MemoryNodeStore`])
//! - [`RumorMill`]: intake for rumored nodes awaiting verification ([`MemoryRumorMill`])
//!
//! The search runner owns its [`SearchStore`] and shares the node store and
//! rumor mill with the rest of the daemon through `Arc<tokio::sync::Mutex<_>>`.

use std::collections::HashMap;
use std::num::NonZeroUsize;

use lru::LruCache;
use tracing::trace;

use crate::address::{closest, format_path, routes_through, xor_distance, Address, Ip6};

// ============================================================================
// Contracts
// ============================================================================

/// Handle to one search's slot in a [`SearchStore`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SearchStoreId(u64);

impl SearchStoreId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

/// Ranked candidates of each running search.
pub trait SearchStore: Send + 'static {
    /// Open a slot for a search toward `target`.
    fn new_search(&mut self, target: Ip6) -> SearchStoreId;

    /// Offer a candidate. Stores may ignore nodes they already hold.
    fn add_node(&mut self, search: SearchStoreId, address: &Address);

    /// Hand out the best candidate not yet returned, marking it as queried.
    fn next_node(&mut self, search: SearchStoreId) -> Option<Address>;

    /// Release the slot and everything in it.
    fn free_search(&mut self, search: SearchStoreId);

    /// Candidates not yet handed out, best first.
    fn pending(&self, search: SearchStoreId) -> Vec<Address>;
}

/// A routing table entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Node {
    pub address: Address,
    /// Reachability score; higher is better.
    pub reach: u32,
}

impl Node {
    pub fn new(address: Address, reach: u32) -> Self {
        Self { address, reach }
    }
}

/// The authoritative table of known nodes.
pub trait NodeStore: Send + 'static {
    /// Best known record for the node behind `address`'s identifier.
    fn best_known(&self, address: &Address) -> Option<Node>;

    /// Up to `count` known nodes closest to `target`, speaking at least `min_version`.
    fn closest_nodes(&self, target: &Address, count: usize, min_version: u32) -> Vec<Node>;

    /// The node reached by exactly this path, if known.
    fn node_for_path(&self, path: u64) -> Option<Node>;

    /// Forget a path that cannot work.
    fn broken_path(&mut self, path: u64);
}

/// Intake for nodes we heard about but have not verified.
pub trait RumorMill: Send + 'static {
    fn add_node(&mut self, address: &Address);
}

// ============================================================================
// Search Store
// ============================================================================

#[derive(Debug)]
struct Candidate {
    address: Address,
    queried: bool,
}

#[derive(Debug)]
struct SearchSlot {
    target: Address,
    candidates: Vec<Candidate>,
}

/// Keeps every candidate of a search until the search is freed, so a node is
/// never queried twice within one search.
#[derive(Debug, Default)]
pub struct MemorySearchStore {
    next_id: u64,
    searches: HashMap<SearchStoreId, SearchSlot>,
}

impl MemorySearchStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of open slots.
    pub fn len(&self) -> usize {
        self.searches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.searches.is_empty()
    }
}

impl SearchStore for MemorySearchStore {
    fn new_search(&mut self, target: Ip6) -> SearchStoreId {
        let id = SearchStoreId(self.next_id);
        self.next_id += 1;
        self.searches.insert(
            id,
            SearchSlot {
                target: Address::from_target(target),
                candidates: Vec::new(),
            },
        );
        id
    }

    fn add_node(&mut self, search: SearchStoreId, address: &Address) {
        let Some(slot) = self.searches.get_mut(&search) else {
            return;
        };
        if slot.candidates.iter().any(|c| c.address.ip6 == address.ip6) {
            trace!(node = %address, "candidate already known to search");
            return;
        }
        slot.candidates.push(Candidate {
            address: *address,
            queried: false,
        });
    }

    fn next_node(&mut self, search: SearchStoreId) -> Option<Address> {
        let slot = self.searches.get_mut(&search)?;
        let target = slot.target;
        let best = slot
            .candidates
            .iter_mut()
            .filter(|c| !c.queried)
            .min_by(|a, b| closest(&target, &a.address, &b.address))?;
        best.queried = true;
        Some(best.address)
    }

    fn free_search(&mut self, search: SearchStoreId) {
        self.searches.remove(&search);
    }

    fn pending(&self, search: SearchStoreId) -> Vec<Address> {
        let Some(slot) = self.searches.get(&search) else {
            return Vec::new();
        };
        let mut out: Vec<Address> = slot
            .candidates
            .iter()
            .filter(|c| !c.queried)
            .map(|c| c.address)
            .collect();
        out.sort_by(|a, b| closest(&slot.target, a, b));
        out
    }
}

// ============================================================================
// Node Store
// ============================================================================

/// Routing table keyed by path.
///
/// Several paths may lead to the same identity; [`NodeStore::best_known`]
/// picks the one with the highest reach.
#[derive(Debug, Default)]
pub struct MemoryNodeStore {
    by_path: HashMap<u64, Node>,
}

impl MemoryNodeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the node reached by `node.address.path`.
    pub fn insert(&mut self, node: Node) {
        self.by_path.insert(node.address.path, node);
    }

    pub fn len(&self) -> usize {
        self.by_path.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_path.is_empty()
    }

    /// Every known node, in no particular order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.by_path.values()
    }
}

impl NodeStore for MemoryNodeStore {
    fn best_known(&self, address: &Address) -> Option<Node> {
        self.by_path
            .values()
            .filter(|n| n.address.ip6 == address.ip6)
            .max_by(|a, b| {
                a.reach
                    .cmp(&b.reach)
                    .then_with(|| b.address.path.cmp(&a.address.path))
            })
            .copied()
    }

    fn closest_nodes(&self, target: &Address, count: usize, min_version: u32) -> Vec<Node> {
        let mut best: HashMap<Ip6, Node> = HashMap::new();
        for node in self
            .by_path
            .values()
            .filter(|n| n.address.protocol_version >= min_version)
        {
            best.entry(node.address.ip6)
                .and_modify(|current| {
                    if node.reach > current.reach {
                        *current = *node;
                    }
                })
                .or_insert(*node);
        }

        let mut all: Vec<Node> = best.into_values().collect();
        all.sort_by(|a, b| {
            let da = xor_distance(&a.address.ip6, &target.ip6);
            let db = xor_distance(&b.address.ip6, &target.ip6);
            da.cmp(&db)
        });
        all.truncate(count);
        all
    }

    fn node_for_path(&self, path: u64) -> Option<Node> {
        self.by_path.get(&path).copied()
    }

    fn broken_path(&mut self, path: u64) {
        let before = self.by_path.len();
        self.by_path.retain(|p, _| !routes_through(*p, path));
        trace!(
            path = %format_path(path),
            removed = before - self.by_path.len(),
            "broken path"
        );
    }
}

// ============================================================================
// Rumor Mill
// ============================================================================

/// Default number of rumors kept before the oldest are forgotten.
pub const DEFAULT_RUMOR_CAPACITY: usize = 64;

/// Bounded rumor intake. Hearing about a node again refreshes it; when full
/// the stalest rumor is dropped.
#[derive(Debug)]
pub struct MemoryRumorMill {
    rumors: LruCache<Ip6, Address>,
}

impl MemoryRumorMill {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            rumors: LruCache::new(capacity),
        }
    }

    /// Take the oldest rumor for verification.
    pub fn get_node(&mut self) -> Option<Address> {
        self.rumors.pop_lru().map(|(_, addr)| addr)
    }

    pub fn len(&self) -> usize {
        self.rumors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rumors.is_empty()
    }
}

impl Default for MemoryRumorMill {
    fn default() -> Self {
        Self::new(NonZeroUsize::new(DEFAULT_RUMOR_CAPACITY).unwrap_or(NonZeroUsize::MIN))
    }
}

impl RumorMill for MemoryRumorMill {
    fn add_node(&mut self, address: &Address) {
        self.rumors.put(address.ip6, *address);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(first: u8, last: u8, path: u64) -> Address {
        let mut ip6 = [0u8; 16];
        ip6[0] = 0xfc;
        ip6[1] = first;
        ip6[15] = last;
        Address {
            key: [first; 32],
            ip6,
            path,
            protocol_version: 2,
        }
    }

    #[test]
    fn search_store_hands_out_closest_first_and_once() {
        let mut store = MemorySearchStore::new();
        let target = addr(0x00, 0x00, 0).ip6;
        let id = store.new_search(target);

        let far = addr(0x40, 0, 0x13);
        let near = addr(0x01, 0, 0x15);
        store.add_node(id, &far);
        store.add_node(id, &near);
        store.add_node(id, &near);

        assert_eq!(store.pending(id), vec![near, far]);
        assert_eq!(store.next_node(id), Some(near));
        assert_eq!(store.next_node(id), Some(far));
        assert_eq!(store.next_node(id), None);

        store.add_node(id, &near);
        assert_eq!(store.next_node(id), None, "queried nodes are not re-offered");
    }

    #[test]
    fn freed_search_has_no_candidates() {
        let mut store = MemorySearchStore::new();
        let id = store.new_search([0xfc; 16]);
        store.add_node(id, &addr(1, 1, 0x13));
        store.free_search(id);
        assert!(store.is_empty());
        assert_eq!(store.next_node(id), None);
        assert!(store.pending(id).is_empty());
    }

    #[test]
    fn node_store_prefers_highest_reach_per_identity() {
        let mut table = MemoryNodeStore::new();
        let slow = addr(1, 1, 0x13);
        let mut fast = slow;
        fast.path = 0x15;
        table.insert(Node::new(slow, 10));
        table.insert(Node::new(fast, 50));

        let best = table.best_known(&slow).unwrap();
        assert_eq!(best.address.path, 0x15);

        let closest = table.closest_nodes(&slow, 8, 0);
        assert_eq!(closest.len(), 1);
        assert_eq!(closest[0].address.path, 0x15);
    }

    #[test]
    fn node_store_filters_by_version() {
        let mut table = MemoryNodeStore::new();
        let mut old = addr(1, 1, 0x13);
        old.protocol_version = 1;
        table.insert(Node::new(old, 10));
        table.insert(Node::new(addr(2, 2, 0x15), 10));

        let nodes = table.closest_nodes(&Address::from_target([0xfc; 16]), 8, 2);
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].address.path, 0x15);
    }

    #[test]
    fn broken_path_drops_routes_behind_it() {
        let mut table = MemoryNodeStore::new();
        table.insert(Node::new(addr(1, 1, 0x15), 10));
        table.insert(Node::new(addr(2, 2, 0x135), 10));
        table.insert(Node::new(addr(3, 3, 0x17), 10));

        table.broken_path(0x15);
        assert!(table.node_for_path(0x15).is_none());
        assert!(table.node_for_path(0x135).is_none());
        assert!(table.node_for_path(0x17).is_some());
    }

    #[test]
    fn rumor_mill_refreshes_and_evicts_oldest() {
        let mut mill = MemoryRumorMill::new(NonZeroUsize::new(2).unwrap());
        let a = addr(1, 1, 0x13);
        let b = addr(2, 2, 0x15);
        let c = addr(3, 3, 0x17);
        mill.add_node(&a);
        mill.add_node(&b);
        mill.add_node(&a);
        mill.add_node(&c);

        assert_eq!(mill.len(), 2);
        assert_eq!(mill.get_node(), Some(a));
        assert_eq!(mill.get_node(), Some(c));
        assert_eq!(mill.get_node(), None);
    }
}
