//! A simulated label-routed mesh.
//!
//! [`SimMesh`] builds a seeded random graph of nodes with valid keys. Each
//! node numbers its links as interfaces, and a path is a chain of 5-bit hops
//! (`iface << 1 | 1`) capped by a terminator bit, built with [`splice`] just
//! like the routes a search learns from replies. Every node keeps a view of
//! the mesh with paths relative to itself and answers find-node queries from
//! that view, so replies exercise splicing, loop routes and rumors the same
//! way real traffic does.
//!
//! [`SimRouter`] is one node's [`RouterModule`] onto the mesh.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, trace};

use crate::address::{
    derive_ip6, is_valid_ip6, log2, splice, xor_distance, Address, Ip6, KEY_SIZE, SELF_ROUTE,
    UNROUTABLE,
};
use crate::protocol::{FindNodeQuery, NodesReply, RouterModule};
use crate::store::Node;

/// Bits used by one hop of a path.
const HOP_BITS: u32 = 5;

/// Interfaces addressable within one hop.
pub const MAX_INTERFACES: usize = 1 << (HOP_BITS - 1);

/// Nodes returned per find-node answer.
const REPLY_SIZE: usize = 8;

/// Reach assigned to a verified node one hop away; farther nodes get less.
const DIRECT_REACH: u32 = 1 << 20;

#[derive(Clone, Debug)]
pub struct SimConfig {
    pub nodes: usize,
    /// Links per node, at most [`MAX_INTERFACES`].
    pub degree: usize,
    pub seed: u64,
    /// Share of nodes that never answer, between 0 and 1.
    pub silent_fraction: f64,
    pub min_latency: Duration,
    pub max_latency: Duration,
    pub protocol_version: u32,
    pub search_timeout: Duration,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            nodes: 64,
            degree: 4,
            seed: 0,
            silent_fraction: 0.0,
            min_latency: Duration::from_millis(20),
            max_latency: Duration::from_millis(200),
            protocol_version: 20,
            search_timeout: Duration::from_secs(1),
        }
    }
}

#[derive(Debug)]
struct SimNode {
    address: Address,
    /// Indexed by interface number.
    links: Vec<usize>,
    /// Every reachable node with its path from here.
    view: HashMap<usize, u64>,
    latency: Duration,
    silent: bool,
}

#[derive(Debug)]
pub struct SimMesh {
    nodes: Vec<SimNode>,
    by_ip6: HashMap<Ip6, usize>,
    search_timeout: Duration,
}

/// Path of a single hop out of interface `iface`.
pub fn hop_label(iface: usize) -> u64 {
    (1 << HOP_BITS) | ((iface as u64) << 1) | 1
}

fn hop_count(path: u64) -> u32 {
    log2(path) / HOP_BITS
}

fn valid_key(rng: &mut StdRng) -> [u8; KEY_SIZE] {
    loop {
        let mut key = [0u8; KEY_SIZE];
        rng.fill(&mut key);
        if is_valid_ip6(&derive_ip6(&key)) {
            return key;
        }
    }
}

impl SimMesh {
    pub fn build(config: &SimConfig) -> Result<Self> {
        if config.nodes < 2 {
            bail!("a mesh needs at least 2 nodes");
        }
        if config.degree < 2 || config.degree > MAX_INTERFACES {
            bail!("degree must be between 2 and {MAX_INTERFACES}");
        }
        if config.min_latency > config.max_latency {
            bail!("min_latency exceeds max_latency");
        }
        if !(0.0..=1.0).contains(&config.silent_fraction) {
            bail!("silent_fraction must be between 0 and 1");
        }

        let mut rng = StdRng::seed_from_u64(config.seed);
        let mut nodes: Vec<SimNode> = (0..config.nodes)
            .map(|_| {
                let key = valid_key(&mut rng);
                let latency_ms = rng.gen_range(
                    config.min_latency.as_millis() as u64..=config.max_latency.as_millis() as u64,
                );
                SimNode {
                    address: Address::new(key, SELF_ROUTE, config.protocol_version),
                    links: Vec::new(),
                    view: HashMap::new(),
                    latency: Duration::from_millis(latency_ms),
                    silent: rng.gen_bool(config.silent_fraction),
                }
            })
            .collect();

        // A ring keeps the mesh connected; random chords fill up the degree.
        let count = nodes.len();
        for a in 0..count {
            link(&mut nodes, a, (a + 1) % count, config.degree);
        }
        let attempts = count * config.degree * 4;
        for _ in 0..attempts {
            let a = rng.gen_range(0..count);
            let b = rng.gen_range(0..count);
            link(&mut nodes, a, b, config.degree);
        }

        for origin in 0..count {
            let view = compute_view(&nodes, origin);
            nodes[origin].view = view;
        }

        let by_ip6 = nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.address.ip6, i))
            .collect();

        debug!(
            nodes = count,
            degree = config.degree,
            silent = nodes.iter().filter(|n| n.silent).count(),
            "built simulated mesh"
        );
        Ok(Self {
            nodes,
            by_ip6,
            search_timeout: config.search_timeout,
        })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The address of node `index` as it knows itself.
    pub fn address(&self, index: usize) -> Option<Address> {
        self.nodes.get(index).map(|n| n.address)
    }

    pub fn index_of(&self, ip6: &Ip6) -> Option<usize> {
        self.by_ip6.get(ip6).copied()
    }

    /// Follow `path` hop by hop starting at `origin`.
    pub fn resolve(&self, origin: usize, path: u64) -> Option<usize> {
        if path == UNROUTABLE || path == 0 {
            return None;
        }
        let mut at = origin;
        let mut rest = path;
        while rest != SELF_ROUTE {
            let hop = rest & ((1 << HOP_BITS) - 1);
            if hop & 1 == 0 || rest < (1 << HOP_BITS) {
                return None;
            }
            let iface = (hop >> 1) as usize;
            at = *self.nodes.get(at)?.links.get(iface)?;
            rest >>= HOP_BITS;
        }
        Some(at)
    }

    /// Routing table records `origin` would start with: every node at most
    /// `max_hops` away, reach falling with distance.
    pub fn local_view(&self, origin: usize, max_hops: u32) -> Vec<Node> {
        let Some(node) = self.nodes.get(origin) else {
            return Vec::new();
        };
        node.view
            .iter()
            .filter(|(_, path)| hop_count(**path) <= max_hops)
            .map(|(&index, &path)| {
                let address = Address {
                    path,
                    ..self.nodes[index].address
                };
                Node::new(address, DIRECT_REACH / hop_count(path).max(1))
            })
            .collect()
    }

    /// Ping a rumored node from `origin`: the path must lead to a live node
    /// holding the rumored key.
    pub fn verify(&self, origin: usize, rumor: &Address) -> Option<Node> {
        let index = self.resolve(origin, rumor.path)?;
        let node = &self.nodes[index];
        if node.silent || node.address.key != rumor.key {
            trace!(node = %rumor, "rumor did not check out");
            return None;
        }
        let address = Address {
            path: rumor.path,
            ..node.address
        };
        Some(Node::new(address, DIRECT_REACH / hop_count(rumor.path).max(1)))
    }

    /// The message layer as seen from node `origin`.
    pub fn router(self: &Arc<Self>, origin: usize) -> SimRouter {
        SimRouter {
            mesh: Arc::clone(self),
            origin,
        }
    }

    fn answer(&self, responder: usize, target: &Ip6) -> NodesReply {
        let node = &self.nodes[responder];
        let mut known: Vec<Address> = node
            .view
            .iter()
            .map(|(&index, &path)| Address {
                path,
                ..self.nodes[index].address
            })
            .collect();
        known.sort_by(|a, b| xor_distance(&a.ip6, target).cmp(&xor_distance(&b.ip6, target)));
        known.truncate(REPLY_SIZE);
        NodesReply::from_addresses(&known)
    }
}

fn link(nodes: &mut [SimNode], a: usize, b: usize, degree: usize) {
    if a == b
        || nodes[a].links.len() >= degree
        || nodes[b].links.len() >= degree
        || nodes[a].links.contains(&b)
    {
        return;
    }
    nodes[a].links.push(b);
    nodes[b].links.push(a);
}

/// Breadth-first shortest paths from `origin` to everything reachable
/// within a representable label.
fn compute_view(nodes: &[SimNode], origin: usize) -> HashMap<usize, u64> {
    let mut view = HashMap::new();
    let mut paths: HashMap<usize, u64> = HashMap::from([(origin, SELF_ROUTE)]);
    let mut queue = VecDeque::from([origin]);

    while let Some(at) = queue.pop_front() {
        let via = paths[&at];
        for (iface, &next) in nodes[at].links.iter().enumerate() {
            if paths.contains_key(&next) {
                continue;
            }
            let path = splice(hop_label(iface), via);
            if path == UNROUTABLE {
                continue;
            }
            paths.insert(next, path);
            view.insert(next, path);
            queue.push_back(next);
        }
    }
    view
}

// ─────────────────────────────────────────────────────────────────────────────
// Router
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct SimRouter {
    mesh: Arc<SimMesh>,
    origin: usize,
}

impl SimRouter {
    pub fn origin(&self) -> usize {
        self.origin
    }

    pub fn mesh(&self) -> &Arc<SimMesh> {
        &self.mesh
    }
}

#[async_trait]
impl RouterModule for SimRouter {
    async fn find_node(&self, to: &Address, query: FindNodeQuery) -> Result<NodesReply> {
        let index = self
            .mesh
            .resolve(self.origin, to.path)
            .ok_or_else(|| anyhow!("no route to {to}"))?;
        let node = &self.mesh.nodes[index];
        if node.address.ip6 != to.ip6 {
            bail!("path {to} leads to a different node");
        }
        if node.silent {
            std::future::pending::<()>().await;
        }
        tokio::time::sleep(node.latency).await;
        Ok(self.mesh.answer(index, &query.target))
    }

    fn search_timeout(&self) -> Duration {
        self.mesh.search_timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::routes_through;

    fn mesh(nodes: usize) -> Arc<SimMesh> {
        let config = SimConfig {
            nodes,
            seed: 7,
            ..SimConfig::default()
        };
        Arc::new(SimMesh::build(&config).unwrap())
    }

    #[test]
    fn every_node_sees_every_other() {
        let mesh = mesh(24);
        for origin in 0..mesh.len() {
            assert_eq!(mesh.nodes[origin].view.len(), mesh.len() - 1);
        }
    }

    #[test]
    fn view_paths_resolve_to_their_node() {
        let mesh = mesh(24);
        for origin in 0..mesh.len() {
            for (&index, &path) in &mesh.nodes[origin].view {
                assert_eq!(mesh.resolve(origin, path), Some(index));
            }
        }
    }

    #[test]
    fn spliced_paths_resolve_through_the_middle_node() {
        let mesh = mesh(24);
        let origin = 0;
        let (&mid, &to_mid) = mesh.nodes[origin].view.iter().next().unwrap();
        for (&far, &mid_to_far) in &mesh.nodes[mid].view {
            let path = splice(mid_to_far, to_mid);
            if path == UNROUTABLE {
                continue;
            }
            assert!(routes_through(path, to_mid));
            assert_eq!(mesh.resolve(origin, path), Some(far));
        }
    }

    #[test]
    fn local_view_limits_hops() {
        let mesh = mesh(24);
        let direct = mesh.local_view(0, 1);
        assert_eq!(direct.len(), mesh.nodes[0].links.len());
        assert!(direct.iter().all(|n| n.reach == DIRECT_REACH));
    }

    #[test]
    fn verify_rejects_wrong_key() {
        let mesh = mesh(8);
        let neighbor = mesh.local_view(0, 1)[0].address;
        assert!(mesh.verify(0, &neighbor).is_some());

        let imposter = Address {
            key: [9; 32],
            ..neighbor
        };
        assert!(mesh.verify(0, &imposter).is_none());
    }

    #[test]
    fn build_rejects_bad_degree() {
        let config = SimConfig {
            degree: MAX_INTERFACES + 1,
            ..SimConfig::default()
        };
        assert!(SimMesh::build(&config).is_err());
    }

    #[test]
    fn build_rejects_silent_fraction_outside_unit_range() {
        for silent_fraction in [f64::NAN, -0.1, 1.5] {
            let config = SimConfig {
                silent_fraction,
                ..SimConfig::default()
            };
            assert!(SimMesh::build(&config).is_err(), "{silent_fraction}");
        }
        let all_silent = SimConfig {
            silent_fraction: 1.0,
            ..SimConfig::default()
        };
        assert!(SimMesh::build(&all_silent).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn router_answers_from_responder_view() {
        let mesh = mesh(24);
        let router = mesh.router(0);
        let neighbor = mesh.local_view(0, 1)[0].address;
        let target = mesh.address(12).unwrap().ip6;

        let reply = router
            .find_node(&neighbor, FindNodeQuery::new(target))
            .await
            .unwrap();
        assert_eq!(reply.node_count(), REPLY_SIZE);

        let wrong = Address {
            ip6: [0xfc; 16],
            ..neighbor
        };
        assert!(router.find_node(&wrong, FindNodeQuery::new(target)).await.is_err());
    }
}
