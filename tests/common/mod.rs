#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use tokio::sync::Mutex;
use tokio::time::{sleep, Duration};

use mesh_dht::address::{closest, derive_ip6, is_valid_ip6, Address, Ip6, SELF_ROUTE};
use mesh_dht::{
    FindNodeQuery, MemoryNodeStore, MemoryRumorMill, MemorySearchStore, Node, NodesReply,
    RouterModule, SearchRunner, SearchRunnerConfig, SearchStore, SearchStoreId,
};

/// Message layer driven by a script: per-node replies, latencies and silence.
/// Nodes without a scripted reply fail immediately.
#[derive(Clone)]
pub struct ScriptedRouter {
    replies: Arc<Mutex<HashMap<Ip6, NodesReply>>>,
    latencies: Arc<Mutex<HashMap<Ip6, Duration>>>,
    silent: Arc<Mutex<HashSet<Ip6>>>,
    queries: Arc<Mutex<Vec<(Address, FindNodeQuery)>>>,
    search_timeout: Duration,
}

impl ScriptedRouter {
    pub fn new(search_timeout: Duration) -> Self {
        Self {
            replies: Arc::new(Mutex::new(HashMap::new())),
            latencies: Arc::new(Mutex::new(HashMap::new())),
            silent: Arc::new(Mutex::new(HashSet::new())),
            queries: Arc::new(Mutex::new(Vec::new())),
            search_timeout,
        }
    }

    pub async fn set_reply(&self, node: &Address, reply: NodesReply) {
        let mut replies = self.replies.lock().await;
        replies.insert(node.ip6, reply);
    }

    pub async fn set_latency(&self, node: &Address, latency: Duration) {
        let mut latencies = self.latencies.lock().await;
        latencies.insert(node.ip6, latency);
    }

    pub async fn set_silent(&self, node: &Address) {
        let mut silent = self.silent.lock().await;
        silent.insert(node.ip6);
    }

    /// Nodes asked so far, in order.
    pub async fn queried(&self) -> Vec<Address> {
        let queries = self.queries.lock().await;
        queries.iter().map(|(to, _)| *to).collect()
    }

    pub async fn queries(&self) -> Vec<(Address, FindNodeQuery)> {
        let queries = self.queries.lock().await;
        queries.clone()
    }
}

#[async_trait::async_trait]
impl RouterModule for ScriptedRouter {
    async fn find_node(&self, to: &Address, query: FindNodeQuery) -> Result<NodesReply> {
        {
            let mut queries = self.queries.lock().await;
            queries.push((*to, query));
        }
        if self.silent.lock().await.contains(&to.ip6) {
            futures::future::pending::<()>().await;
        }
        let latency = {
            let latencies = self.latencies.lock().await;
            latencies.get(&to.ip6).copied()
        };
        if let Some(delay) = latency {
            sleep(delay).await;
        }
        let replies = self.replies.lock().await;
        replies
            .get(&to.ip6)
            .cloned()
            .ok_or_else(|| anyhow!("injected network failure"))
    }

    fn search_timeout(&self) -> Duration {
        self.search_timeout
    }
}

/// Search store that records what it is asked to do.
#[derive(Clone, Default)]
pub struct RecordingSearchStore {
    inner: Arc<std::sync::Mutex<MemorySearchStore>>,
    opened: Arc<std::sync::Mutex<Vec<Ip6>>>,
    added: Arc<std::sync::Mutex<Vec<Address>>>,
}

impl RecordingSearchStore {
    pub fn opened(&self) -> Vec<Ip6> {
        self.opened.lock().unwrap().clone()
    }

    pub fn added(&self) -> Vec<Address> {
        self.added.lock().unwrap().clone()
    }

    pub fn open_slots(&self) -> usize {
        self.inner.lock().unwrap().len()
    }
}

impl SearchStore for RecordingSearchStore {
    fn new_search(&mut self, target: Ip6) -> SearchStoreId {
        self.opened.lock().unwrap().push(target);
        self.inner.lock().unwrap().new_search(target)
    }

    fn add_node(&mut self, search: SearchStoreId, address: &Address) {
        self.added.lock().unwrap().push(*address);
        self.inner.lock().unwrap().add_node(search, address);
    }

    fn next_node(&mut self, search: SearchStoreId) -> Option<Address> {
        self.inner.lock().unwrap().next_node(search)
    }

    fn free_search(&mut self, search: SearchStoreId) {
        self.inner.lock().unwrap().free_search(search);
    }

    fn pending(&self, search: SearchStoreId) -> Vec<Address> {
        self.inner.lock().unwrap().pending(search)
    }
}

/// A runner wired to scripted collaborators, with handles kept for asserts.
pub struct Harness {
    pub runner: SearchRunner,
    pub router: ScriptedRouter,
    pub search_store: RecordingSearchStore,
    pub node_store: Arc<Mutex<MemoryNodeStore>>,
    pub rumor_mill: Arc<Mutex<MemoryRumorMill>>,
    pub me: Address,
}

impl Harness {
    pub fn new(config: SearchRunnerConfig, me: Address, seeds: &[Node]) -> Self {
        Self::with_timeout(config, me, seeds, Duration::from_secs(1))
    }

    pub fn with_timeout(
        config: SearchRunnerConfig,
        me: Address,
        seeds: &[Node],
        search_timeout: Duration,
    ) -> Self {
        let mut table = MemoryNodeStore::new();
        for seed in seeds {
            table.insert(*seed);
        }
        let router = ScriptedRouter::new(search_timeout);
        let search_store = RecordingSearchStore::default();
        let node_store = Arc::new(Mutex::new(table));
        let rumor_mill = Arc::new(Mutex::new(MemoryRumorMill::default()));
        let runner = SearchRunner::new(
            config,
            me.ip6,
            search_store.clone(),
            node_store.clone(),
            rumor_mill.clone(),
            Arc::new(router.clone()),
        );
        Self {
            runner,
            router,
            search_store,
            node_store,
            rumor_mill,
            me,
        }
    }

    pub async fn rumors(&self) -> Vec<Address> {
        let mut mill = self.rumor_mill.lock().await;
        std::iter::from_fn(|| mill.get_node()).collect()
    }
}

/// The first `n` keys, counting up from zero, whose identifiers are valid.
pub fn valid_keys(n: usize) -> Vec<[u8; 32]> {
    let mut out = Vec::with_capacity(n);
    let mut counter = 0u64;
    while out.len() < n {
        let mut key = [0u8; 32];
        key[..8].copy_from_slice(&counter.to_be_bytes());
        counter += 1;
        if is_valid_ip6(&derive_ip6(&key)) {
            out.push(key);
        }
    }
    out
}

pub fn invalid_key() -> [u8; 32] {
    let mut key = [0u8; 32];
    key[31] = 1;
    while is_valid_ip6(&derive_ip6(&key)) {
        key[30] = key[30].wrapping_add(1);
    }
    key
}

/// `n` valid addresses sorted by distance to the first one, which doubles as
/// the search target. Paths are one-hop labels `0x13`, `0x15`, ...
pub fn ranked_addresses(n: usize) -> (Ip6, Vec<Address>) {
    let mut addrs: Vec<Address> = valid_keys(n)
        .into_iter()
        .map(|key| Address::new(key, SELF_ROUTE, 2))
        .collect();
    let target = Address::from_target(addrs[0].ip6);
    addrs.sort_by(|a, b| closest(&target, a, b));
    for (i, addr) in addrs.iter_mut().enumerate() {
        addr.path = one_hop(i);
    }
    (target.ip6, addrs)
}

/// A distinct single-hop label per index.
pub fn one_hop(index: usize) -> u64 {
    (1 << 5) | (((index as u64) & 0xf) << 1) | 1
}

pub fn node(address: Address) -> Node {
    Node::new(address, 100)
}

pub fn at(address: Address, path: u64) -> Address {
    Address { path, ..address }
}
