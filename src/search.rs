//! Per-search state and find-node reply processing.
//!
//! A search walks toward its target one request at a time. Every reply is
//! mined for nodes: anything the routing table does not already know goes to
//! the rumor mill, and anything strictly closer to the target than both the
//! local node and the responder becomes a candidate for the next request,
//! provided the reply came from the node most recently asked.

use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::address::{
    closest, format_path, splice, Address, Ip6, ADDRESS_SERIALIZED_SIZE, KEY_SIZE,
};
use crate::error::ReplyError;
use crate::protocol::{NodesReply, VersionList};
use crate::store::{NodeStore, RumorMill, SearchStore, SearchStoreId};

/// Hard budget of find-node requests a single search may send.
pub const MAX_REQUESTS_PER_SEARCH: u32 = 8;

/// Responders older than this report unreliable versions for other nodes.
const MIN_TRUSTED_REPORTER_VERSION: u32 = 2;

/// Stable key of a search in the runner's registry.
///
/// Ids grow monotonically, so ordering by id is ordering by age.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SearchId(u64);

impl SearchId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

/// The part of a search that reply processing reads.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SearchProgress {
    /// Only the identifier is meaningful.
    pub target: Address,
    pub store_id: SearchStoreId,
    pub total_requests: u32,
    pub last_node_asked: Option<Address>,
}

impl SearchProgress {
    pub fn new(target: Ip6, store_id: SearchStoreId) -> Self {
        Self {
            target: Address::from_target(target),
            store_id,
            total_requests: 0,
            last_node_asked: None,
        }
    }

    /// Whether a reply from `from` answers the most recent request.
    pub fn is_fresh(&self, from: &Address) -> bool {
        self.last_node_asked.is_some_and(|asked| asked.path == from.path)
    }

    pub fn budget_spent(&self) -> bool {
        self.total_requests >= MAX_REQUESTS_PER_SEARCH
    }
}

// ============================================================================
// Events
// ============================================================================

/// Progress of a search as seen by whoever started it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SearchEvent {
    /// A queried node answered. `reply` is the raw payload.
    Reply {
        from: Address,
        lag: Duration,
        reply: NodesReply,
    },
    /// A queried node never answered within the request timeout.
    NoReply { to: Address, lag: Duration },
    /// The search is over. Sent exactly once.
    Exhausted { total_requests: u32 },
}

/// Receiving side of a running search.
#[derive(Debug)]
pub struct SearchHandle {
    id: SearchId,
    target: Ip6,
    events: mpsc::UnboundedReceiver<SearchEvent>,
}

/// What a finished search amounted to.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SearchSummary {
    /// Nodes that answered, in arrival order.
    pub responders: Vec<Address>,
    /// Nodes that stayed silent.
    pub silent: Vec<Address>,
    pub total_requests: u32,
    /// False when the runner stopped before the search finished.
    pub completed: bool,
}

impl SearchHandle {
    pub(crate) fn new(
        id: SearchId,
        target: Ip6,
        events: mpsc::UnboundedReceiver<SearchEvent>,
    ) -> Self {
        Self { id, target, events }
    }

    pub fn id(&self) -> SearchId {
        self.id
    }

    pub fn target(&self) -> Ip6 {
        self.target
    }

    /// Next progress event, or `None` once the search is gone.
    pub async fn next_event(&mut self) -> Option<SearchEvent> {
        self.events.recv().await
    }

    /// Drain events until the search finishes.
    pub async fn wait(mut self) -> SearchSummary {
        let mut summary = SearchSummary::default();
        while let Some(event) = self.events.recv().await {
            match event {
                SearchEvent::Reply { from, .. } => summary.responders.push(from),
                SearchEvent::NoReply { to, .. } => summary.silent.push(to),
                SearchEvent::Exhausted { total_requests } => {
                    summary.total_requests = total_requests;
                    summary.completed = true;
                    break;
                }
            }
        }
        summary
    }
}

// ============================================================================
// Reply Processing
// ============================================================================

/// Tally of what happened to the entries of one reply.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReplyOutcome {
    /// Entries skipped because a later entry carries the same key.
    pub duplicates: usize,
    /// Entries whose path could not be spliced onto the responder's.
    pub unspliceable: usize,
    /// Entries that routed back to the local node.
    pub loops: usize,
    /// Entries handed to the rumor mill.
    pub rumors: usize,
    /// Entries added to the search's candidates.
    pub candidates: usize,
    /// Closer entries ignored because the reply was late.
    pub stale: usize,
    /// An entry outside the address range cut the reply short.
    pub aborted: bool,
}

/// The collaborators a reply writes into.
pub struct Collaborators<'a, S: ?Sized, N: ?Sized, M: ?Sized> {
    pub search_store: &'a mut S,
    pub node_store: &'a mut N,
    pub rumor_mill: &'a mut M,
}

/// Whether the entry at `index` shares its key with any later entry.
fn is_duplicate_entry(nodes: &[u8], index: usize) -> bool {
    let start = index * ADDRESS_SERIALIZED_SIZE;
    let key = &nodes[start..start + KEY_SIZE];
    nodes[start + ADDRESS_SERIALIZED_SIZE..]
        .chunks_exact(ADDRESS_SERIALIZED_SIZE)
        .any(|later| &later[..KEY_SIZE] == key)
}

fn versions_for(reply: &NodesReply, from: &Address) -> Result<(usize, VersionList), ReplyError> {
    let nodes = reply.nodes.as_deref().ok_or(ReplyError::MissingNodes)?;
    if nodes.is_empty() || nodes.len() % ADDRESS_SERIALIZED_SIZE != 0 {
        return Err(ReplyError::BadNodesLength(nodes.len()));
    }
    let raw = reply
        .node_protocols
        .as_deref()
        .ok_or(ReplyError::MissingVersions)?;
    let mut versions = VersionList::parse(raw)?;
    if from.protocol_version < MIN_TRUSTED_REPORTER_VERSION {
        versions.versions.iter_mut().for_each(|v| *v = 1);
    }

    let count = nodes.len() / ADDRESS_SERIALIZED_SIZE;
    if versions.len() != count {
        return Err(ReplyError::VersionCountMismatch {
            versions: versions.len(),
            nodes: count,
        });
    }
    Ok((count, versions))
}

/// Fold a find-node reply from `from` into a search.
///
/// A malformed reply is rejected before any collaborator is touched. After
/// that, entries are handled in order and each keeps its effects even when
/// a later entry aborts the rest of the reply.
pub fn process_reply<S, N, M>(
    progress: &SearchProgress,
    me: &Address,
    from: &Address,
    reply: &NodesReply,
    mut sinks: Collaborators<'_, S, N, M>,
) -> Result<ReplyOutcome, ReplyError>
where
    S: SearchStore + ?Sized,
    N: NodeStore + ?Sized,
    M: RumorMill + ?Sized,
{
    let (count, versions) = versions_for(reply, from)?;
    let nodes = reply.nodes.as_deref().unwrap_or_default();
    let fresh = progress.is_fresh(from);
    let target = &progress.target;
    let mut outcome = ReplyOutcome::default();

    for index in 0..count {
        if is_duplicate_entry(nodes, index) {
            outcome.duplicates += 1;
            continue;
        }

        let start = index * ADDRESS_SERIALIZED_SIZE;
        let Ok(mut addr) = Address::parse(&nodes[start..start + ADDRESS_SERIALIZED_SIZE]) else {
            outcome.aborted = true;
            break;
        };
        addr.protocol_version = versions.versions[index];
        addr.path = splice(addr.path, from.path);

        if !addr.is_routable() {
            trace!(node = %addr.short_id(), "dropping node, route could not be spliced");
            outcome.unspliceable += 1;
            continue;
        }

        trace!(node = %addr, "discovered node");

        if addr.ip6 == me.ip6 {
            debug!(path = %format_path(addr.path), "loop route through self");
            sinks.node_store.broken_path(addr.path);
            outcome.loops += 1;
            continue;
        }

        if !addr.is_valid() {
            debug!(from = %from, index, "reply carries an address outside the mesh range");
            outcome.aborted = true;
            break;
        }

        let known = sinks
            .node_store
            .node_for_path(addr.path)
            .is_some_and(|n| n.address.key == addr.key);
        if !known {
            sinks.rumor_mill.add_node(&addr);
            outcome.rumors += 1;
        }

        if closest(target, &addr, me).is_ge() || closest(target, &addr, from).is_ge() {
            continue;
        }

        if !fresh {
            outcome.stale += 1;
            continue;
        }

        let candidate = sinks
            .node_store
            .best_known(&addr)
            .map(|n| n.address)
            .unwrap_or(addr);
        sinks.search_store.add_node(progress.store_id, &candidate);
        outcome.candidates += 1;
    }

    Ok(outcome)
}
