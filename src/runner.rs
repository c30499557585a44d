//! The search runner: admission, the step loop and per-search timers.
//!
//! [`SearchRunner`] is a cheap cloneable handle. All state lives in an actor
//! task that processes one [`Command`] at a time; timers and outbound
//! requests are separate tasks that only post commands back to it, so a
//! search is never touched from two places at once. Those tasks hold weak
//! senders: once every handle is dropped the actor stops, as on `quit`.
//!
//! ```text
//!   search(target) ──► admit ──► zero-delay timer
//!                                     │
//!          ┌──────────────────────────┘
//!          ▼
//!        step ──► find_node task ──► Reply ──► process_reply ──► step
//!          │   └► re-arm timer ───► Timeout ─────────────────────► step
//!          ▼
//!       finish (budget spent or no candidates left): Exhausted
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::address::{format_ip6, Address, Ip6};
use crate::config::SearchRunnerConfig;
use crate::protocol::{FindNodeQuery, NodesReply, RouterModule};
use crate::search::{
    process_reply, Collaborators, SearchEvent, SearchHandle, SearchId, SearchProgress,
};
use crate::store::{NodeStore, RumorMill, SearchStore};

/// Commands buffered between the handle, the timers and the actor.
const COMMAND_CHANNEL_CAPACITY: usize = 100;

/// Snapshot of one running search, for the admin surface.
///
/// An out-of-range index yields the default snapshot, which still carries
/// the active search count.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SearchData {
    pub target: Ip6,
    pub last_node_asked: Option<Address>,
    pub total_requests: u32,
    pub active_searches: usize,
}

// ============================================================================
// Handle
// ============================================================================

#[derive(Clone, Debug)]
pub struct SearchRunner {
    cmd_tx: mpsc::Sender<Command>,
}

impl SearchRunner {
    /// Spawn the runner actor. Must be called inside a tokio runtime.
    pub fn new<S, N, M, R>(
        config: SearchRunnerConfig,
        my_address: Ip6,
        search_store: S,
        node_store: Arc<Mutex<N>>,
        rumor_mill: Arc<Mutex<M>>,
        router: Arc<R>,
    ) -> Self
    where
        S: SearchStore,
        N: NodeStore,
        M: RumorMill,
        R: RouterModule,
    {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let actor = SearchRunnerActor {
            config,
            me: Address::from_target(my_address),
            search_store,
            node_store,
            rumor_mill,
            router,
            searches: BTreeMap::new(),
            next_id: 0,
            cmd_rx,
            cmd_tx: cmd_tx.downgrade(),
        };
        tokio::spawn(actor.run());
        Self { cmd_tx }
    }

    /// Start a search for `target`.
    ///
    /// Returns `None` when too many searches are running, when the routing
    /// table has nothing to start from, or when the runner has quit.
    pub async fn search(&self, target: Ip6) -> Option<SearchHandle> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Search(target, tx)).await.is_err() {
            return None;
        }
        rx.await.ok().flatten()
    }

    /// Snapshot of the `index`th running search, newest first.
    pub async fn show_active_search(&self, index: usize) -> SearchData {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::ShowActiveSearch(index, tx))
            .await
            .is_err()
        {
            return SearchData::default();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn active_searches(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::ActiveSearches(tx)).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Stop the runner. Running searches are dropped without an
    /// [`SearchEvent::Exhausted`] notification.
    ///
    /// Dropping the last handle has the same effect.
    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(Command::Quit).await;
    }
}

// ============================================================================
// Actor
// ============================================================================

enum Command {
    Search(Ip6, oneshot::Sender<Option<SearchHandle>>),
    Timeout {
        id: SearchId,
        generation: u64,
    },
    Reply {
        id: SearchId,
        to: Address,
        lag: Duration,
        result: Result<NodesReply>,
    },
    ShowActiveSearch(usize, oneshot::Sender<SearchData>),
    ActiveSearches(oneshot::Sender<usize>),
    Quit,
}

/// A running search and the timer that keeps it moving.
struct Search {
    id: SearchId,
    progress: SearchProgress,
    timer: Option<JoinHandle<()>>,
    /// Bumped on every re-arm; a timeout from an older generation is ignored.
    timer_generation: u64,
    events: mpsc::UnboundedSender<SearchEvent>,
}

impl Search {
    fn arm_timer(&mut self, delay: Duration, cmd_tx: &mpsc::WeakSender<Command>) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        self.timer_generation += 1;
        let id = self.id;
        let generation = self.timer_generation;
        let cmd_tx = cmd_tx.clone();
        self.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(cmd_tx) = cmd_tx.upgrade() {
                let _ = cmd_tx.send(Command::Timeout { id, generation }).await;
            }
        }));
    }

    fn notify(&self, event: SearchEvent) {
        // The caller may have dropped its handle.
        let _ = self.events.send(event);
    }
}

impl Drop for Search {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

struct SearchRunnerActor<S, N, M, R> {
    config: SearchRunnerConfig,
    me: Address,
    search_store: S,
    node_store: Arc<Mutex<N>>,
    rumor_mill: Arc<Mutex<M>>,
    router: Arc<R>,
    /// Keyed by ascending id, so reverse iteration is newest first.
    searches: BTreeMap<SearchId, Search>,
    next_id: u64,
    cmd_rx: mpsc::Receiver<Command>,
    /// Weak, so the actor alone never keeps its own channel open.
    cmd_tx: mpsc::WeakSender<Command>,
}

impl<S, N, M, R> SearchRunnerActor<S, N, M, R>
where
    S: SearchStore,
    N: NodeStore,
    M: RumorMill,
    R: RouterModule,
{
    async fn run(mut self) {
        while let Some(cmd) = self.cmd_rx.recv().await {
            match cmd {
                Command::Search(target, reply) => {
                    let handle = self.admit(target).await;
                    let _ = reply.send(handle);
                }
                Command::Timeout { id, generation } => {
                    self.on_timeout(id, generation).await;
                }
                Command::Reply {
                    id,
                    to,
                    lag,
                    result,
                } => {
                    self.on_reply(id, to, lag, result).await;
                }
                Command::ShowActiveSearch(index, reply) => {
                    let _ = reply.send(self.snapshot(index));
                }
                Command::ActiveSearches(reply) => {
                    let _ = reply.send(self.searches.len());
                }
                Command::Quit => break,
            }
        }
        debug!(active = self.searches.len(), "search runner stopped");
    }

    async fn admit(&mut self, target: Ip6) -> Option<SearchHandle> {
        let active = self.searches.len();
        let max = self.config.max_concurrent_searches;
        if self.config.admission.rejects(active, max) {
            debug!(active, max, "skipping search, too many searches active");
            return None;
        }

        let seeds = {
            let node_store = self.node_store.lock().await;
            node_store.closest_nodes(
                &Address::from_target(target),
                self.config.initial_candidates,
                self.config.min_protocol_version,
            )
        };
        if seeds.is_empty() {
            debug!(target = %format_ip6(&target), "no nodes available for beginning search");
            return None;
        }

        let store_id = self.search_store.new_search(target);
        for seed in &seeds {
            self.search_store.add_node(store_id, &seed.address);
        }

        let id = SearchId::new(self.next_id);
        self.next_id += 1;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mut search = Search {
            id,
            progress: SearchProgress::new(target, store_id),
            timer: None,
            timer_generation: 0,
            events: events_tx,
        };
        // First step runs from the timer, never inside admission.
        search.arm_timer(Duration::ZERO, &self.cmd_tx);
        self.searches.insert(id, search);

        debug!(
            target = %format_ip6(&target),
            seeds = seeds.len(),
            active = self.searches.len(),
            "beginning search"
        );
        Some(SearchHandle::new(id, target, events_rx))
    }

    async fn on_timeout(&mut self, id: SearchId, generation: u64) {
        let Some(search) = self.searches.get_mut(&id) else {
            return;
        };
        if search.timer_generation != generation {
            return;
        }
        search.arm_timer(self.router.search_timeout(), &self.cmd_tx);
        self.step(id).await;
    }

    async fn on_reply(
        &mut self,
        id: SearchId,
        to: Address,
        lag: Duration,
        result: Result<NodesReply>,
    ) {
        let Some(progress) = self.searches.get(&id).map(|s| s.progress) else {
            trace!(search = id.get(), from = %to, "reply for a finished search");
            return;
        };

        let event = match result {
            Ok(reply) => {
                let processed = {
                    let mut node_store = self.node_store.lock().await;
                    let mut rumor_mill = self.rumor_mill.lock().await;
                    process_reply(
                        &progress,
                        &self.me,
                        &to,
                        &reply,
                        Collaborators {
                            search_store: &mut self.search_store,
                            node_store: &mut *node_store,
                            rumor_mill: &mut *rumor_mill,
                        },
                    )
                };
                match processed {
                    Ok(outcome) => {
                        trace!(search = id.get(), from = %to, ?outcome, "reply processed")
                    }
                    Err(err) => debug!(search = id.get(), from = %to, "dropping reply: {err}"),
                }
                SearchEvent::Reply {
                    from: to,
                    lag,
                    reply,
                }
            }
            Err(err) => {
                debug!(search = id.get(), to = %to, "no reply: {err:?}");
                SearchEvent::NoReply { to, lag }
            }
        };

        if let Some(search) = self.searches.get(&id) {
            search.notify(event);
        }
        self.step(id).await;
    }

    /// Send the next request of a search, or finish it.
    async fn step(&mut self, id: SearchId) {
        let node = loop {
            let Some(search) = self.searches.get(&id) else {
                return;
            };
            let budget_spent = search.progress.budget_spent();
            let store_id = search.progress.store_id;

            let candidate = match self.search_store.next_node(store_id) {
                Some(candidate) if !budget_spent => candidate,
                _ => {
                    self.finish(id);
                    return;
                }
            };

            let best = self.node_store.lock().await.best_known(&candidate);
            match best {
                Some(node) if node.address.ip6 == candidate.ip6 => break node.address,
                _ => trace!(node = %candidate, "candidate unknown to the routing table"),
            }
        };

        let Some(search) = self.searches.get_mut(&id) else {
            return;
        };
        search.progress.last_node_asked = Some(node);
        search.progress.total_requests += 1;

        let query = FindNodeQuery::new(search.progress.target.ip6);
        let router = Arc::clone(&self.router);
        let cmd_tx = self.cmd_tx.clone();
        let request_timeout = self.config.request_timeout();
        tokio::spawn(async move {
            let start = Instant::now();
            let result = match tokio::time::timeout(request_timeout, router.find_node(&node, query))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(anyhow!("no reply within {request_timeout:?}")),
            };
            let Some(cmd_tx) = cmd_tx.upgrade() else {
                return;
            };
            let _ = cmd_tx
                .send(Command::Reply {
                    id,
                    to: node,
                    lag: start.elapsed(),
                    result,
                })
                .await;
        });

        debug!(
            search = id.get(),
            to = %node,
            requests = search.progress.total_requests,
            "asking node"
        );
        search.arm_timer(self.router.search_timeout(), &self.cmd_tx);
    }

    /// Remove a search, release its candidates and tell the caller it is over.
    fn finish(&mut self, id: SearchId) {
        let Some(search) = self.searches.remove(&id) else {
            return;
        };
        self.search_store.free_search(search.progress.store_id);
        let total_requests = search.progress.total_requests;
        search.notify(SearchEvent::Exhausted { total_requests });
        debug!(
            search = id.get(),
            target = %format_ip6(&search.progress.target.ip6),
            requests = total_requests,
            active = self.searches.len(),
            "search finished"
        );
    }

    fn snapshot(&self, index: usize) -> SearchData {
        let active_searches = self.searches.len();
        match self.searches.values().rev().nth(index) {
            Some(search) => SearchData {
                target: search.progress.target.ip6,
                last_node_asked: search.progress.last_node_asked,
                total_requests: search.progress.total_requests,
                active_searches,
            },
            None => SearchData {
                active_searches,
                ..SearchData::default()
            },
        }
    }
}
