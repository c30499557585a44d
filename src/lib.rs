//! # Mesh DHT
//!
//! Iterative Kademlia-style searches for a mesh network where nodes are
//! reached by switch labels rather than IP routes. A search asks one node at
//! a time for the nodes it knows closest to a target, splices the returned
//! paths onto the responder's path, and walks toward the target until its
//! request budget is spent or it runs out of candidates.
//!
//! - [`address`]: identifiers derived from keys, label splicing, XOR distance.
//! - [`protocol`]: find-node messages, the version list codec and the
//!   [`RouterModule`] seam to the message layer.
//! - [`store`]: the collaborator traits a search reads and writes, with
//!   in-memory implementations.
//! - [`search`]: per-search state, progress events and reply processing.
//! - [`runner`]: the [`SearchRunner`] actor that admits and drives searches.
//! - [`config`]: [`SearchRunnerConfig`].
//! - [`sim`]: a simulated mesh for tests and the demo binary.
//!
//! ## Getting started
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use mesh_dht::sim::{SimConfig, SimMesh};
//! use mesh_dht::{MemoryNodeStore, MemoryRumorMill, MemorySearchStore};
//! use mesh_dht::{SearchRunner, SearchRunnerConfig};
//! use tokio::sync::Mutex;
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let mesh = Arc::new(SimMesh::build(&SimConfig::default())?);
//! let me = mesh.address(0).expect("node 0");
//!
//! let mut table = MemoryNodeStore::new();
//! for node in mesh.local_view(0, 2) {
//!     table.insert(node);
//! }
//!
//! let runner = SearchRunner::new(
//!     SearchRunnerConfig::default(),
//!     me.ip6,
//!     MemorySearchStore::new(),
//!     Arc::new(Mutex::new(table)),
//!     Arc::new(Mutex::new(MemoryRumorMill::default())),
//!     Arc::new(mesh.router(0)),
//! );
//!
//! let target = mesh.address(42).expect("node 42").ip6;
//! if let Some(search) = runner.search(target).await {
//!     let summary = search.wait().await;
//!     println!("{} nodes answered", summary.responders.len());
//! }
//! # Ok(())
//! # }
//! ```

pub mod address;
pub mod config;
pub mod error;
pub mod protocol;
pub mod runner;
pub mod search;
pub mod sim;
pub mod store;

pub use address::{Address, Ip6};
pub use config::{AdmissionPolicy, SearchRunnerConfig};
pub use error::{AddressError, ReplyError};
pub use protocol::{FindNodeQuery, NodesReply, RouterModule, VersionList};
pub use runner::{SearchData, SearchRunner};
pub use search::{
    process_reply, Collaborators, ReplyOutcome, SearchEvent, SearchHandle, SearchId,
    SearchProgress, SearchSummary, MAX_REQUESTS_PER_SEARCH,
};
pub use store::{
    MemoryNodeStore, MemoryRumorMill, MemorySearchStore, Node, NodeStore, RumorMill, SearchStore,
    SearchStoreId,
};
