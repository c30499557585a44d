use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::Mutex;
use tokio::time::Duration;
use tracing::{debug, info};
use tracing_subscriber::{fmt, EnvFilter};

use mesh_dht::address::format_ip6;
use mesh_dht::sim::{SimConfig, SimMesh};
use mesh_dht::{
    MemoryNodeStore, MemoryRumorMill, MemorySearchStore, SearchRunner, SearchRunnerConfig,
};

#[derive(Parser, Debug)]
#[command(name = "mesh-dht-sim")]
#[command(author, version, about = "Run DHT searches over a simulated mesh", long_about = None)]
struct Args {
    /// Nodes in the simulated mesh.
    #[arg(short, long, default_value = "128")]
    nodes: usize,

    /// Links per node.
    #[arg(short, long, default_value = "4")]
    degree: usize,

    /// Searches started at once from node 0.
    #[arg(short, long, default_value = "16")]
    searches: usize,

    #[arg(long, default_value = "1")]
    seed: u64,

    /// Share of nodes that never answer.
    #[arg(long, default_value = "0.1")]
    silent: f64,

    /// Hops of the mesh node 0 knows before searching.
    #[arg(long, default_value = "2")]
    known_hops: u32,

    /// JSON file with a search runner config.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    let config = match &args.config {
        Some(path) => SearchRunnerConfig::from_json_file(path)?,
        None => SearchRunnerConfig::default(),
    };

    let mesh = Arc::new(SimMesh::build(&SimConfig {
        nodes: args.nodes,
        degree: args.degree,
        seed: args.seed,
        silent_fraction: args.silent,
        ..SimConfig::default()
    })?);
    let me = mesh.address(0).context("mesh has no nodes")?;

    let mut table = MemoryNodeStore::new();
    for node in mesh.local_view(0, args.known_hops) {
        table.insert(node);
    }
    info!(
        me = %format_ip6(&me.ip6),
        known = table.len(),
        mesh = mesh.len(),
        "starting searches"
    );

    let node_store = Arc::new(Mutex::new(table));
    let rumor_mill = Arc::new(Mutex::new(MemoryRumorMill::default()));
    let runner = SearchRunner::new(
        config,
        me.ip6,
        MemorySearchStore::new(),
        node_store.clone(),
        rumor_mill.clone(),
        Arc::new(mesh.router(0)),
    );

    // Rumors are verified in the background and promoted into the table.
    let verifier = {
        let mesh = mesh.clone();
        let node_store = node_store.clone();
        let rumor_mill = rumor_mill.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(250));
            loop {
                interval.tick().await;
                let rumors: Vec<_> = {
                    let mut mill = rumor_mill.lock().await;
                    std::iter::from_fn(|| mill.get_node()).collect()
                };
                let mut table = node_store.lock().await;
                for rumor in rumors {
                    if let Some(node) = mesh.verify(0, &rumor) {
                        debug!(node = %node.address, "rumor verified");
                        table.insert(node);
                    }
                }
            }
        })
    };

    let mut searches = Vec::new();
    for i in 0..args.searches {
        let index = 1 + (i * 7919) % (mesh.len() - 1);
        let Some(target) = mesh.address(index) else {
            continue;
        };
        match runner.search(target.ip6).await {
            Some(handle) => searches.push((index, handle)),
            None => info!(target = index, "search not admitted"),
        }
    }

    for i in 0..runner.active_searches().await {
        let data = runner.show_active_search(i).await;
        debug!(
            target = %format_ip6(&data.target),
            requests = data.total_requests,
            active = data.active_searches,
            "active search"
        );
    }

    let mut found = 0;
    for (index, handle) in searches {
        let target = handle.target();
        let summary = handle.wait().await;
        let reached = summary.responders.iter().any(|a| a.ip6 == target);
        if reached {
            found += 1;
        }
        info!(
            target = index,
            requests = summary.total_requests,
            answered = summary.responders.len(),
            silent = summary.silent.len(),
            reached,
            "search finished"
        );
    }

    verifier.abort();
    runner.quit().await;
    let known = node_store.lock().await.len();
    info!(found, known, "all searches finished");
    Ok(())
}
