//! Concord Node - Command Line Interface
//!
//! Runs an in-process Concord cluster over the simulated network: Raft
//! replicates commands while every replica gossips a shared CRDT counter.
//! Also validates node configuration files.
//!
//! Key Features:
//! - Configurable cluster size and run time
//! - Leader isolation to exercise re-election
//! - Structured or JSON log output
//! - Final cluster report as JSON
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use clap::{Parser, Subcommand};
use concord_common::config::{LoggingConfig, NodeConfig};
use concord_common::{NodeId, Result, SyncError};
use concord_sync::{
    CrdtMerge, CrdtRegistry, GossipEngine, GossipHandle, GossipMessage, GossipService,
    InMemoryNetwork, KeyValueStore, MemoryStore, NodeRole, RaftHandle, RaftMessage, RaftNode,
    RaftService,
};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const COUNTER_ID: &str = "requests";

// =============================================================================
// CLI Arguments
// =============================================================================

#[derive(Parser)]
#[command(name = "concord-node")]
#[command(author = "AutomataNexus Development Team")]
#[command(version = "0.1.0")]
#[command(about = "Concord distributed state-synchronization node", long_about = None)]
struct Cli {
    /// Node configuration file (TOML)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Log filter, overrides the configured level
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an in-process cluster on the simulated network
    Simulate {
        /// Cluster size when the configuration lists no peers
        #[arg(short, long, default_value = "5")]
        nodes: usize,

        /// Run time in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,

        /// Milliseconds between client operations
        #[arg(long, default_value = "200")]
        interval: u64,

        /// Cut the leader off halfway through the run
        #[arg(long)]
        isolate_leader: bool,
    },
    /// Validate a configuration file and print the effective settings
    CheckConfig,
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("invalid configuration: {}", e);
            std::process::exit(2);
        }
    };
    init_tracing(&config.logging, cli.log_level.as_deref(), cli.json);

    let result = match cli.command {
        Commands::Simulate {
            nodes,
            duration,
            interval,
            isolate_leader,
        } => {
            let options = SimulationOptions {
                nodes,
                duration: Duration::from_secs(duration),
                interval: Duration::from_millis(interval.max(1)),
                isolate_leader,
            };
            simulate(config, options).await
        }
        Commands::CheckConfig => check_config(&config),
    };

    if let Err(e) = result {
        tracing::error!(error = %e, "concord-node failed");
        std::process::exit(1);
    }
}

fn load_config(path: Option<&str>) -> Result<NodeConfig> {
    match path {
        Some(path) => NodeConfig::from_file(path),
        None => Ok(NodeConfig::default()),
    }
}

fn init_tracing(logging: &LoggingConfig, level: Option<&str>, json: bool) {
    let directive = level.unwrap_or(logging.level.as_str());
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(directive))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json || logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn check_config(config: &NodeConfig) -> Result<()> {
    config.validate()?;
    let summary = json!({
        "nodeId": config.node_id,
        "address": config.address,
        "peers": config.peer_ids(),
        "electionTimeoutMs": config.raft.election_timeout.as_millis() as u64,
        "heartbeatIntervalMs": config.raft.heartbeat_interval.as_millis() as u64,
        "snapshotThreshold": config.raft.snapshot_threshold,
        "gossipIntervalMs": config.gossip.gossip_interval.as_millis() as u64,
        "fanout": config.gossip.fanout,
        "suspectTimeoutMs": config.gossip.suspect_timeout.as_millis() as u64,
        "deadTimeoutMs": config.gossip.dead_timeout.as_millis() as u64,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

// =============================================================================
// Simulation
// =============================================================================

struct SimulationOptions {
    nodes: usize,
    duration: Duration,
    interval: Duration,
    isolate_leader: bool,
}

struct Replica {
    id: NodeId,
    raft: RaftHandle,
    gossip: GossipHandle<CrdtMerge>,
}

fn cluster_ids(config: &NodeConfig, nodes: usize) -> Result<Vec<NodeId>> {
    let ids: Vec<NodeId> = if config.peers.is_empty() {
        (1..=nodes).map(|i| NodeId::new(format!("node-{}", i))).collect()
    } else {
        std::iter::once(config.node_id.clone())
            .chain(config.peer_ids())
            .collect()
    };
    if ids.is_empty() {
        return Err(SyncError::Configuration("a cluster needs at least one node".to_string()));
    }
    Ok(ids)
}

async fn simulate(config: NodeConfig, options: SimulationOptions) -> Result<()> {
    let ids = cluster_ids(&config, options.nodes)?;
    let raft_network = InMemoryNetwork::<RaftMessage>::new();
    let gossip_network = InMemoryNetwork::<GossipMessage>::new();
    let store = Arc::new(MemoryStore::new());

    tracing::info!(nodes = ids.len(), duration_s = options.duration.as_secs(), "starting simulated cluster");

    let mut replicas = Vec::with_capacity(ids.len());
    for id in &ids {
        let node = RaftNode::new(id.clone(), ids.iter().cloned(), config.raft.clone());
        let inbox = raft_network.register(id.clone());
        let (raft, _) = RaftService::spawn(node, Arc::new(raft_network.endpoint(id.clone())), inbox);

        // Replicas share one store, so each persists under its own namespace.
        let registry = CrdtRegistry::with_config(id.clone(), &config.crdt)
            .with_namespace(format!("{}:{}", config.crdt.namespace, id))
            .with_store(store.clone());
        let merge = CrdtMerge::with_config(registry, &config.crdt);
        let mut engine = GossipEngine::with_merger(
            id.clone(),
            format!("sim://{}", id),
            config.gossip.clone(),
            merge,
        );
        let now = std::time::Instant::now();
        for peer in ids.iter().filter(|p| *p != id) {
            engine.add_peer(peer.clone(), format!("sim://{}", peer), BTreeMap::new(), now);
        }
        let inbox = gossip_network.register(id.clone());
        let (gossip, _) = GossipService::spawn(engine, Arc::new(gossip_network.endpoint(id.clone())), inbox);

        replicas.push(Replica {
            id: id.clone(),
            raft,
            gossip,
        });
    }

    let started = tokio::time::Instant::now();
    let mut ticker = tokio::time::interval(options.interval);
    let mut sequence = 0u64;
    let mut isolated: Option<NodeId> = None;

    while started.elapsed() < options.duration {
        ticker.tick().await;
        sequence += 1;

        if options.isolate_leader && isolated.is_none() && started.elapsed() >= options.duration / 2 {
            if let Some(leader) = find_leader(&replicas).await {
                tracing::warn!(node = %leader.id, "isolating leader");
                raft_network.isolate(&leader.id);
                isolated = Some(leader.id.clone());
            }
        }

        if let Some(leader) = find_leader(&replicas).await {
            let command = format!("command:{}", sequence);
            match leader.raft.propose(command, json!({ "sequence": sequence })).await {
                Ok(index) => tracing::debug!(leader = %leader.id, index, "command proposed"),
                Err(e) => tracing::debug!(error = %e, "proposal rejected"),
            }
        }

        let replica = &replicas[(sequence as usize) % replicas.len()];
        replica
            .gossip
            .call(|engine| -> Result<()> {
                engine.merger_mut().registry_mut().g_counter(COUNTER_ID)?.increment(1);
                engine.publish_crdt(COUNTER_ID)
            })
            .await??;
    }

    // Let gossip catch up before reporting.
    raft_network.heal();
    tokio::time::sleep(config.gossip.gossip_interval * 3).await;

    let report = report(&replicas, store.as_ref(), sequence).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    for replica in &replicas {
        replica.raft.shutdown();
        replica.gossip.shutdown();
    }
    Ok(())
}

async fn find_leader(replicas: &[Replica]) -> Option<&Replica> {
    let mut leader = None;
    let mut best_term = 0;
    for replica in replicas {
        if let Ok(status) = replica.raft.status().await {
            if status.role == NodeRole::Leader && status.current_term >= best_term {
                best_term = status.current_term;
                leader = Some(replica);
            }
        }
    }
    leader
}

async fn report(replicas: &[Replica], store: &MemoryStore, operations: u64) -> Result<Value> {
    let mut nodes = Vec::with_capacity(replicas.len());
    for replica in replicas {
        let status = replica.raft.status().await?;
        let stats = replica.raft.stats().await?;
        let gossip = replica.gossip.stats().await?;

        let registry = replica
            .gossip
            .call(|engine| engine.merger().registry().clone())
            .await?;
        registry.persist_all().await?;
        let counter = registry.get(COUNTER_ID).map(|state| state.value());

        nodes.push(json!({
            "raft": status,
            "raftStats": stats,
            "gossip": gossip,
            "counter": counter,
        }));
    }

    let mut persisted = BTreeMap::new();
    for key in store.keys() {
        if let Some(raw) = store.get(&key).await? {
            persisted.insert(key, serde_json::from_str::<Value>(&raw)?);
        }
    }

    Ok(json!({
        "operations": operations,
        "nodes": nodes,
        "persisted": persisted,
        "storeStats": store.stats(),
    }))
}
