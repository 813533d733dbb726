//! molt-sim - in-process overlay simulator
//!
//! Starts a population of routing nodes on a memory transport, bootstraps
//! them through a seed node and reports the resulting tables.

use anyhow::Context;
use clap::{Parser, Subcommand};
use molt_routing::{
    MemoryNetwork, NatType, NodeId, NodeKeys, RoutingConfig, RoutingNode,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser)]
#[command(name = "molt-sim")]
#[command(about = "In-process MOLT overlay simulator")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Bootstrap an overlay and print each node's tables
    Run {
        /// Routing nodes to start
        #[arg(long, env = "MOLT_SIM_NODES", default_value_t = 16)]
        nodes: usize,

        /// Client-mode nodes to start
        #[arg(long, env = "MOLT_SIM_CLIENTS", default_value_t = 4)]
        clients: usize,

        /// Routing table capacity
        #[arg(long, env = "MOLT_SIM_TABLE_SIZE", default_value_t = 16)]
        table_size: usize,

        /// Close group size
        #[arg(long, env = "MOLT_SIM_GROUP_SIZE", default_value_t = 4)]
        group_size: usize,

        /// Client table capacity
        #[arg(long, env = "MOLT_SIM_CLIENT_TABLE_SIZE", default_value_t = 16)]
        client_table_size: usize,

        /// Milliseconds to let handshakes settle after bootstrap
        #[arg(long, env = "MOLT_SIM_SETTLE_MS", default_value_t = 500)]
        settle_ms: u64,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the default routing configuration as JSON
    Config,
}

#[derive(Debug, Serialize)]
struct NodeReport {
    node_id: String,
    client: bool,
    routing_nodes: usize,
    client_nodes: usize,
    close_group: Vec<String>,
    handshakes_completed: u64,
    messages_sent: u64,
    messages_received: u64,
    messages_dropped: u64,
    sessions_dropped: u64,
}

impl NodeReport {
    fn of(node: &RoutingNode) -> Self {
        let stats = node.stats();
        Self {
            node_id: node.node_id().short(),
            client: node.is_client(),
            routing_nodes: node.routing_nodes().len(),
            client_nodes: node.client_nodes().len(),
            close_group: node.close_group().iter().map(NodeId::short).collect(),
            handshakes_completed: node.acknowledged_handshakes(),
            messages_sent: stats.messages_sent,
            messages_received: stats.messages_received,
            messages_dropped: stats.messages_dropped,
            sessions_dropped: stats.sessions_dropped,
        }
    }
}

struct SimNode {
    node: Arc<RoutingNode>,
    _events_loop: JoinHandle<()>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env().add_directive("molt_sim=info".parse()?))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            nodes,
            clients,
            table_size,
            group_size,
            client_table_size,
            settle_ms,
            json,
        } => {
            let config = RoutingConfig::builder()
                .max_routing_table_size(table_size)
                .closest_nodes_size(group_size)
                .max_client_routing_table_size(client_table_size)
                .build()
                .context("invalid routing configuration")?;
            run(nodes, clients, config, Duration::from_millis(settle_ms), json).await?;
        }

        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&RoutingConfig::default())?);
        }
    }

    Ok(())
}

fn spawn(network: &Arc<MemoryNetwork>, client_mode: bool, config: &RoutingConfig) -> anyhow::Result<SimNode> {
    let keys = NodeKeys::generate();
    let connection_id = NodeId::random();
    let (transport, events) = network.register(keys.identity(), connection_id, NatType::None);
    let node = RoutingNode::new(keys, connection_id, client_mode, config.clone(), Arc::new(transport))
        .context("failed to create routing node")?;
    let events_loop = node.start(events);
    Ok(SimNode {
        node,
        _events_loop: events_loop,
    })
}

async fn run(
    nodes: usize,
    clients: usize,
    config: RoutingConfig,
    settle: Duration,
    json: bool,
) -> anyhow::Result<()> {
    anyhow::ensure!(nodes > 0, "at least one routing node is required");
    info!(nodes, clients, "starting simulation");

    let network = MemoryNetwork::new();
    let seed = spawn(&network, false, &config)?;
    let seed_id = seed.node.node_id();
    let mut population = vec![seed];

    for i in 1..nodes + clients {
        let sim = spawn(&network, i >= nodes, &config)?;
        match sim.node.bootstrap(&[seed_id]).await {
            Ok(accepted) if accepted > 0 => {}
            Ok(_) => warn!(node = %sim.node.node_id(), "seed refused the node"),
            Err(e) => warn!(node = %sim.node.node_id(), error = %e, "bootstrap failed"),
        }
        population.push(sim);
    }

    tokio::time::sleep(settle).await;

    let reports: Vec<NodeReport> = population.iter().map(|s| NodeReport::of(&s.node)).collect();
    if json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    } else {
        println!(
            "{:<12} {:<7} {:>8} {:>8} {:>6} {:>6} {:>6} {:>6}",
            "NODE", "MODE", "ROUTING", "CLIENTS", "DONE", "SENT", "RECV", "STRAY"
        );
        for r in &reports {
            println!(
                "{:<12} {:<7} {:>8} {:>8} {:>6} {:>6} {:>6} {:>6}",
                r.node_id,
                if r.client { "client" } else { "vault" },
                r.routing_nodes,
                r.client_nodes,
                r.handshakes_completed,
                r.messages_sent,
                r.messages_received,
                r.sessions_dropped,
            );
        }
    }

    let handshakes: u64 = reports.iter().map(|r| r.handshakes_completed).sum();
    info!(links = network.link_count(), handshakes, "simulation finished");

    for sim in &population {
        sim.node.shutdown();
    }
    Ok(())
}
