use clap::Parser;
use consensus_node::{
    level_from_env, start_node, terminal_logger, ClusterMembership, ConsensusNode, HubConfig, NetworkConfig,
    NoOpStateMachine, NodeConfig, NodeEvent, NodeId, RaftOptions,
};
use std::path::PathBuf;
use std::process;

#[derive(Parser)]
#[command(name = "consensus-node", version, about = "Runs one member of a consensus cluster")]
struct Cli {
    /// This node's id in the membership file
    node_id: u64,

    /// Cluster membership: a JSON array of `{"id", "host", "port"}`
    #[arg(long)]
    config: PathBuf,

    /// Discovery hub: `{"host", "port"}`. Without it, every peer needs a static address.
    #[arg(long)]
    hub: Option<PathBuf>,

    /// Where to keep the log and metadata. Without it, state lives in memory only.
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    // Usage errors exit with 2 inside parse().
    let cli = Cli::parse();
    let logger = terminal_logger(level_from_env());

    let exit_code = run(cli, &logger).await;
    // Let the async drain flush before exiting.
    drop(logger);
    process::exit(exit_code);
}

async fn run(cli: Cli, logger: &slog::Logger) -> i32 {
    let membership = match ClusterMembership::load(&cli.config) {
        Ok(membership) => membership,
        Err(e) => {
            slog::crit!(logger, "Bad membership config {:?}: {}", cli.config, e);
            return 2;
        }
    };
    let hub = match cli.hub.as_ref().map(HubConfig::load).transpose() {
        Ok(hub) => hub,
        Err(e) => {
            slog::crit!(logger, "Bad hub config {:?}: {}", cli.hub, e);
            return 2;
        }
    };

    let config = NodeConfig {
        node_id: NodeId::new(cli.node_id),
        membership,
        data_dir: cli.data_dir,
        logger: logger.clone(),
        options: RaftOptions::default(),
    };
    let mut node = match start_node(config, Box::new(NoOpStateMachine::new()), NetworkConfig::Grpc { hub }).await {
        Ok(node) => node,
        Err(e) => {
            slog::crit!(logger, "Failed to start node: {}", e);
            return e.exit_code();
        }
    };

    spawn_observers(&mut node, logger.clone());

    tokio::select! {
        interrupted = tokio::signal::ctrl_c() => {
            match interrupted {
                Ok(()) => slog::info!(logger, "Interrupted, shutting down"),
                Err(e) => slog::error!(logger, "Can't listen for Ctrl-C ({}), shutting down", e),
            }
        }
        failure = node.stopped() => {
            slog::crit!(logger, "Node stopped: {}", failure);
            return 1;
        }
    }
    node.shutdown().await;
    slog::info!(logger, "Shut down cleanly");

    0
}

// Nobody else consumes these in the binary. The commit stream must be drained so it doesn't grow.
fn spawn_observers(node: &mut ConsensusNode, logger: slog::Logger) {
    let mut event_listener = node.event_listener();
    let election_logger = logger.clone();
    tokio::spawn(async move {
        while let Some(NodeEvent::Election(election_event)) = event_listener.next_event().await {
            slog::info!(election_logger, "Election state: {:?}", election_event);
        }
    });

    if let Some(mut commit_stream) = node.take_commit_stream() {
        tokio::spawn(async move {
            while let Some(committed) = commit_stream.next().await {
                slog::debug!(logger, "Applied {:?}", committed.index; "Term" => committed.term.as_u64());
            }
        });
    }
}
