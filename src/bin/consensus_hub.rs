use clap::Parser;
use consensus_node::{level_from_env, terminal_logger, HubConfig, HubServer};
use std::net::ToSocketAddrs;
use std::path::PathBuf;
use std::process;

#[derive(Parser)]
#[command(name = "consensus-hub", version, about = "Address directory for consensus nodes")]
struct Cli {
    /// Where to listen: `{"host", "port"}`, the same file the nodes get with `--hub`
    config: PathBuf,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let logger = terminal_logger(level_from_env());

    let exit_code = run(cli, &logger).await;
    drop(logger);
    process::exit(exit_code);
}

async fn run(cli: Cli, logger: &slog::Logger) -> i32 {
    let hub_config = match HubConfig::load(&cli.config) {
        Ok(hub_config) => hub_config,
        Err(e) => {
            slog::crit!(logger, "Bad hub config {:?}: {}", cli.config, e);
            return 2;
        }
    };
    let socket_addr = match hub_config.address().to_socket_addrs().map(|mut addrs| addrs.next()) {
        Ok(Some(socket_addr)) => socket_addr,
        Ok(None) | Err(_) => {
            slog::crit!(logger, "Can't resolve hub address {}", hub_config.address());
            return 2;
        }
    };

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    match HubServer::new(logger.clone()).run(socket_addr, shutdown).await {
        Ok(()) => 0,
        Err(e) => {
            slog::crit!(logger, "{}", e);
            1
        }
    }
}
