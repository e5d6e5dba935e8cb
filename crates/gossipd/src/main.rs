//! gossipd - cluster metadata gossip daemon
//!
//! Runs one gossip node over TCP: publishes this node's address, joins the
//! cluster through the bootstrap peers and keeps gossiping until interrupted.

use clap::Parser;
use gossip_net::TcpTransport;
use gossipd::config::Config;
use gossipd::node::Gossip;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> ExitCode {
    // Parse configuration
    let config = Config::parse();

    init_logging(&config);

    info!(
        "gossipd v{} - cluster metadata gossip daemon",
        env!("CARGO_PKG_VERSION")
    );

    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        return ExitCode::FAILURE;
    }

    if let Err(e) = run(config).await {
        error!("Gossip node error: {:#}", e);
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

fn init_logging(config: &Config) {
    let default_directives = if config.verbose {
        "gossipd=debug,gossip_net=debug,gossip_core=debug"
    } else {
        "gossipd=info,gossip_net=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directives));

    let registry = tracing_subscriber::registry().with(filter);
    if config.log_format == "json" {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    let transport = TcpTransport::new();
    let listener_cancel = CancellationToken::new();
    let (bound, accepted) = transport.listen(config.listen, listener_cancel.clone()).await?;

    let gossip = Gossip::new(
        config.node_id(),
        config.advertise_addr(bound),
        config.settings(),
        Arc::new(transport),
    );
    gossip.start(accepted, config.bootstrap_addrs())?;

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");

    listener_cancel.cancel();
    gossip.shutdown().await;
    Ok(())
}
