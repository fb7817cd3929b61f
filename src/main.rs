use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use swarmfile::{CommonConfig, PeerRoster, Swarm};

/// Static-roster peer-to-peer file distribution client.
#[derive(Parser)]
#[command(name = "swarmfile")]
#[command(about = "Distribute one file across a fixed set of peers", long_about = None)]
struct Cli {
    /// Local peer id, as listed in PeerInfo.cfg
    peer_id: u32,

    /// Directory holding Common.cfg, PeerInfo.cfg and the peer_<id> dirs
    #[arg(short, long, default_value = ".")]
    dir: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    let config =
        CommonConfig::load(cli.dir.join("Common.cfg")).context("loading Common.cfg")?;
    let roster =
        PeerRoster::load(cli.dir.join("PeerInfo.cfg")).context("loading PeerInfo.cfg")?;

    let swarm = Swarm::new(cli.peer_id, config, roster, cli.dir)
        .await
        .context("initializing peer")?;
    swarm.run().await?;

    Ok(())
}
