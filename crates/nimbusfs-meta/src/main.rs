#![warn(missing_docs)]

//! NimbusFS metadata server

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use nimbusfs_common::Properties;
use nimbusfs_meta::authority::{self, MetaServerConfig};

#[derive(Parser)]
#[command(name = "nimbus-meta")]
#[command(about = "NimbusFS metadata server", long_about = None)]
struct Args {
    /// Properties file carrying the metaServer.* settings.
    #[arg(short, long, default_value = "/etc/nimbusfs/meta.prp")]
    config: PathBuf,

    /// Overrides the checkpoint directory from the properties file.
    #[arg(long)]
    checkpoint_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    tracing::info!("NimbusFS metadata server starting...");

    let args = Args::parse();
    let mut props = Properties::new();
    if args.config.exists() {
        props.load_file(&args.config, '=', false)?;
        tracing::debug!(
            "settings from {}:\n{}",
            args.config.display(),
            props.render_list("  ")
        );
    } else {
        tracing::warn!(
            "Config file not found, using defaults: {}",
            args.config.display()
        );
    }

    let mut config = MetaServerConfig::from_properties(&props);
    if let Some(dir) = args.checkpoint_dir {
        config.checkpoint_dir = dir;
    }
    tracing::info!(
        checkpoint_dir = %config.checkpoint_dir.display(),
        checkpoint_interval_secs = config.checkpoint_interval.as_secs(),
        replication_check_interval_secs = config.replication_check_interval.as_secs(),
        "configuration loaded"
    );

    let handle = authority::spawn(&config)?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    handle.shutdown().await;

    Ok(())
}
