//! Syncbox daemon entry point.

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use syncbox::cli::DaemonOpts;

fn main() -> Result<()> {
    let opts = DaemonOpts::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("build tokio runtime")?;
    rt.block_on(syncbox::server::serve(&opts.bind, &opts.root))
}
