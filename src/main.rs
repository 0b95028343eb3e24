// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;
mod config;

use std::sync::Arc;

use clap::Parser;
use tracing::info;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::Cli;
use veil_channel::MemoryNetwork;
use veil_io::DataResourceLoader;
use veil_psi::bs_ecdh::BsEcdhPsi;
use veil_psi::ecdh::new_ecdh_psi;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Err(e) = run(cli).await {
        eprintln!("veil: startup failed: {e:#}");
        std::process::exit(-1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = config::load(cli.config.as_deref())?;
    info!(agency = %config.agency, "veil node starting");

    let mut loader = DataResourceLoader::new(None, None);
    if config.mmap_granularity > 0 {
        loader = loader.with_mmap_granularity(config.mmap_granularity);
    }
    if config.hdfs_buffer_size > 0 {
        loader = loader.with_hdfs_buffer_size(config.hdfs_buffer_size);
    }
    let loader = Arc::new(loader);

    // the in-process front links co-hosted parties; a gateway deployment
    // registers its own Front implementation here instead
    let network = MemoryNetwork::new();
    let (front, inbox) = network.register(&config.agency);

    let ecdh = new_ecdh_psi(config.psi.clone(), front, Arc::clone(&loader));
    let ecdh_worker = ecdh.start(inbox);

    let bs_ecdh = BsEcdhPsi::new(
        Arc::clone(&loader),
        config.bs_ecdh.timeout_minutes,
        config.bs_ecdh.enable_output_exists,
    );
    bs_ecdh.start();

    info!(agency = %config.agency, "veil node started; ctrl-c to stop");
    tokio::signal::ctrl_c().await?;

    info!("shutting down");
    ecdh.stop();
    bs_ecdh.stop();
    ecdh_worker.abort();
    Ok(())
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
        .init();
}
