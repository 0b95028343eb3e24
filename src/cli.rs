// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use clap::Parser;
use std::path::PathBuf;

/// A privacy-preserving computation node: admits PSI tasks, streams one
/// party's private data, and exchanges blinded protocol messages with peer
/// agencies through a gateway front.
#[derive(Parser, Debug)]
#[command(name = "veil", version, about)]
pub struct Cli {
    /// Path to the node configuration file (YAML).
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// Log to stderr at debug level (RUST_LOG overrides).
    #[arg(long, short = 'v')]
    pub verbose: bool,
}
