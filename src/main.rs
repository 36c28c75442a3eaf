#![doc = include_str!("../Readme.md")]
#![warn(clippy::all, clippy::pedantic, clippy::cargo, clippy::nursery)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]

use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry};

use tlog_tiles::checkpoint::Signer;
use tlog_tiles::config::load_config;

/// Append-only, tile-addressed Merkle log storage engine.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Path to a TOML config file. Overridden by `TLOG__`-prefixed
    /// environment variables, e.g. `TLOG__SERVER__ADDRESS`.
    #[arg(long, env = "TLOG_CONFIG")]
    config: Option<PathBuf>,

    /// `env_filter`-compatible log filter. Defaults to `info`.
    #[arg(long, env = "TLOG_LOG_FILTER", default_value = "info")]
    log_filter: String,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_new(&args.log_filter).unwrap_or_else(|_| EnvFilter::new("info"));
    Registry::default()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .ok();

    let config = load_config(args.config.as_deref())?;

    // Note signing is an external collaborator: this binary ships
    // without a concrete signing key and runs with an empty signer
    // set, producing unsigned checkpoint notes. Embedders that need
    // signed checkpoints call `tlog_tiles::main` directly with their own
    // `Signer` implementations.
    let signers: Vec<std::sync::Arc<dyn Signer>> = Vec::new();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(tlog_tiles::main(config, signers))
}
