//! plugvisor: manage sandboxed plugins from the command line.
//!
//! Usage:
//!   plugvisor keygen --out dev.key
//!   plugvisor pack manifest.toml plugin.wasm --key dev.key --out notes.pvb
//!   plugvisor install notes.pvb
//!   plugvisor run acme.notes summarize --args '{"limit": 5}'
//!   plugvisor rollback acme.notes
//!
//! State lives in `--data-dir` (default `.plugvisor`); settings come from
//! `--config` (default `plugvisor.toml`, optional).

use anyhow::Result;
use clap::Parser;
use plugvisor_cli::{Cli, execute};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let mut stdout = std::io::stdout().lock();
    execute(cli, &mut stdout).await
}
