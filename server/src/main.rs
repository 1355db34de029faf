use anyhow::Result;
use clap::Parser;
use std::path::Path;

use nixmirror_server::{config, run_api_server};

const CONFIG_PATH: &str = "/etc/nixmirror/config.toml";

/// nixmirror - read-only, pull-through Nix binary cache.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the 'config.toml'.
    #[arg(short, long, default_value_t = CONFIG_PATH.to_string())]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    dump_version();
    tracing_subscriber::fmt::init();

    let config = config::load(Some(Path::new(&args.config))).await?;

    run_api_server(config).await?;

    Ok(())
}

fn dump_version() {
    #[cfg(debug_assertions)]
    eprintln!("nixmirror {} (debug)", env!("CARGO_PKG_VERSION"));
    #[cfg(not(debug_assertions))]
    eprintln!("nixmirror {} (release)", env!("CARGO_PKG_VERSION"));
}
