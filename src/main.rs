//! pfx-issuer - HTTP service issuing single-download PKCS#12 client bundles
//!
//! ```bash
//! pfx-issuer bootstrap-ca --dir ca      # development root + intermediate CA
//! pfx-issuer serve --config config.toml # HTTP API on [server] host:port
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use pfx_issuer::configs::AppConfig;
use pfx_issuer::issuer::Issuer;
use pfx_issuer::pki_generator::bootstrap_dev_ca;
use pfx_issuer::webserver;

#[derive(Parser)]
#[command(name = "pfx-issuer", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP service
    Serve {
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
    },
    /// Write a development root and intermediate CA for the `local` backend
    BootstrapCa {
        #[arg(short, long, default_value = "ca")]
        dir: PathBuf,
        #[arg(long, default_value_t = 4096)]
        key_bits: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match Cli::parse().command {
        Command::Serve { config } => serve(config).await,
        Command::BootstrapCa { dir, key_bits } => bootstrap(dir, key_bits),
    }
}

async fn serve(config_path: PathBuf) -> Result<()> {
    let config = AppConfig::from_file(&config_path)?;
    info!(config = %config_path.display(), "Configuration loaded");

    let issuer = Arc::new(Issuer::from_config(&config).context("Failed to initialize issuer")?);
    let reaper = issuer
        .store()
        .spawn_reaper(config.storage.sweep_interval());

    let result = webserver::serve(&config.server, Arc::clone(&issuer)).await;
    reaper.abort();
    result
}

fn bootstrap(dir: PathBuf, key_bits: u32) -> Result<()> {
    let paths = bootstrap_dev_ca(&dir, key_bits)
        .context(format!("Failed to bootstrap CA in {}", dir.display()))?;

    println!("✓ Development CA written to {}", dir.display());
    println!("  [ca]");
    println!("  backend = \"local\"");
    println!("  config_path = \"{}\"", paths.descriptor.display());
    println!("  chain_path = \"{}\"", paths.chain.display());
    println!("\n⚠️  Install {} as a trust anchor only on test machines", paths.root_cert.display());
    Ok(())
}
