//! Sitelink CLI - Main Entry Point
//!
//! Provisions hub-side PKI, keys and configuration for remote sites
//! connecting over OpenVPN or WireGuard.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;
mod context;
mod output;

use commands::{client, pki, server, wg};
use context::Context;

/// Sitelink - hub-and-spoke site tunnel provisioning
#[derive(Parser)]
#[command(name = "sitelink")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file
    #[arg(long, env = "SITELINK_CONFIG", default_value = "/etc/sitelink/config.toml", global = true)]
    config: PathBuf,

    /// Override the state store directory
    #[arg(long, env = "SITELINK_STORE", global = true)]
    store: Option<PathBuf>,

    /// Output format
    #[arg(long, default_value = "table", global = true)]
    format: output::OutputFormat,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Certificate authority and server certificates
    #[command(subcommand)]
    Pki(pki::PkiCommands),

    /// WireGuard hub keys
    #[command(subcommand)]
    Wg(wg::WgCommands),

    /// Remote site clients
    #[command(subcommand)]
    Client(client::ClientCommands),

    /// Server configuration files
    #[command(subcommand)]
    Server(server::ServerCommands),

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    if let Commands::Version = cli.command {
        println!("Sitelink CLI v{}", env!("CARGO_PKG_VERSION"));
        println!("Core library v{}", sitelink_common::VERSION);
        return Ok(());
    }

    let ctx = Context::open(&cli.config, cli.store)?;

    let result = match cli.command {
        Commands::Pki(cmd) => pki::execute(cmd, ctx, cli.format).await,
        Commands::Wg(cmd) => wg::execute(cmd, ctx, cli.format).await,
        Commands::Client(cmd) => client::execute(cmd, ctx, cli.format).await,
        Commands::Server(cmd) => server::execute(cmd, ctx, cli.format).await,
        Commands::Version => Ok(()),
    };

    if let Err(e) = result {
        output::print_error(&format!("{:#}", e));
        std::process::exit(1);
    }

    Ok(())
}
