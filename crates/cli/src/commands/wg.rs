//! WireGuard Commands

use anyhow::Result;
use clap::Subcommand;
use serde::Serialize;

use crate::context::Context;
use crate::output::{print_item, print_message, print_success, OutputFormat, TableDisplay};
use sitelink_common::{ErrorKind, Protocol};

#[derive(Subcommand)]
pub enum WgCommands {
    /// Generate the hub keypair if none exists yet
    EnsureKeys,

    /// Print the hub public key
    PublicKey,

    /// Show hub key and configuration status
    Status,
}

/// Hub status display wrapper for serialization
#[derive(Serialize)]
pub struct WgStatusDisplay {
    pub interface: String,
    pub listen_port: u16,
    pub public_key: Option<String>,
    pub config_path: String,
    pub config_present: bool,
    pub active_peers: usize,
    pub disabled_peers: usize,
}

impl TableDisplay for WgStatusDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["Interface", "Port", "Public Key", "Config", "Present", "Active", "Disabled"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.interface.clone(),
            self.listen_port.to_string(),
            self.public_key.clone().unwrap_or_else(|| "-".to_string()),
            self.config_path.clone(),
            self.config_present.to_string(),
            self.active_peers.to_string(),
            self.disabled_peers.to_string(),
        ]
    }
}

pub async fn execute(cmd: WgCommands, ctx: Context, format: OutputFormat) -> Result<()> {
    match cmd {
        WgCommands::EnsureKeys => {
            let keys = ctx.orchestrator.ensure_server_keys().await?;
            print_success("Hub keypair ready");
            print_message(&keys.public_key, format);
        }

        WgCommands::PublicKey => {
            let key = ctx.orchestrator.server_public_key()?;
            print_message(&key, format);
        }

        WgCommands::Status => {
            let public_key = match ctx.orchestrator.server_public_key() {
                Ok(key) => Some(key),
                Err(e) if e.kind() == ErrorKind::NotInitialized => None,
                Err(e) => return Err(e.into()),
            };
            let clients = ctx.orchestrator.list_clients(Some(Protocol::WireGuard))?;
            let active_peers = clients.iter().filter(|c| c.is_active()).count();

            let wg = &ctx.config.wireguard;
            let display = WgStatusDisplay {
                interface: wg.interface.clone(),
                listen_port: wg.port,
                public_key,
                config_path: wg.config_path.display().to_string(),
                config_present: wg.config_path.exists(),
                active_peers,
                disabled_peers: clients.len() - active_peers,
            };
            print_item(&display, format);
        }
    }

    Ok(())
}
