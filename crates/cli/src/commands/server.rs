//! Server Configuration Commands

use anyhow::Result;
use clap::Subcommand;
use serde::Serialize;

use crate::context::Context;
use crate::output::{print_item, print_success, OutputFormat, TableDisplay};
use sitelink_common::Protocol;
use sitelink_provision::Regeneration;

#[derive(Subcommand)]
pub enum ServerCommands {
    /// Rewrite the server configuration from the active clients
    Regenerate {
        /// Which tunnel server to regenerate (openvpn, wireguard)
        #[arg(short, long)]
        protocol: Protocol,

        /// Print the rendered configuration instead of writing it
        #[arg(long)]
        dry_run: bool,
    },
}

/// Regeneration display wrapper for serialization
#[derive(Serialize)]
pub struct RegenerationDisplay {
    pub path: String,
    pub digest: String,
    pub changed: bool,
    pub peers: usize,
}

impl From<&Regeneration> for RegenerationDisplay {
    fn from(r: &Regeneration) -> Self {
        Self {
            path: r.rendered.path.display().to_string(),
            digest: r.rendered.digest.clone(),
            changed: r.changed,
            peers: r.peers,
        }
    }
}

impl TableDisplay for RegenerationDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["Path", "Digest", "Changed", "Peers"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.path.clone(),
            self.digest.chars().take(12).collect(),
            self.changed.to_string(),
            self.peers.to_string(),
        ]
    }
}

pub async fn execute(cmd: ServerCommands, ctx: Context, format: OutputFormat) -> Result<()> {
    match cmd {
        ServerCommands::Regenerate { protocol, dry_run: true } => {
            let rendered = ctx.orchestrator.render_server_config(protocol).await?;
            print!("{}", rendered.contents);
        }

        ServerCommands::Regenerate { protocol, dry_run: false } => {
            let regeneration = ctx.orchestrator.regenerate_server_config(protocol).await?;
            print_item(&RegenerationDisplay::from(&regeneration), format);
            if matches!(format, OutputFormat::Table | OutputFormat::Plain) {
                if regeneration.changed {
                    print_success(&format!("{} server configuration written", protocol));
                } else {
                    print_success(&format!("{} server configuration already up to date", protocol));
                }
            }
        }
    }

    Ok(())
}
