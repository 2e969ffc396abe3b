//! Client Commands

use anyhow::Result;
use clap::Subcommand;
use ipnetwork::Ipv4Network;
use serde::Serialize;
use std::path::PathBuf;

use crate::context::Context;
use crate::output::{
    emit_document, format_timestamp, print_info, print_item, print_list, print_success, OutputFormat,
    TableDisplay,
};
use sitelink_common::{Protocol, VpnClient};
use sitelink_provision::EnrollRequest;

#[derive(Subcommand)]
pub enum ClientCommands {
    /// Enroll a new remote site
    Enroll {
        /// Client name (letters, digits, '-', '_', '.')
        name: String,

        /// Tunnel protocol (openvpn, wireguard)
        #[arg(short, long)]
        protocol: Protocol,

        /// LAN behind the remote router, routed through the tunnel
        #[arg(long)]
        routed_subnet: Option<Ipv4Network>,

        /// Free-text description
        #[arg(short, long)]
        description: Option<String>,
    },

    /// List clients
    List {
        /// Only clients of this protocol
        #[arg(short, long)]
        protocol: Option<Protocol>,
    },

    /// Show client details
    Show {
        /// Client ID or name
        client: String,
    },

    /// Disable a client and revoke its credentials
    Disable {
        /// Client ID or name
        client: String,
    },

    /// Delete a disabled client and release its address
    Purge {
        /// Client ID or name
        client: String,
    },

    /// Replace a client's credentials, keeping its address
    Rekey {
        /// Client ID or name
        client: String,
    },

    /// Change (or clear) the subnet routed behind a client
    SetSubnet {
        /// Client ID or name
        client: String,

        /// New routed subnet; omit to clear
        #[arg(long)]
        subnet: Option<Ipv4Network>,
    },

    /// Print or save the client configuration bundle
    Bundle {
        /// Client ID or name
        client: String,

        /// Write to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Print or save the router provisioning script
    Script {
        /// Client ID or name
        client: String,

        /// Write to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

/// Client display wrapper for serialization; never carries private keys
#[derive(Serialize)]
pub struct ClientDisplay {
    pub id: String,
    pub name: String,
    pub protocol: Protocol,
    pub tunnel_address: String,
    pub routed_subnet: Option<String>,
    pub state: String,
    pub enabled: bool,
    pub public_key: Option<String>,
    pub description: Option<String>,
    pub last_generated_at: Option<i64>,
    pub created_at: i64,
}

impl From<&VpnClient> for ClientDisplay {
    fn from(client: &VpnClient) -> Self {
        Self {
            id: client.id.clone(),
            name: client.name.clone(),
            protocol: client.protocol,
            tunnel_address: client.tunnel_address.to_string(),
            routed_subnet: client.routed_subnet.map(|s| s.to_string()),
            state: client.state.to_string(),
            enabled: client.enabled,
            public_key: client.keys.public_key.clone(),
            description: client.description.clone(),
            last_generated_at: client.last_generated_at,
            created_at: client.created_at,
        }
    }
}

impl TableDisplay for ClientDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["ID", "Name", "Protocol", "Address", "Routed Subnet", "State", "Description", "Created"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.id.chars().take(8).collect(),
            self.name.clone(),
            self.protocol.to_string(),
            self.tunnel_address.clone(),
            self.routed_subnet.clone().unwrap_or_else(|| "-".to_string()),
            self.state.clone(),
            self.description.clone().unwrap_or_default(),
            format_timestamp(self.created_at),
        ]
    }
}

fn is_human(format: OutputFormat) -> bool {
    matches!(format, OutputFormat::Table | OutputFormat::Plain)
}

pub async fn execute(cmd: ClientCommands, ctx: Context, format: OutputFormat) -> Result<()> {
    let orchestrator = &ctx.orchestrator;

    match cmd {
        ClientCommands::Enroll {
            name,
            protocol,
            routed_subnet,
            description,
        } => {
            let mut request = EnrollRequest::new(name, protocol);
            if let Some(subnet) = routed_subnet {
                request = request.with_routed_subnet(subnet);
            }
            if let Some(description) = description {
                request = request.with_description(description);
            }

            let enrollment = orchestrator.enroll_client(request).await?;
            let client = &enrollment.client;
            print_item(&ClientDisplay::from(client), format);
            if is_human(format) {
                print_success(&format!(
                    "Client '{}' enrolled at {}",
                    client.name, client.tunnel_address
                ));
                print_info(&format!(
                    "Fetch its configuration with `sitelink client bundle {}` and `sitelink client script {}`",
                    client.name, client.name
                ));
            }
        }

        ClientCommands::List { protocol } => {
            let clients = orchestrator.list_clients(protocol)?;
            let displays: Vec<ClientDisplay> = clients.iter().map(ClientDisplay::from).collect();
            print_list(&displays, format);
        }

        ClientCommands::Show { client } => {
            let client = orchestrator.get_client(&client)?;
            print_item(&ClientDisplay::from(&client), format);
        }

        ClientCommands::Disable { client } => {
            let client = orchestrator.disable_client(&client).await?;
            print_success(&format!("Client '{}' disabled", client.name));
        }

        ClientCommands::Purge { client } => {
            let client = orchestrator.purge_client(&client).await?;
            print_success(&format!(
                "Client '{}' purged, {} released",
                client.name, client.tunnel_address
            ));
        }

        ClientCommands::Rekey { client } => {
            let enrollment = orchestrator.rekey_client(&client).await?;
            print_success(&format!("Client '{}' re-keyed", enrollment.client.name));
            if is_human(format) {
                print_info("Previously downloaded bundles and scripts are no longer valid");
            }
        }

        ClientCommands::SetSubnet { client, subnet } => {
            let client = orchestrator.update_routed_subnet(&client, subnet).await?;
            match client.routed_subnet {
                Some(subnet) => print_success(&format!("Client '{}' now routes {}", client.name, subnet)),
                None => print_success(&format!("Client '{}' no longer routes a subnet", client.name)),
            }
        }

        ClientCommands::Bundle { client, output } => {
            let bundle = orchestrator.client_bundle(&client).await?;
            emit_document(&bundle, output.as_deref()).await?;
        }

        ClientCommands::Script { client, output } => {
            let script = orchestrator.router_script(&client).await?;
            emit_document(&script, output.as_deref()).await?;
        }
    }

    Ok(())
}
