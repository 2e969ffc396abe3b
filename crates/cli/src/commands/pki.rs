//! PKI Commands

use anyhow::{bail, Result};
use clap::Subcommand;
use colored::Colorize;
use serde::Serialize;

use crate::context::Context;
use crate::output::{print_item, print_list, print_success, print_warning, OutputFormat, TableDisplay};
use sitelink_provision::pki::{BootstrapReport, StepOutcome};
use sitelink_provision::Readiness;

#[derive(Subcommand)]
pub enum PkiCommands {
    /// Show which prerequisites are in place
    Status,

    /// Create the easy-rsa PKI layout
    Init,

    /// Generate the certificate authority
    Ca,

    /// Issue the server certificate
    Server,

    /// Generate Diffie-Hellman parameters (slow)
    Dh,

    /// Generate the control-channel (tls-auth) key
    TlsKey,

    /// Run every missing setup step
    Bootstrap,

    /// Revoke a certificate that no active client owns
    Revoke {
        /// Certificate common name
        name: String,
    },
}

/// Readiness display wrapper for serialization
#[derive(Serialize)]
pub struct ReadinessDisplay {
    #[serde(flatten)]
    pub readiness: Readiness,
    pub ready: bool,
}

fn mark(ok: bool) -> String {
    if ok {
        "yes".green().to_string()
    } else {
        "no".red().to_string()
    }
}

impl TableDisplay for ReadinessDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["OpenVPN", "easy-rsa", "PKI", "CA", "Server Cert", "DH", "TLS Key", "Ready"]
    }

    fn row(&self) -> Vec<String> {
        let r = &self.readiness;
        vec![
            mark(r.openvpn_installed),
            mark(r.easyrsa_installed),
            mark(r.pki_initialized),
            mark(r.ca_cert_exists),
            mark(r.server_cert_exists),
            mark(r.dh_exists),
            mark(r.ta_key_exists),
            mark(self.ready).bold().to_string(),
        ]
    }
}

/// One bootstrap step
#[derive(Serialize)]
pub struct StepDisplay {
    pub step: String,
    pub outcome: StepOutcome,
}

impl TableDisplay for StepDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["Step", "Outcome"]
    }

    fn row(&self) -> Vec<String> {
        let outcome = match self.outcome {
            StepOutcome::Created => "created".green().to_string(),
            StepOutcome::Skipped => "skipped".dimmed().to_string(),
        };
        vec![self.step.clone(), outcome]
    }
}

fn steps(report: BootstrapReport) -> Vec<StepDisplay> {
    report
        .steps
        .into_iter()
        .map(|(step, outcome)| StepDisplay { step, outcome })
        .collect()
}

pub async fn execute(cmd: PkiCommands, ctx: Context, format: OutputFormat) -> Result<()> {
    let ca = ctx.orchestrator.certificate_authority();

    match cmd {
        PkiCommands::Status => {
            let readiness = ctx.orchestrator.check_readiness().await;
            let missing = readiness.missing();
            let display = ReadinessDisplay {
                ready: readiness.all_ready(),
                readiness,
            };
            print_item(&display, format);
            if !missing.is_empty() && matches!(format, OutputFormat::Table | OutputFormat::Plain) {
                print_warning(&format!("Missing: {}", missing.join(", ")));
            }
        }

        PkiCommands::Init => {
            if ca.initialize_pki().await? {
                print_success(&format!("PKI initialized at {}", ctx.config.openvpn.pki_dir.display()));
            } else {
                print_warning("PKI already initialized");
            }
        }

        PkiCommands::Ca => {
            ca.generate_ca_certificate().await?;
            print_success("CA certificate generated");
        }

        PkiCommands::Server => {
            ca.generate_server_certificate().await?;
            print_success("Server certificate issued");
        }

        PkiCommands::Dh => {
            println!("{}", "Generating DH parameters, this can take several minutes...".dimmed());
            ca.generate_dh_parameters().await?;
            print_success("DH parameters generated");
        }

        PkiCommands::TlsKey => {
            ca.generate_control_channel_key().await?;
            print_success("Control-channel key generated");
        }

        PkiCommands::Bootstrap => {
            let report = ctx.orchestrator.bootstrap_pki().await?;
            let created = report.created();
            print_list(&steps(report), format);
            if matches!(format, OutputFormat::Table | OutputFormat::Plain) {
                print_success(&format!("PKI bootstrap complete ({} step(s) created)", created));
            }
        }

        PkiCommands::Revoke { name } => {
            if let Ok(client) = ctx.orchestrator.get_client(&name) {
                if client.is_active() {
                    bail!(
                        "certificate '{}' belongs to an active client; use `sitelink client disable {}`",
                        name,
                        name
                    );
                }
            }
            ca.revoke_client_certificate(&name).await?;
            print_success(&format!("Certificate '{}' revoked", name));
        }
    }

    Ok(())
}
