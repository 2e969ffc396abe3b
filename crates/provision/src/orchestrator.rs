//! Client lifecycle orchestration
//!
//! Sequences address allocation, key material, rendering and persistence for
//! enroll / disable / purge / re-key, and owns the client state machine:
//!
//! ```text
//! pending --> active --> disabled --> purged
//!    \______________________________/
//! ```
//!
//! Failures come back as [`StageError`] naming the step that broke. Each is
//! logged once, here, with the client identity.

use crate::allocator::AddressAllocator;
use crate::config::ProvisionerConfig;
use crate::keys::{KeyPairManager, WgKeyPair};
use crate::pki::{BootstrapReport, CertificateAuthorityManager, IssuedCertificate, Readiness};
use crate::render::{ConfigBuilder, RenderedConfig, ServerKeyMaterial};
use ipnetwork::Ipv4Network;
use serde::Serialize;
use sitelink_common::exec::CommandRunner;
use sitelink_common::fsutil::{remove_if_exists, write_atomic, write_atomic_if_changed};
use sitelink_common::{
    validate_client_name, ClientState, Database, Error, ErrorKind, Protocol, Result, VpnClient,
};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

// ============================================================================
// Stage-labelled errors
// ============================================================================

/// Provisioning step a failure happened in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Validate,
    Load,
    ServerMaterial,
    Allocate,
    IssueCertificate,
    GenerateKeys,
    RevokeCertificate,
    Render,
    WriteArtifacts,
    Persist,
    Purge,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::Validate => "validate",
            Stage::Load => "load",
            Stage::ServerMaterial => "server_material",
            Stage::Allocate => "allocate",
            Stage::IssueCertificate => "issue_certificate",
            Stage::GenerateKeys => "generate_keys",
            Stage::RevokeCertificate => "revoke_certificate",
            Stage::Render => "render",
            Stage::WriteArtifacts => "write_artifacts",
            Stage::Persist => "persist",
            Stage::Purge => "purge",
        };
        f.write_str(name)
    }
}

/// A failed operation, labelled with the step and client it concerned
#[derive(Debug, thiserror::Error)]
#[error("{stage} failed for {identity}: {source}")]
pub struct StageError {
    pub stage: Stage,
    pub identity: String,
    #[source]
    pub source: Error,
}

impl StageError {
    pub fn kind(&self) -> ErrorKind {
        self.source.kind()
    }

    pub fn is_retryable(&self) -> bool {
        self.source.is_retryable()
    }
}

pub type StageResult<T> = std::result::Result<T, StageError>;

trait AtStage<T> {
    fn at(self, stage: Stage, identity: &str) -> StageResult<T>;
}

impl<T> AtStage<T> for Result<T> {
    fn at(self, stage: Stage, identity: &str) -> StageResult<T> {
        self.map_err(|source| {
            error!(
                identity = %identity,
                stage = %stage,
                kind = %source.kind(),
                error = %source,
                "Provisioning step failed"
            );
            StageError {
                stage,
                identity: identity.to_string(),
                source,
            }
        })
    }
}

// ============================================================================
// Requests and results
// ============================================================================

/// Parameters of a new enrollment
#[derive(Debug, Clone)]
pub struct EnrollRequest {
    pub name: String,
    pub protocol: Protocol,
    pub routed_subnet: Option<Ipv4Network>,
    pub description: Option<String>,
}

impl EnrollRequest {
    pub fn new(name: impl Into<String>, protocol: Protocol) -> Self {
        Self {
            name: name.into(),
            protocol,
            routed_subnet: None,
            description: None,
        }
    }

    pub fn with_routed_subnet(mut self, subnet: Ipv4Network) -> Self {
        self.routed_subnet = Some(subnet);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// An active client and the artifacts handed to its operator
#[derive(Debug, Clone, Serialize)]
pub struct Enrollment {
    pub client: VpnClient,
    #[serde(skip_serializing)]
    pub bundle: String,
    #[serde(skip_serializing)]
    pub router_script: String,
}

/// Result of rewriting a server configuration
#[derive(Debug, Clone)]
pub struct Regeneration {
    pub rendered: RenderedConfig,
    /// False when the file on disk already matched
    pub changed: bool,
    pub peers: usize,
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Front door for every client lifecycle operation
pub struct ProvisioningOrchestrator {
    db: Arc<Database>,
    ca: CertificateAuthorityManager,
    keys: KeyPairManager,
    allocator: AddressAllocator,
    builder: ConfigBuilder,
    /// Serializes allocate-then-persist
    enroll_lock: Mutex<()>,
    /// Serializes read-roster-then-write of server configs
    render_lock: Mutex<()>,
}

impl ProvisioningOrchestrator {
    pub fn new(config: &ProvisionerConfig, db: Arc<Database>, runner: Arc<dyn CommandRunner>) -> Self {
        let ca = CertificateAuthorityManager::new(
            runner.clone(),
            db.clone(),
            config.openvpn.clone(),
            config.execution.clone(),
        );
        let keys = KeyPairManager::new(runner, db.clone(), &config.wireguard, config.execution.clone());

        Self {
            db,
            ca,
            keys,
            allocator: AddressAllocator::new(config.network.subnet),
            builder: ConfigBuilder::new(config),
            enroll_lock: Mutex::new(()),
            render_lock: Mutex::new(()),
        }
    }

    pub fn certificate_authority(&self) -> &CertificateAuthorityManager {
        &self.ca
    }

    pub fn key_pairs(&self) -> &KeyPairManager {
        &self.keys
    }

    pub fn allocator(&self) -> &AddressAllocator {
        &self.allocator
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    pub fn list_clients(&self, protocol: Option<Protocol>) -> Result<Vec<VpnClient>> {
        self.db.list_clients(protocol)
    }

    /// Look a client up by id, falling back to name.
    pub fn get_client(&self, id_or_name: &str) -> Result<VpnClient> {
        if let Some(client) = self.db.get_client(id_or_name)? {
            return Ok(client);
        }
        self.db
            .get_client_by_name(id_or_name)?
            .ok_or_else(|| Error::not_found("client", id_or_name))
    }

    pub async fn check_readiness(&self) -> Readiness {
        self.ca.check_readiness().await
    }

    pub async fn bootstrap_pki(&self) -> Result<BootstrapReport> {
        self.ca.bootstrap().await
    }

    pub async fn ensure_server_keys(&self) -> Result<WgKeyPair> {
        self.keys.ensure_server_keys().await
    }

    pub fn server_public_key(&self) -> Result<String> {
        self.keys.server_public_key()
    }

    async fn server_material(&self, protocol: Protocol) -> Result<ServerKeyMaterial> {
        match protocol {
            Protocol::OpenVpn => Ok(ServerKeyMaterial::OpenVpn {
                ca_certificate: self.ca.ca_certificate()?,
                control_channel_key: self.ca.control_channel_key()?,
            }),
            Protocol::WireGuard => Ok(ServerKeyMaterial::WireGuard {
                server_keys: self.keys.ensure_server_keys().await?,
            }),
        }
    }

    fn check_routed_subnet(&self, subnet: Option<Ipv4Network>) -> Result<()> {
        let Some(subnet) = subnet else {
            return Ok(());
        };
        let tunnel = self.allocator.subnet();
        if tunnel.contains(subnet.network()) || subnet.contains(tunnel.network()) {
            return Err(Error::InvalidInput(format!(
                "routed subnet {} overlaps the tunnel network {}",
                subnet, tunnel
            )));
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Enrollment
    // ------------------------------------------------------------------------

    /// Enroll a remote site: allocate, key, render, persist, activate.
    ///
    /// On failure no client record survives and any certificate issued along
    /// the way is revoked again.
    pub async fn enroll_client(&self, request: EnrollRequest) -> StageResult<Enrollment> {
        let name = request.name.as_str();
        validate_client_name(name).at(Stage::Validate, name)?;
        self.check_routed_subnet(request.routed_subnet)
            .at(Stage::Validate, name)?;

        let _guard = self.enroll_lock.lock().await;

        if self.db.client_name_exists(name).at(Stage::Load, name)? {
            return Err(Error::already_exists("client", name)).at(Stage::Validate, name);
        }
        if request.protocol.is_certificate_based() && self.ca.has_unrevoked_certificate(name) {
            return Err(Error::already_exists("certificate", name)).at(Stage::Validate, name);
        }

        let material = self
            .server_material(request.protocol)
            .await
            .at(Stage::ServerMaterial, name)?;

        let existing = self.db.list_clients(None).at(Stage::Load, name)?;
        let address = self
            .allocator
            .next_available_address(&existing)
            .at(Stage::Allocate, name)?;

        let mut client = VpnClient::new(name, request.protocol, address, request.routed_subnet);
        client.description = request.description.clone();

        let issued = match request.protocol {
            Protocol::OpenVpn => Some(
                self.ca
                    .issue_client_certificate(name)
                    .await
                    .at(Stage::IssueCertificate, name)?,
            ),
            Protocol::WireGuard => {
                self.assign_wireguard_keys(&mut client).await?;
                None
            }
        };

        if let Err(e) = self.db.insert_client(&client).at(Stage::Persist, name) {
            self.rollback_enrollment(&client, false, issued.is_some()).await;
            return Err(e);
        }

        match self.activate(&mut client, &material, issued.as_ref()).await {
            Ok(enrollment) => {
                info!(
                    identity = %name,
                    protocol = %client.protocol,
                    address = %client.tunnel_address,
                    "Client enrolled"
                );
                Ok(enrollment)
            }
            Err(e) => {
                self.rollback_enrollment(&client, true, issued.is_some()).await;
                Err(e)
            }
        }
    }

    async fn assign_wireguard_keys(&self, client: &mut VpnClient) -> StageResult<()> {
        let name = client.name.clone();
        let pair = self
            .keys
            .generate_key_pair()
            .await
            .at(Stage::GenerateKeys, &name)?;
        let psk = self
            .keys
            .generate_preshared_key()
            .await
            .at(Stage::GenerateKeys, &name)?;

        client.keys.public_key = Some(pair.public_key);
        client.keys.private_key = Some(pair.private_key);
        client.keys.preshared_key = Some(psk);
        Ok(())
    }

    /// Render and write everything for a pending client, then mark it active.
    async fn activate(
        &self,
        client: &mut VpnClient,
        material: &ServerKeyMaterial,
        issued: Option<&IssuedCertificate>,
    ) -> StageResult<Enrollment> {
        let name = client.name.clone();

        let mut active = client.clone();
        active.state = active
            .state
            .transition(ClientState::Active)
            .at(Stage::Persist, &name)?;
        active.last_generated_at = Some(chrono::Utc::now().timestamp());

        let bundle = self
            .builder
            .build_client_bundle(&active, material, issued)
            .at(Stage::Render, &name)?;
        let router_script = self
            .builder
            .build_router_script(&active, material)
            .at(Stage::Render, &name)?;

        if let Some(mapping) = self.builder.build_client_mapping_file(&active) {
            write_atomic(&mapping.path, &mapping.contents, Some(mapping.mode))
                .await
                .at(Stage::WriteArtifacts, &name)?;
        }

        active.generated_bundle = Some(bundle.clone());
        active.generated_script = Some(router_script.clone());
        active.touch();

        {
            // Stored as active before the render lock is released
            let _render = self.render_lock.lock().await;
            let mut roster = self
                .db
                .list_clients(Some(active.protocol))
                .at(Stage::Load, &name)?;
            roster.retain(|c| c.id != active.id);
            roster.push(active.clone());
            self.write_server_config(active.protocol, material, &roster)
                .await
                .at(Stage::WriteArtifacts, &name)?;
            self.db.update_client(&active).at(Stage::Persist, &name)?;
        }

        *client = active.clone();
        Ok(Enrollment {
            client: active,
            bundle,
            router_script,
        })
    }

    /// Undo a failed enrollment. Errors here are logged, not returned.
    async fn rollback_enrollment(&self, client: &VpnClient, inserted: bool, issued: bool) {
        if inserted {
            if let Err(e) = self.db.delete_client(&client.id) {
                warn!(identity = %client.name, "Failed to delete pending record: {}", e);
            }
        }

        if let Some(mapping) = self.builder.build_client_mapping_file(client) {
            if let Err(e) = remove_if_exists(&mapping.path).await {
                warn!(identity = %client.name, "Failed to remove mapping file: {}", e);
            }
        }

        if issued {
            if let Err(e) = self.ca.revoke_client_certificate(&client.name).await {
                warn!(
                    identity = %client.name,
                    "Certificate left issued after failed enrollment, revoke it manually: {}",
                    e
                );
            }
        }

        if inserted {
            if let Err(e) = self.regenerate(client.protocol).await {
                warn!(identity = %client.name, "Failed to restore server config: {}", e);
            }
        }
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Revoke (certificate-based) or drop (key-based) a client and exclude it
    /// from server config. Its address stays reserved until purge.
    pub async fn disable_client(&self, id: &str) -> StageResult<VpnClient> {
        let mut client = self.get_client(id).at(Stage::Load, id)?;
        let name = client.name.clone();
        let next = client
            .state
            .transition(ClientState::Disabled)
            .at(Stage::Validate, &name)?;

        if client.protocol.is_certificate_based() {
            match self.ca.revoke_client_certificate(&name).await {
                Ok(()) => {}
                Err(Error::NotFound { .. }) => {
                    warn!(identity = %name, "No issued certificate left to revoke");
                }
                Err(e) => return Err(e).at(Stage::RevokeCertificate, &name),
            }
        }

        client.state = next;
        client.enabled = false;
        client.touch();
        self.db.update_client(&client).at(Stage::Persist, &name)?;

        if let Some(mapping) = self.builder.build_client_mapping_file(&client) {
            remove_if_exists(&mapping.path)
                .await
                .at(Stage::WriteArtifacts, &name)?;
        }
        self.regenerate(client.protocol)
            .await
            .at(Stage::WriteArtifacts, &name)?;

        info!(identity = %name, "Client disabled");
        Ok(client)
    }

    /// Hard-delete a disabled client, releasing its address.
    pub async fn purge_client(&self, id: &str) -> StageResult<VpnClient> {
        let mut client = self.get_client(id).at(Stage::Load, id)?;
        let name = client.name.clone();
        client.state = client
            .state
            .transition(ClientState::Purged)
            .at(Stage::Validate, &name)?;

        if !self.db.delete_client(&client.id).at(Stage::Purge, &name)? {
            return Err(Error::not_found("client", id)).at(Stage::Purge, &name);
        }
        if let Some(mapping) = self.builder.build_client_mapping_file(&client) {
            remove_if_exists(&mapping.path)
                .await
                .at(Stage::Purge, &name)?;
        }

        info!(identity = %name, address = %client.tunnel_address, "Client purged");
        Ok(client)
    }

    /// Issue fresh key material for an active client, keeping its address.
    pub async fn rekey_client(&self, id: &str) -> StageResult<Enrollment> {
        let mut client = self.get_client(id).at(Stage::Load, id)?;
        let name = client.name.clone();
        if !client.is_active() {
            return Err(Error::InvalidStateTransition {
                from: client.state.to_string(),
                to: "rekeyed".to_string(),
            })
            .at(Stage::Validate, &name);
        }

        let material = self
            .server_material(client.protocol)
            .await
            .at(Stage::ServerMaterial, &name)?;

        let issued = match client.protocol {
            Protocol::OpenVpn => {
                // Explicit revoke-before-reissue; a previous failed attempt may
                // already have revoked it
                if self.ca.has_unrevoked_certificate(&name) {
                    if let Err(e) = self.ca.revoke_client_certificate(&name).await {
                        if !self.ca.has_unrevoked_certificate(&name) {
                            self.drop_stored_artifacts(&mut client);
                        }
                        return Err(e).at(Stage::RevokeCertificate, &name);
                    }
                }
                match self.ca.issue_client_certificate(&name).await {
                    Ok(issued) => Some(issued),
                    Err(e) => {
                        self.drop_stored_artifacts(&mut client);
                        return Err(e).at(Stage::IssueCertificate, &name);
                    }
                }
            }
            Protocol::WireGuard => {
                self.assign_wireguard_keys(&mut client).await?;
                None
            }
        };

        client.last_generated_at = Some(chrono::Utc::now().timestamp());
        let bundle = self
            .builder
            .build_client_bundle(&client, &material, issued.as_ref())
            .at(Stage::Render, &name)?;
        let router_script = self
            .builder
            .build_router_script(&client, &material)
            .at(Stage::Render, &name)?;

        client.generated_bundle = Some(bundle.clone());
        client.generated_script = Some(router_script.clone());
        client.touch();
        self.db.update_client(&client).at(Stage::Persist, &name)?;

        self.regenerate(client.protocol)
            .await
            .at(Stage::WriteArtifacts, &name)?;

        info!(identity = %name, "Client re-keyed");
        Ok(Enrollment {
            client,
            bundle,
            router_script,
        })
    }

    /// Forget the stored bundle and script of a client whose certificate was
    /// revoked, so they are never handed out again. A later retry of the rekey
    /// issues fresh ones.
    fn drop_stored_artifacts(&self, client: &mut VpnClient) {
        client.generated_bundle = None;
        client.generated_script = None;
        client.touch();
        if let Err(e) = self.db.update_client(client) {
            warn!(identity = %client.name, "Failed to clear stale artifacts: {}", e);
        }
    }

    /// Change the LAN routed behind an active client.
    pub async fn update_routed_subnet(
        &self,
        id: &str,
        subnet: Option<Ipv4Network>,
    ) -> StageResult<VpnClient> {
        let mut client = self.get_client(id).at(Stage::Load, id)?;
        let name = client.name.clone();
        if !client.is_active() {
            return Err(Error::InvalidStateTransition {
                from: client.state.to_string(),
                to: "updated".to_string(),
            })
            .at(Stage::Validate, &name);
        }
        self.check_routed_subnet(subnet).at(Stage::Validate, &name)?;

        client.routed_subnet = subnet;
        client.touch();
        self.db.update_client(&client).at(Stage::Persist, &name)?;

        self.regenerate(client.protocol)
            .await
            .at(Stage::WriteArtifacts, &name)?;

        info!(
            identity = %name,
            subnet = %subnet.map(|s| s.to_string()).unwrap_or_else(|| "none".to_string()),
            "Routed subnet updated"
        );
        Ok(client)
    }

    // ------------------------------------------------------------------------
    // Artifacts
    // ------------------------------------------------------------------------

    /// The client-side configuration, re-rendered if it was never stored.
    pub async fn client_bundle(&self, id: &str) -> StageResult<String> {
        let client = self.get_client(id).at(Stage::Load, id)?;
        if let Some(bundle) = &client.generated_bundle {
            return Ok(bundle.clone());
        }

        let name = client.name.clone();
        let material = self
            .server_material(client.protocol)
            .await
            .at(Stage::ServerMaterial, &name)?;
        let issued = match client.protocol {
            Protocol::OpenVpn => Some(
                self.ca
                    .read_client_certificate(&name)
                    .await
                    .at(Stage::Load, &name)?,
            ),
            Protocol::WireGuard => None,
        };
        self.builder
            .build_client_bundle(&client, &material, issued.as_ref())
            .at(Stage::Render, &name)
    }

    /// The router provisioning script, re-rendered if it was never stored.
    pub async fn router_script(&self, id: &str) -> StageResult<String> {
        let client = self.get_client(id).at(Stage::Load, id)?;
        if let Some(script) = &client.generated_script {
            return Ok(script.clone());
        }

        let name = client.name.clone();
        let material = self
            .server_material(client.protocol)
            .await
            .at(Stage::ServerMaterial, &name)?;
        self.builder
            .build_router_script(&client, &material)
            .at(Stage::Render, &name)
    }

    // ------------------------------------------------------------------------
    // Server configuration
    // ------------------------------------------------------------------------

    /// Render the server config for the current active set without writing it.
    pub async fn render_server_config(&self, protocol: Protocol) -> StageResult<RenderedConfig> {
        let identity = format!("{}-server", protocol);
        let material = self
            .server_material(protocol)
            .await
            .at(Stage::ServerMaterial, &identity)?;
        let clients = self
            .db
            .list_clients(Some(protocol))
            .at(Stage::Load, &identity)?;
        self.builder
            .build_server_config(protocol, &material, &clients)
            .at(Stage::Render, &identity)
    }

    /// Rewrite the server config (and mapping files) from the active set.
    pub async fn regenerate_server_config(&self, protocol: Protocol) -> StageResult<Regeneration> {
        let identity = format!("{}-server", protocol);
        self.regenerate(protocol).await.at(Stage::WriteArtifacts, &identity)
    }

    async fn regenerate(&self, protocol: Protocol) -> Result<Regeneration> {
        let material = self.server_material(protocol).await?;
        let _render = self.render_lock.lock().await;
        let clients = self.db.list_clients(Some(protocol))?;

        for client in clients.iter().filter(|c| c.is_active()) {
            if let Some(mapping) = self.builder.build_client_mapping_file(client) {
                write_atomic_if_changed(&mapping.path, &mapping.contents, Some(mapping.mode)).await?;
            }
        }

        self.write_server_config(protocol, &material, &clients).await
    }

    async fn write_server_config(
        &self,
        protocol: Protocol,
        material: &ServerKeyMaterial,
        clients: &[VpnClient],
    ) -> Result<Regeneration> {
        let rendered = self.builder.build_server_config(protocol, material, clients)?;
        let changed =
            write_atomic_if_changed(&rendered.path, &rendered.contents, Some(rendered.mode)).await?;
        let peers = clients
            .iter()
            .filter(|c| c.protocol == protocol && c.is_active())
            .count();

        if changed {
            info!(
                "Wrote {} server config {} ({} active client(s))",
                protocol,
                rendered.path.display(),
                peers
            );
        }
        Ok(Regeneration {
            rendered,
            changed,
            peers,
        })
    }
}
