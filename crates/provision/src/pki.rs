//! Certificate authority lifecycle
//!
//! Drives easy-rsa against the PKI store and copies the artifacts the tunnel
//! daemon needs into the server directory. Every mutating operation runs under
//! one lock so issuance, revocation and CRL generation never interleave.

use crate::config::{ExecutionConfig, OpenVpnConfig};
use serde::Serialize;
use sitelink_common::exec::{CommandRunner, CommandSpec};
use sitelink_common::fsutil::{remove_if_exists, write_atomic};
use sitelink_common::settings::{KEY_CA_CERT, KEY_TLS_AUTH, VPN_SERVER_SCOPE};
use sitelink_common::{validate_client_name, Error, Result, SettingsStore};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Entity name easy-rsa issues the hub certificate under
pub const SERVER_ENTITY: &str = "server";

/// Which prerequisites of the certificate-based tunnel are in place
#[derive(Debug, Clone, Default, Serialize)]
pub struct Readiness {
    pub openvpn_installed: bool,
    pub easyrsa_installed: bool,
    pub pki_initialized: bool,
    pub ca_cert_exists: bool,
    pub server_cert_exists: bool,
    pub dh_exists: bool,
    pub ta_key_exists: bool,
}

impl Readiness {
    pub fn all_ready(&self) -> bool {
        self.missing().is_empty()
    }

    /// Names of the prerequisites not yet satisfied.
    pub fn missing(&self) -> Vec<&'static str> {
        [
            (self.openvpn_installed, "openvpn"),
            (self.easyrsa_installed, "easy-rsa"),
            (self.pki_initialized, "pki"),
            (self.ca_cert_exists, "ca certificate"),
            (self.server_cert_exists, "server certificate"),
            (self.dh_exists, "dh parameters"),
            (self.ta_key_exists, "control-channel key"),
        ]
        .into_iter()
        .filter(|(ok, _)| !ok)
        .map(|(_, name)| name)
        .collect()
    }
}

/// A freshly issued client certificate and its private key
#[derive(Debug, Clone)]
pub struct IssuedCertificate {
    pub name: String,
    pub certificate: String,
    pub private_key: String,
}

/// Outcome of a single bootstrap step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Created,
    Skipped,
}

/// Per-step record of what [`CertificateAuthorityManager::bootstrap`] did
#[derive(Debug, Clone, Default, Serialize)]
pub struct BootstrapReport {
    pub steps: Vec<(String, StepOutcome)>,
}

impl BootstrapReport {
    fn record(&mut self, step: &str, outcome: StepOutcome) {
        self.steps.push((step.to_string(), outcome));
    }

    pub fn created(&self) -> usize {
        self.steps
            .iter()
            .filter(|(_, o)| *o == StepOutcome::Created)
            .count()
    }
}

/// easy-rsa backed certificate authority
pub struct CertificateAuthorityManager {
    runner: Arc<dyn CommandRunner>,
    settings: Arc<dyn SettingsStore>,
    openvpn: OpenVpnConfig,
    execution: ExecutionConfig,
    lock: Mutex<()>,
}

impl CertificateAuthorityManager {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        settings: Arc<dyn SettingsStore>,
        openvpn: OpenVpnConfig,
        execution: ExecutionConfig,
    ) -> Self {
        Self {
            runner,
            settings,
            openvpn,
            execution,
            lock: Mutex::new(()),
        }
    }

    // ========================================================================
    // Paths
    // ========================================================================

    fn pki_path(&self, rel: &str) -> PathBuf {
        self.openvpn.pki_dir.join(rel)
    }

    fn server_path(&self, name: &str) -> PathBuf {
        self.openvpn.server_dir.join(name)
    }

    fn issued_cert(&self, name: &str) -> PathBuf {
        self.pki_path("issued").join(format!("{}.crt", name))
    }

    fn private_key(&self, name: &str) -> PathBuf {
        self.pki_path("private").join(format!("{}.key", name))
    }

    fn request(&self, name: &str) -> PathBuf {
        self.pki_path("reqs").join(format!("{}.req", name))
    }

    fn is_initialized(&self) -> bool {
        self.pki_path("openssl-easyrsa.cnf").exists()
    }

    /// CA exists in the PKI store and its certificate has been published.
    fn has_ca(&self) -> bool {
        self.pki_path("ca.crt").exists() && self.stored(KEY_CA_CERT)
    }

    fn has_server_certificate(&self) -> bool {
        self.server_path("server.crt").exists() && self.server_path("server.key").exists()
    }

    fn has_control_channel_key(&self) -> bool {
        self.server_path("ta.key").exists() && self.stored(KEY_TLS_AUTH)
    }

    fn stored(&self, key: &str) -> bool {
        matches!(self.settings.get(VPN_SERVER_SCOPE, key), Ok(Some(_)))
    }

    /// Whether the PKI index records a revocation for `name`.
    async fn is_revoked(&self, name: &str) -> Result<bool> {
        let index = match tokio::fs::read_to_string(self.pki_path("index.txt")).await {
            Ok(index) => index,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        Ok(index
            .lines()
            .filter(|line| line.starts_with('R'))
            .any(|line| index_common_name(line) == Some(name)))
    }

    fn easyrsa(&self, args: &[&str], timeout: Duration) -> CommandSpec {
        let spec = CommandSpec::new(self.openvpn.easyrsa_bin.display().to_string(), timeout)
            .args(args.iter().copied())
            .current_dir(&self.openvpn.easyrsa_dir)
            .env("EASYRSA_BATCH", "1")
            .env("EASYRSA_PKI", self.openvpn.pki_dir.display().to_string());
        self.execution.privileged(spec)
    }

    fn require_initialized(&self) -> Result<()> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(Error::NotInitialized(format!(
                "PKI store at {} is not initialized",
                self.openvpn.pki_dir.display()
            )))
        }
    }

    fn require_ca(&self) -> Result<()> {
        self.require_initialized()?;
        if self.has_ca() {
            Ok(())
        } else {
            Err(Error::NotInitialized("certificate authority has not been created".to_string()))
        }
    }

    async fn probe(&self, spec: CommandSpec) -> bool {
        match self.runner.execute(&spec).await {
            Ok(output) => output.success,
            Err(e) => {
                debug!("Probe {} failed: {}", spec.tool(), e);
                false
            }
        }
    }

    // ========================================================================
    // Readiness and bootstrap
    // ========================================================================

    /// Report which prerequisites are satisfied. Runs only version probes.
    pub async fn check_readiness(&self) -> Readiness {
        let timeout = self.execution.default_timeout();
        let openvpn_installed = self
            .probe(CommandSpec::new(&self.openvpn.openvpn_bin, timeout).arg("--version"))
            .await;
        let easyrsa_installed = self
            .probe(CommandSpec::new(self.openvpn.easyrsa_bin.display().to_string(), timeout).arg("--version"))
            .await;

        Readiness {
            openvpn_installed,
            easyrsa_installed,
            pki_initialized: self.is_initialized(),
            ca_cert_exists: self.has_ca(),
            server_cert_exists: self.has_server_certificate(),
            dh_exists: self.server_path("dh.pem").exists(),
            ta_key_exists: self.has_control_channel_key(),
        }
    }

    /// Create the PKI store layout. Returns false when it already existed.
    pub async fn initialize_pki(&self) -> Result<bool> {
        let _guard = self.lock.lock().await;
        if self.is_initialized() {
            debug!("PKI already initialized at {}", self.openvpn.pki_dir.display());
            return Ok(false);
        }

        tokio::fs::create_dir_all(&self.openvpn.easyrsa_dir).await?;
        tokio::fs::create_dir_all(self.openvpn.ccd_dir()).await?;

        self.runner
            .run_checked(&self.easyrsa(&["init-pki"], self.execution.default_timeout()))
            .await?;

        info!("PKI initialized at {}", self.openvpn.pki_dir.display());
        Ok(true)
    }

    /// Run every missing setup step in order, skipping those already done.
    pub async fn bootstrap(&self) -> Result<BootstrapReport> {
        let mut report = BootstrapReport::default();

        let created = self.initialize_pki().await?;
        report.record("init-pki", if created { StepOutcome::Created } else { StepOutcome::Skipped });

        if self.has_ca() {
            report.record("ca", StepOutcome::Skipped);
        } else {
            self.generate_ca_certificate().await?;
            report.record("ca", StepOutcome::Created);
        }

        if self.has_server_certificate() {
            report.record("server-cert", StepOutcome::Skipped);
        } else {
            self.generate_server_certificate().await?;
            report.record("server-cert", StepOutcome::Created);
        }

        if self.server_path("dh.pem").exists() {
            report.record("dh", StepOutcome::Skipped);
        } else {
            self.generate_dh_parameters().await?;
            report.record("dh", StepOutcome::Created);
        }

        if self.has_control_channel_key() {
            report.record("tls-auth", StepOutcome::Skipped);
        } else {
            self.generate_control_channel_key().await?;
            report.record("tls-auth", StepOutcome::Created);
        }

        if self.server_path("crl.pem").exists() {
            report.record("crl", StepOutcome::Skipped);
        } else {
            self.generate_crl().await?;
            report.record("crl", StepOutcome::Created);
        }

        info!("PKI bootstrap finished, {} step(s) created", report.created());
        Ok(report)
    }

    // ========================================================================
    // Server material
    // ========================================================================

    /// Create the self-signed CA and publish its certificate.
    pub async fn generate_ca_certificate(&self) -> Result<String> {
        let _guard = self.lock.lock().await;
        self.require_initialized()?;
        if self.has_ca() {
            return Err(Error::already_exists("certificate", "ca"));
        }

        // A CA built earlier but never published is published, not rebuilt
        let built = !self.pki_path("ca.crt").exists();
        if built {
            let spec = self.easyrsa(&["build-ca", "nopass"], self.execution.keygen_timeout());
            if let Err(e) = self.runner.run_checked(&spec).await {
                self.discard_ca().await;
                return Err(e);
            }
        }

        let ca_cert = match self.publish_ca().await {
            Ok(ca_cert) => ca_cert,
            Err(e) => {
                if built {
                    self.discard_ca().await;
                } else {
                    discard(&[self.server_path("ca.crt")]).await;
                }
                return Err(e);
            }
        };

        info!("CA certificate generated");
        Ok(ca_cert)
    }

    async fn publish_ca(&self) -> Result<String> {
        let ca_cert = tokio::fs::read_to_string(self.pki_path("ca.crt")).await?;
        write_atomic(&self.server_path("ca.crt"), &ca_cert, Some(0o644)).await?;
        self.settings.set(VPN_SERVER_SCOPE, KEY_CA_CERT, &ca_cert)?;
        Ok(ca_cert)
    }

    async fn discard_ca(&self) {
        discard(&[
            self.pki_path("ca.crt"),
            self.pki_path("private/ca.key"),
            self.server_path("ca.crt"),
        ])
        .await;
    }

    /// Issue the hub certificate and install it with its key.
    pub async fn generate_server_certificate(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.require_ca()?;
        if self.issued_cert(SERVER_ENTITY).exists() && self.has_server_certificate() {
            return Err(Error::already_exists("certificate", SERVER_ENTITY));
        }

        // Either the whole set ends up installed or none of it remains
        let built = !self.issued_cert(SERVER_ENTITY).exists();
        let result = async {
            if built {
                let spec = self.easyrsa(
                    &["build-server-full", SERVER_ENTITY, "nopass"],
                    self.execution.keygen_timeout(),
                );
                self.runner.run_checked(&spec).await?;
            }
            let cert = tokio::fs::read_to_string(self.issued_cert(SERVER_ENTITY)).await?;
            let key = tokio::fs::read_to_string(self.private_key(SERVER_ENTITY)).await?;
            write_atomic(&self.server_path("server.crt"), &cert, Some(0o644)).await?;
            write_atomic(&self.server_path("server.key"), &key, Some(0o600)).await?;
            Ok::<_, Error>(())
        }
        .await;

        if let Err(e) = result {
            if built {
                self.discard_entity(SERVER_ENTITY).await;
            }
            discard(&[self.server_path("server.crt"), self.server_path("server.key")]).await;
            return Err(e);
        }

        info!("Server certificate generated");
        Ok(())
    }

    /// Compute Diffie-Hellman parameters under the long DH timeout.
    pub async fn generate_dh_parameters(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.require_initialized()?;

        info!(
            "Generating DH parameters (timeout {}s)",
            self.execution.dh_timeout_secs
        );
        self.runner
            .run_checked(&self.easyrsa(&["gen-dh"], self.execution.dh_timeout()))
            .await?;

        let dh = tokio::fs::read_to_string(self.pki_path("dh.pem")).await?;
        write_atomic(&self.server_path("dh.pem"), &dh, Some(0o644)).await?;

        info!("DH parameters generated");
        Ok(())
    }

    /// Create the tls-auth key and persist it for client bundles.
    pub async fn generate_control_channel_key(&self) -> Result<String> {
        let _guard = self.lock.lock().await;
        tokio::fs::create_dir_all(&self.openvpn.server_dir).await?;

        let staging = self.server_path(".ta.key.new");
        let spec = self.execution.privileged(
            CommandSpec::new(&self.openvpn.openvpn_bin, self.execution.keygen_timeout())
                .args(["--genkey", "secret"])
                .arg(staging.display().to_string()),
        );
        if let Err(e) = self.runner.run_checked(&spec).await {
            discard(&[staging]).await;
            return Err(e);
        }

        let result = async {
            let key = tokio::fs::read_to_string(&staging).await?;
            write_atomic(&self.server_path("ta.key"), &key, Some(0o600)).await?;
            self.settings.set(VPN_SERVER_SCOPE, KEY_TLS_AUTH, &key)?;
            Ok::<_, Error>(key)
        }
        .await;
        discard(&[staging]).await;

        match result {
            Ok(key) => {
                info!("Control-channel key generated");
                Ok(key)
            }
            Err(e) => {
                discard(&[self.server_path("ta.key")]).await;
                Err(e)
            }
        }
    }

    /// Regenerate the CRL and install it for the daemon.
    pub async fn generate_crl(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.require_ca()?;
        self.write_crl().await
    }

    async fn write_crl(&self) -> Result<()> {
        self.runner
            .run_checked(&self.easyrsa(&["gen-crl"], self.execution.default_timeout()))
            .await?;
        let crl = tokio::fs::read_to_string(self.pki_path("crl.pem")).await?;
        write_atomic(&self.server_path("crl.pem"), &crl, Some(0o644)).await?;
        debug!("CRL installed");
        Ok(())
    }

    /// CA certificate text as persisted in the settings store.
    pub fn ca_certificate(&self) -> Result<String> {
        self.settings
            .get(VPN_SERVER_SCOPE, KEY_CA_CERT)?
            .ok_or_else(|| Error::NotInitialized("CA certificate has not been generated".to_string()))
    }

    /// Control-channel key text as persisted in the settings store.
    pub fn control_channel_key(&self) -> Result<String> {
        self.settings
            .get(VPN_SERVER_SCOPE, KEY_TLS_AUTH)?
            .ok_or_else(|| Error::NotInitialized("control-channel key has not been generated".to_string()))
    }

    // ========================================================================
    // Client certificates
    // ========================================================================

    /// Whether `name` holds an issued, unrevoked certificate.
    pub fn has_unrevoked_certificate(&self, name: &str) -> bool {
        self.issued_cert(name).exists()
    }

    /// Issue a certificate for `name`; revoke first to re-key.
    pub async fn issue_client_certificate(&self, name: &str) -> Result<IssuedCertificate> {
        validate_client_name(name)?;
        let _guard = self.lock.lock().await;
        self.require_ca()?;
        if self.has_unrevoked_certificate(name) {
            return Err(Error::already_exists("certificate", name));
        }

        let spec = self.easyrsa(
            &["build-client-full", name, "nopass"],
            self.execution.keygen_timeout(),
        );
        if let Err(e) = self.runner.run_checked(&spec).await {
            self.discard_entity(name).await;
            return Err(e);
        }

        let read = async {
            let certificate = tokio::fs::read_to_string(self.issued_cert(name)).await?;
            let private_key = tokio::fs::read_to_string(self.private_key(name)).await?;
            Ok::<_, Error>((certificate, private_key))
        };
        let (certificate, private_key) = match read.await {
            Ok(pair) => pair,
            Err(e) => {
                self.discard_entity(name).await;
                return Err(e);
            }
        };

        info!(common_name = %name, "Client certificate issued");
        Ok(IssuedCertificate {
            name: name.to_string(),
            certificate,
            private_key,
        })
    }

    /// Read back the current certificate and key of `name`.
    pub async fn read_client_certificate(&self, name: &str) -> Result<IssuedCertificate> {
        if !self.has_unrevoked_certificate(name) {
            return Err(Error::not_found("certificate", name));
        }
        Ok(IssuedCertificate {
            name: name.to_string(),
            certificate: tokio::fs::read_to_string(self.issued_cert(name)).await?,
            private_key: tokio::fs::read_to_string(self.private_key(name)).await?,
        })
    }

    /// Revoke `name` and publish a fresh CRL.
    ///
    /// A name that is already revoked only gets the CRL republished, so a
    /// retry after a failed CRL write still reaches the daemon.
    pub async fn revoke_client_certificate(&self, name: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        if !self.has_unrevoked_certificate(name) {
            if self.is_revoked(name).await? {
                self.write_crl().await?;
                info!(common_name = %name, "Certificate already revoked, CRL republished");
                return Ok(());
            }
            return Err(Error::not_found("certificate", name));
        }

        self.runner
            .run_checked(&self.easyrsa(&["revoke", name], self.execution.default_timeout()))
            .await?;
        self.write_crl().await?;

        info!(common_name = %name, "Client certificate revoked");
        Ok(())
    }

    /// Drop the files of a half-issued entity so it is never treated as valid.
    async fn discard_entity(&self, name: &str) {
        discard(&[self.issued_cert(name), self.private_key(name), self.request(name)]).await;
    }
}

/// Common name of an `index.txt` entry (`.../CN=name` or a bare name).
fn index_common_name(line: &str) -> Option<&str> {
    let subject = line.rsplit('\t').next()?;
    let cn = subject
        .split('/')
        .find_map(|part| part.strip_prefix("CN="))
        .unwrap_or(subject);
    Some(cn)
}

async fn discard(paths: &[PathBuf]) {
    for path in paths {
        if let Err(e) = remove_if_exists(path).await {
            warn!("Failed to remove partial artifact {}: {}", path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sitelink_common::testing::{FakeFailure, FakeRunner};
    use sitelink_common::{Database, ErrorKind};
    use tempfile::TempDir;

    fn manager(tmp: &TempDir) -> (Arc<FakeRunner>, Arc<Database>, CertificateAuthorityManager) {
        let config = crate::config::ProvisionerConfig::rooted_at(tmp.path());
        let runner = Arc::new(FakeRunner::new());
        let db = Arc::new(Database::open_memory().unwrap());
        let ca = CertificateAuthorityManager::new(
            runner.clone(),
            db.clone(),
            config.openvpn,
            config.execution,
        );
        (runner, db, ca)
    }

    #[tokio::test]
    async fn test_bootstrap_then_ready() {
        let tmp = TempDir::new().unwrap();
        let (runner, _db, ca) = manager(&tmp);

        assert!(!ca.check_readiness().await.all_ready());

        let report = ca.bootstrap().await.unwrap();
        assert_eq!(report.created(), 6);
        assert!(ca.check_readiness().await.all_ready());
        assert!(ca.ca_certificate().unwrap().contains("BEGIN CERTIFICATE"));
        assert!(ca.control_channel_key().unwrap().contains("OpenVPN Static key"));

        // Second run touches nothing
        runner.reset_calls();
        let report = ca.bootstrap().await.unwrap();
        assert_eq!(report.created(), 0);
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let (runner, _db, ca) = manager(&tmp);
        assert!(ca.initialize_pki().await.unwrap());
        assert!(!ca.initialize_pki().await.unwrap());
        assert_eq!(runner.count("init-pki"), 1);
    }

    #[tokio::test]
    async fn test_server_cert_requires_ca() {
        let tmp = TempDir::new().unwrap();
        let (_runner, _db, ca) = manager(&tmp);
        ca.initialize_pki().await.unwrap();
        let err = ca.generate_server_certificate().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotInitialized);
    }

    #[tokio::test]
    async fn test_issue_duplicate_and_revoke() {
        let tmp = TempDir::new().unwrap();
        let (runner, _db, ca) = manager(&tmp);
        ca.bootstrap().await.unwrap();

        let issued = ca.issue_client_certificate("site-a").await.unwrap();
        assert!(issued.certificate.contains("cert-site-a"));
        assert!(issued.private_key.contains("key-site-a"));

        let err = ca.issue_client_certificate("site-a").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);

        ca.revoke_client_certificate("site-a").await.unwrap();
        assert!(!ca.has_unrevoked_certificate("site-a"));
        let crl = std::fs::read_to_string(tmp.path().join("openvpn/server/crl.pem")).unwrap();
        assert!(crl.contains("site-a"));

        // Reissue after explicit revoke
        ca.issue_client_certificate("site-a").await.unwrap();
        assert_eq!(runner.count("build-client-full"), 2);
    }

    #[tokio::test]
    async fn test_revoke_unknown_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let (runner, _db, ca) = manager(&tmp);
        ca.bootstrap().await.unwrap();
        runner.reset_calls();

        let err = ca.revoke_client_certificate("ghost").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(runner.count("gen-crl"), 0);
    }

    #[tokio::test]
    async fn test_revoke_retry_publishes_crl() {
        let tmp = TempDir::new().unwrap();
        let (runner, _db, ca) = manager(&tmp);
        ca.bootstrap().await.unwrap();
        ca.issue_client_certificate("site-b").await.unwrap();
        let crl_path = tmp.path().join("openvpn/server/crl.pem");

        runner.fail_on("gen-crl", FakeFailure::Exit("crl write failed".into()));
        let err = ca.revoke_client_certificate("site-b").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProcessFailure);
        assert!(!ca.has_unrevoked_certificate("site-b"));
        assert!(!std::fs::read_to_string(&crl_path).unwrap().contains("site-b"));

        runner.clear_failures();
        ca.revoke_client_certificate("site-b").await.unwrap();
        assert!(std::fs::read_to_string(&crl_path).unwrap().contains("site-b"));
        assert_eq!(runner.count("revoke"), 1);
    }

    #[test]
    fn test_index_common_name() {
        let real = "R\t331231235959Z\t240101000000Z\t0A1B\tunknown\t/CN=site-b";
        assert_eq!(index_common_name(real), Some("site-b"));
        assert_eq!(index_common_name("R\tsite-c"), Some("site-c"));
    }

    #[tokio::test]
    async fn test_failed_server_install_is_not_committed() {
        let tmp = TempDir::new().unwrap();
        let (_runner, _db, ca) = manager(&tmp);
        let key_path = tmp.path().join("openvpn/server/server.key");

        // A directory where the key belongs makes the install fail
        std::fs::create_dir_all(&key_path).unwrap();
        assert!(ca.bootstrap().await.is_err());
        assert!(!tmp.path().join("openvpn/server/server.crt").exists());
        assert!(!tmp.path().join("easy-rsa/pki/issued/server.crt").exists());
        assert!(!ca.check_readiness().await.server_cert_exists);

        std::fs::remove_dir_all(&key_path).unwrap();
        let report = ca.bootstrap().await.unwrap();
        assert!(report
            .steps
            .iter()
            .any(|(step, outcome)| step == "server-cert" && *outcome == StepOutcome::Created));
        assert!(key_path.is_file());
        assert!(ca.check_readiness().await.all_ready());
    }

    #[tokio::test]
    async fn test_failed_ca_publish_is_not_committed() {
        let tmp = TempDir::new().unwrap();
        let (runner, _db, ca) = manager(&tmp);
        ca.initialize_pki().await.unwrap();
        let installed = tmp.path().join("openvpn/server/ca.crt");

        std::fs::create_dir_all(&installed).unwrap();
        assert!(ca.generate_ca_certificate().await.is_err());
        assert!(!tmp.path().join("easy-rsa/pki/ca.crt").exists());
        assert_eq!(ca.ca_certificate().unwrap_err().kind(), ErrorKind::NotInitialized);
        assert!(!ca.check_readiness().await.ca_cert_exists);

        std::fs::remove_dir_all(&installed).unwrap();
        ca.generate_ca_certificate().await.unwrap();
        assert!(ca.ca_certificate().unwrap().contains("fake-ca"));
        assert_eq!(runner.count("build-ca"), 2);
    }

    #[tokio::test]
    async fn test_unpublished_ca_is_published_without_rebuild() {
        let tmp = TempDir::new().unwrap();
        let (runner, db, ca) = manager(&tmp);
        ca.initialize_pki().await.unwrap();
        ca.generate_ca_certificate().await.unwrap();
        db.settings_delete(VPN_SERVER_SCOPE, KEY_CA_CERT).unwrap();
        assert!(!ca.check_readiness().await.ca_cert_exists);

        let report = ca.bootstrap().await.unwrap();
        assert_eq!(report.steps[1], ("ca".to_string(), StepOutcome::Created));
        assert_eq!(runner.count("build-ca"), 1);
        assert!(ca.ca_certificate().is_ok());
    }

    #[tokio::test]
    async fn test_failed_issue_leaves_nothing() {
        let tmp = TempDir::new().unwrap();
        let (runner, _db, ca) = manager(&tmp);
        ca.bootstrap().await.unwrap();

        runner.fail_on("build-client-full", FakeFailure::Exit("openssl: disk full".into()));
        let err = ca.issue_client_certificate("site-b").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProcessFailure);
        assert!(err.to_string().contains("disk full"));
        assert!(!ca.has_unrevoked_certificate("site-b"));
    }

    #[tokio::test]
    async fn test_dh_uses_long_timeout() {
        let tmp = TempDir::new().unwrap();
        let (runner, _db, ca) = manager(&tmp);
        ca.initialize_pki().await.unwrap();

        runner.fail_on("gen-dh", FakeFailure::Timeout);
        let err = ca.generate_dh_parameters().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(err.is_retryable());

        let dh_call = runner
            .calls()
            .into_iter()
            .find(|c| c.tool_args().first().map(String::as_str) == Some("gen-dh"))
            .unwrap();
        assert_eq!(dh_call.timeout, Duration::from_secs(600));

        runner.clear_failures();
        ca.generate_dh_parameters().await.unwrap();
        assert!(tmp.path().join("openvpn/server/dh.pem").exists());
    }

    #[tokio::test]
    async fn test_missing_easyrsa_reported() {
        let tmp = TempDir::new().unwrap();
        let (runner, _db, ca) = manager(&tmp);
        runner.fail_on("init-pki", FakeFailure::Missing);
        let err = ca.initialize_pki().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotInstalled);
    }

    #[tokio::test]
    async fn test_commands_carry_batch_env_and_prefix() {
        let tmp = TempDir::new().unwrap();
        let mut config = crate::config::ProvisionerConfig::rooted_at(tmp.path());
        config.execution.privilege_prefix = vec!["sudo".to_string(), "-n".to_string()];
        let runner = Arc::new(FakeRunner::new());
        let db = Arc::new(Database::open_memory().unwrap());
        let ca = CertificateAuthorityManager::new(runner.clone(), db, config.openvpn, config.execution);

        ca.initialize_pki().await.unwrap();
        let call = &runner.calls()[0];
        assert_eq!(call.program, "sudo");
        assert_eq!(call.env.get("EASYRSA_BATCH").map(String::as_str), Some("1"));
        assert_eq!(call.tool_args(), ["init-pki".to_string()]);
    }
}
