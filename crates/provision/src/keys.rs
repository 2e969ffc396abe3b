//! Key-based tunnel key material
//!
//! Keypairs and pre-shared keys come either from the `wg` tool or from an
//! in-process x25519 implementation, selected by [`KeyBackend`].

use crate::config::{ExecutionConfig, KeyBackend, WireGuardConfig};
use base64::{engine::general_purpose::STANDARD, Engine};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sitelink_common::exec::{CommandRunner, CommandSpec};
use sitelink_common::settings::{KEY_WG_KEYPAIR, VPN_SERVER_SCOPE};
use sitelink_common::{Error, Result, SettingsStore};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};
use x25519_dalek::{PublicKey, StaticSecret};

/// WireGuard key pair, both halves base64
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WgKeyPair {
    pub private_key: String,
    pub public_key: String,
}

impl std::fmt::Debug for WgKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WgKeyPair")
            .field("private_key", &"<redacted>")
            .field("public_key", &self.public_key)
            .finish()
    }
}

/// Generate a keypair in-process.
///
/// The private half is the raw secret; x25519 clamps it on use, as `wg` does.
pub fn native_keypair() -> WgKeyPair {
    let secret = StaticSecret::random_from_rng(rand::thread_rng());
    let public = PublicKey::from(&secret);

    WgKeyPair {
        private_key: STANDARD.encode(secret.to_bytes()),
        public_key: STANDARD.encode(public.as_bytes()),
    }
}

/// Generate a 256-bit pre-shared key in-process.
pub fn native_preshared_key() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    STANDARD.encode(bytes)
}

/// Keypair and PSK generation plus the persisted server keypair
pub struct KeyPairManager {
    runner: Arc<dyn CommandRunner>,
    settings: Arc<dyn SettingsStore>,
    wg_bin: String,
    backend: KeyBackend,
    execution: ExecutionConfig,
    lock: Mutex<()>,
}

impl KeyPairManager {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        settings: Arc<dyn SettingsStore>,
        wireguard: &WireGuardConfig,
        execution: ExecutionConfig,
    ) -> Self {
        Self {
            runner,
            settings,
            wg_bin: wireguard.wg_bin.clone(),
            backend: wireguard.key_backend,
            execution,
            lock: Mutex::new(()),
        }
    }

    async fn wg(&self, subcommand: &str, stdin: Option<&str>) -> Result<String> {
        let mut spec = CommandSpec::new(&self.wg_bin, self.execution.keygen_timeout()).arg(subcommand);
        if let Some(input) = stdin {
            spec = spec.stdin(format!("{}\n", input));
        }
        let output = self.runner.run_checked(&spec).await?;
        let value = output.stdout.trim().to_string();
        if value.is_empty() {
            return Err(Error::ProcessFailure {
                program: self.wg_bin.clone(),
                status: output.status,
                stderr: format!("wg {} produced no output", subcommand),
            });
        }
        Ok(value)
    }

    /// A fresh private/public keypair.
    pub async fn generate_key_pair(&self) -> Result<WgKeyPair> {
        match self.backend {
            KeyBackend::Native => Ok(native_keypair()),
            KeyBackend::WgTool => {
                let private_key = self.wg("genkey", None).await?;
                let public_key = self.wg("pubkey", Some(&private_key)).await?;
                debug!("Generated keypair via {}", self.wg_bin);
                Ok(WgKeyPair {
                    private_key,
                    public_key,
                })
            }
        }
    }

    /// A fresh symmetric pre-shared key.
    pub async fn generate_preshared_key(&self) -> Result<String> {
        match self.backend {
            KeyBackend::Native => Ok(native_preshared_key()),
            KeyBackend::WgTool => self.wg("genpsk", None).await,
        }
    }

    /// Return the persisted server keypair, creating it on first use.
    ///
    /// The settings store arbitrates between racing processes: whichever
    /// keypair lands first is the one every caller gets back.
    pub async fn ensure_server_keys(&self) -> Result<WgKeyPair> {
        let _guard = self.lock.lock().await;
        if let Some(existing) = self.stored_server_keys()? {
            return Ok(existing);
        }

        let candidate = self.generate_key_pair().await?;
        let encoded = serde_json::to_string(&candidate)?;
        let winner = self
            .settings
            .set_if_absent(VPN_SERVER_SCOPE, KEY_WG_KEYPAIR, &encoded)?;
        let keys: WgKeyPair = serde_json::from_str(&winner)?;

        if keys == candidate {
            info!(public_key = %keys.public_key, "Server keypair generated");
        }
        Ok(keys)
    }

    fn stored_server_keys(&self) -> Result<Option<WgKeyPair>> {
        match self.settings.get(VPN_SERVER_SCOPE, KEY_WG_KEYPAIR)? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Public half of the server keypair, if one exists.
    pub fn server_public_key(&self) -> Result<String> {
        self.stored_server_keys()?
            .map(|k| k.public_key)
            .ok_or_else(|| Error::NotInitialized("server keypair has not been generated".to_string()))
    }
}
