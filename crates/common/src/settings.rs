//! Durable scoped settings
//!
//! Server key material (CA certificate text, control-channel key, WireGuard
//! server keypair) is persisted here rather than read back from root-owned files.

use crate::db::Database;
use crate::Result;

/// Scope holding everything the provisioning subsystem persists.
pub const VPN_SERVER_SCOPE: &str = "vpn_server";

pub const KEY_CA_CERT: &str = "ca_cert";
pub const KEY_TLS_AUTH: &str = "ta_key";
pub const KEY_WG_KEYPAIR: &str = "wg_keypair";

/// Opaque scoped key/value persistence
pub trait SettingsStore: Send + Sync {
    fn get(&self, scope: &str, key: &str) -> Result<Option<String>>;

    fn set(&self, scope: &str, key: &str, value: &str) -> Result<()>;

    /// Store `value` unless the key already holds one; return the value that won.
    fn set_if_absent(&self, scope: &str, key: &str, value: &str) -> Result<String>;

    fn get_or(&self, scope: &str, key: &str, default: &str) -> Result<String> {
        Ok(self.get(scope, key)?.unwrap_or_else(|| default.to_string()))
    }
}

impl SettingsStore for Database {
    fn get(&self, scope: &str, key: &str) -> Result<Option<String>> {
        self.settings_get(scope, key)
    }

    fn set(&self, scope: &str, key: &str, value: &str) -> Result<()> {
        self.settings_set(scope, key, value)
    }

    fn set_if_absent(&self, scope: &str, key: &str, value: &str) -> Result<String> {
        self.settings_set_if_absent(scope, key, value)
    }
}
