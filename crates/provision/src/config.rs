//! Provisioner configuration

use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use sitelink_common::exec::CommandSpec;
use std::path::PathBuf;
use std::time::Duration;

/// Provisioner configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisionerConfig {
    /// Store directory path
    pub store_path: PathBuf,

    /// Tunnel network configuration
    pub network: NetworkConfig,

    /// Certificate-based tunnel configuration
    pub openvpn: OpenVpnConfig,

    /// Key-based tunnel configuration
    pub wireguard: WireGuardConfig,

    /// External tool execution
    pub execution: ExecutionConfig,

    /// Remote router script settings
    pub router: RouterConfig,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            store_path: sitelink_common::default_store_path(),
            network: NetworkConfig::default(),
            openvpn: OpenVpnConfig::default(),
            wireguard: WireGuardConfig::default(),
            execution: ExecutionConfig::default(),
            router: RouterConfig::default(),
        }
    }
}

/// Tunnel network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Subnet tunnel addresses are drawn from; the first host is the hub
    pub subnet: Ipv4Network,

    /// Hostname or address remote routers dial
    pub public_endpoint: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            subnet: Ipv4Network::new(std::net::Ipv4Addr::new(10, 200, 1, 0), 24)
                .unwrap_or_else(|_| Ipv4Network::from(std::net::Ipv4Addr::new(10, 200, 1, 0))),
            public_endpoint: "vpn.example.net".to_string(),
        }
    }
}

/// Transport used by the certificate-based tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Udp,
    Tcp,
}

impl Default for Transport {
    fn default() -> Self {
        Self::Udp
    }
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transport::Udp => write!(f, "udp"),
            Transport::Tcp => write!(f, "tcp"),
        }
    }
}

/// OpenVPN and easy-rsa configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenVpnConfig {
    pub port: u16,

    pub transport: Transport,

    /// easy-rsa entry script
    pub easyrsa_bin: PathBuf,

    /// Working directory easy-rsa runs in
    pub easyrsa_dir: PathBuf,

    /// PKI store (`EASYRSA_PKI`)
    pub pki_dir: PathBuf,

    /// Directory the tunnel daemon reads certificates, keys and `ccd/` from
    pub server_dir: PathBuf,

    pub openvpn_bin: String,

    pub log_dir: PathBuf,
}

impl Default for OpenVpnConfig {
    fn default() -> Self {
        Self {
            port: 1194,
            transport: Transport::Udp,
            easyrsa_bin: PathBuf::from("/usr/share/easy-rsa/easyrsa"),
            easyrsa_dir: PathBuf::from("/etc/openvpn/easy-rsa"),
            pki_dir: PathBuf::from("/etc/openvpn/easy-rsa/pki"),
            server_dir: PathBuf::from("/etc/openvpn/server"),
            openvpn_bin: "openvpn".to_string(),
            log_dir: PathBuf::from("/var/log/openvpn"),
        }
    }
}

impl OpenVpnConfig {
    pub fn server_config_path(&self) -> PathBuf {
        self.server_dir.join("server.conf")
    }

    pub fn ccd_dir(&self) -> PathBuf {
        self.server_dir.join("ccd")
    }

    pub fn mapping_path(&self, name: &str) -> PathBuf {
        self.ccd_dir().join(name)
    }
}

/// Where key-based keypairs come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeyBackend {
    /// `wg genkey` / `wg pubkey` / `wg genpsk`
    WgTool,
    /// In-process x25519
    Native,
}

impl Default for KeyBackend {
    fn default() -> Self {
        Self::WgTool
    }
}

/// WireGuard configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WireGuardConfig {
    pub port: u16,

    pub interface: String,

    /// Server config file, written mode 0600
    pub config_path: PathBuf,

    pub wg_bin: String,

    /// Interface NAT'd traffic leaves through
    pub egress_interface: String,

    pub key_backend: KeyBackend,
}

impl Default for WireGuardConfig {
    fn default() -> Self {
        Self {
            port: 51820,
            interface: "wg0".to_string(),
            config_path: PathBuf::from("/etc/wireguard/wg0.conf"),
            wg_bin: "wg".to_string(),
            egress_interface: "eth0".to_string(),
            key_backend: KeyBackend::WgTool,
        }
    }
}

/// External tool execution settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Wrapper prepended to privileged invocations, e.g. `["sudo", "-n"]`
    pub privilege_prefix: Vec<String>,

    pub default_timeout_secs: u64,

    /// Certificate issuance and keypair generation
    pub keygen_timeout_secs: u64,

    /// Diffie-Hellman parameter generation
    pub dh_timeout_secs: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            privilege_prefix: Vec::new(),
            default_timeout_secs: 60,
            keygen_timeout_secs: 30,
            dh_timeout_secs: 600,
        }
    }
}

impl ExecutionConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    pub fn keygen_timeout(&self) -> Duration {
        Duration::from_secs(self.keygen_timeout_secs)
    }

    pub fn dh_timeout(&self) -> Duration {
        Duration::from_secs(self.dh_timeout_secs)
    }

    /// Apply the privilege prefix to a command.
    pub fn privileged(&self, spec: CommandSpec) -> CommandSpec {
        spec.with_prefix(&self.privilege_prefix)
    }
}

/// Settings baked into generated router scripts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    pub openvpn_interface: String,
    pub wireguard_interface: String,
    pub wireguard_listen_port: u16,
    pub mtu: u16,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            openvpn_interface: "ovpn-hub".to_string(),
            wireguard_interface: "wg-hub".to_string(),
            wireguard_listen_port: 13231,
            mtu: 1420,
        }
    }
}

impl ProvisionerConfig {
    /// Load configuration from file
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &std::path::Path) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the database path
    pub fn db_path(&self) -> PathBuf {
        self.store_path.join("state.db")
    }

    /// Point every file-system location below `root`.
    pub fn rooted_at(root: &std::path::Path) -> Self {
        let mut config = Self {
            store_path: root.join("state"),
            ..Self::default()
        };
        config.openvpn.easyrsa_dir = root.join("easy-rsa");
        config.openvpn.pki_dir = root.join("easy-rsa").join("pki");
        config.openvpn.server_dir = root.join("openvpn").join("server");
        config.openvpn.log_dir = root.join("log");
        config.wireguard.config_path = root.join("wireguard").join("wg0.conf");
        config
    }
}
