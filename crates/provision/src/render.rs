//! Configuration synthesis
//!
//! Pure functions of their inputs: the same server settings, key material and
//! client set always render byte-identical text, so regenerated output can be
//! diffed before the tunnel daemon picks it up.

use crate::config::{OpenVpnConfig, ProvisionerConfig, RouterConfig, WireGuardConfig};
use crate::keys::WgKeyPair;
use crate::pki::IssuedCertificate;
use ipnetwork::Ipv4Network;
use sitelink_common::fsutil::digest;
use sitelink_common::{Error, Protocol, Result, VpnClient};
use std::net::Ipv4Addr;
use std::path::PathBuf;

/// Server-side key material for one protocol
#[derive(Debug, Clone)]
pub enum ServerKeyMaterial {
    OpenVpn {
        ca_certificate: String,
        control_channel_key: String,
    },
    WireGuard {
        server_keys: WgKeyPair,
    },
}

impl ServerKeyMaterial {
    pub fn protocol(&self) -> Protocol {
        match self {
            ServerKeyMaterial::OpenVpn { .. } => Protocol::OpenVpn,
            ServerKeyMaterial::WireGuard { .. } => Protocol::WireGuard,
        }
    }
}

/// A rendered file and where it belongs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedConfig {
    pub path: PathBuf,
    pub contents: String,
    /// SHA-256 hex of `contents`
    pub digest: String,
    /// Unix permission bits to install with
    pub mode: u32,
}

impl RenderedConfig {
    fn new(path: PathBuf, contents: String, mode: u32) -> Self {
        let digest = digest(&contents);
        Self {
            path,
            contents,
            digest,
            mode,
        }
    }
}

/// Renders server configs, mapping files, client bundles and router scripts
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    subnet: Ipv4Network,
    public_endpoint: String,
    openvpn: OpenVpnConfig,
    wireguard: WireGuardConfig,
    router: RouterConfig,
}

impl ConfigBuilder {
    pub fn new(config: &ProvisionerConfig) -> Self {
        Self {
            subnet: config.network.subnet,
            public_endpoint: config.network.public_endpoint.clone(),
            openvpn: config.openvpn.clone(),
            wireguard: config.wireguard.clone(),
            router: config.router.clone(),
        }
    }

    fn network(&self) -> Ipv4Addr {
        self.subnet.network()
    }

    fn server_ip(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.subnet.network()).wrapping_add(1))
    }

    /// Active clients of `protocol`, ordered by address then name.
    fn enabled_clients<'a>(protocol: Protocol, clients: &'a [VpnClient]) -> Vec<&'a VpnClient> {
        let mut selected: Vec<&VpnClient> = clients
            .iter()
            .filter(|c| c.protocol == protocol && c.is_active())
            .collect();
        selected.sort_by(|a, b| {
            a.tunnel_address
                .cmp(&b.tunnel_address)
                .then_with(|| a.name.cmp(&b.name))
        });
        selected
    }

    // ========================================================================
    // Server configuration
    // ========================================================================

    /// Render the hub configuration for every active client of `protocol`.
    pub fn build_server_config(
        &self,
        protocol: Protocol,
        material: &ServerKeyMaterial,
        clients: &[VpnClient],
    ) -> Result<RenderedConfig> {
        if material.protocol() != protocol {
            return Err(Error::InvalidInput(format!(
                "{} key material supplied for {} server config",
                material.protocol(),
                protocol
            )));
        }
        let enabled = Self::enabled_clients(protocol, clients);

        match material {
            ServerKeyMaterial::OpenVpn { .. } => Ok(RenderedConfig::new(
                self.openvpn.server_config_path(),
                self.openvpn_server_config(&enabled),
                0o644,
            )),
            ServerKeyMaterial::WireGuard { server_keys } => Ok(RenderedConfig::new(
                self.wireguard.config_path.clone(),
                self.wireguard_server_config(server_keys, &enabled)?,
                0o600,
            )),
        }
    }

    fn openvpn_server_config(&self, clients: &[&VpnClient]) -> String {
        let dir = self.openvpn.server_dir.display();
        let log_dir = self.openvpn.log_dir.display();

        let mut config = format!(
r#"port {port}
proto {proto}
dev tun
topology subnet

ca {dir}/ca.crt
cert {dir}/server.crt
key {dir}/server.key
dh {dir}/dh.pem
tls-auth {dir}/ta.key 0
crl-verify {dir}/crl.pem

server {network} {netmask}
client-config-dir {dir}/ccd

cipher AES-256-GCM
auth SHA256
data-ciphers AES-256-GCM:AES-128-GCM:CHACHA20-POLY1305

keepalive 10 120
persist-key
persist-tun

status {log_dir}/openvpn-status.log
log-append {log_dir}/openvpn.log
verb 3

user nobody
group nogroup
"#,
            port = self.openvpn.port,
            proto = self.openvpn.transport,
            dir = dir,
            network = self.network(),
            netmask = self.subnet.mask(),
            log_dir = log_dir,
        );

        for client in clients {
            config.push_str(&format!("\n# Client {} ({})\n", client.name, client.tunnel_address));
            if let Some(subnet) = client.routed_subnet {
                config.push_str(&format!("route {} {}\n", subnet.network(), subnet.mask()));
            }
        }

        config
    }

    fn wireguard_server_config(&self, server_keys: &WgKeyPair, clients: &[&VpnClient]) -> Result<String> {
        let mut config = format!(
r#"[Interface]
PrivateKey = {private_key}
Address = {server_ip}/{prefix}
ListenPort = {port}
SaveConfig = false
PostUp = iptables -A FORWARD -i {iface} -j ACCEPT; iptables -t nat -A POSTROUTING -o {egress} -j MASQUERADE
PostDown = iptables -D FORWARD -i {iface} -j ACCEPT; iptables -t nat -D POSTROUTING -o {egress} -j MASQUERADE
"#,
            private_key = server_keys.private_key,
            server_ip = self.server_ip(),
            prefix = self.subnet.prefix(),
            port = self.wireguard.port,
            iface = self.wireguard.interface,
            egress = self.wireguard.egress_interface,
        );

        for client in clients {
            let public_key = client.keys.public_key.as_deref().ok_or_else(|| {
                Error::Internal(format!("peer {} has no public key", client.name))
            })?;

            config.push_str(&format!("\n# Peer: {}\n[Peer]\nPublicKey = {}\n", client.name, public_key));
            if let Some(psk) = &client.keys.preshared_key {
                config.push_str(&format!("PresharedKey = {}\n", psk));
            }
            config.push_str(&format!("AllowedIPs = {}\n", allowed_ips(client)));
        }

        Ok(config)
    }

    // ========================================================================
    // Per-client artifacts
    // ========================================================================

    /// The daemon-side file pinning a certificate-based client's address and
    /// routed subnet. Key-based peers have none.
    pub fn build_client_mapping_file(&self, client: &VpnClient) -> Option<RenderedConfig> {
        if client.protocol != Protocol::OpenVpn {
            return None;
        }

        let mut contents = format!(
            "ifconfig-push {} {}\n",
            client.tunnel_address,
            self.subnet.mask()
        );
        if let Some(subnet) = client.routed_subnet {
            contents.push_str(&format!("iroute {} {}\n", subnet.network(), subnet.mask()));
        }

        Some(RenderedConfig::new(
            self.openvpn.mapping_path(&client.name),
            contents,
            0o644,
        ))
    }

    /// The complete client-side configuration.
    ///
    /// Certificate-based bundles embed the CA, client certificate and key,
    /// and control-channel key. Key-based bundles omit the client's own
    /// private key.
    pub fn build_client_bundle(
        &self,
        client: &VpnClient,
        material: &ServerKeyMaterial,
        certificate: Option<&IssuedCertificate>,
    ) -> Result<String> {
        check_protocol(client, material)?;

        match material {
            ServerKeyMaterial::OpenVpn {
                ca_certificate,
                control_channel_key,
            } => {
                let issued = certificate.ok_or_else(|| {
                    Error::InvalidInput(format!("bundle for {} needs its issued certificate", client.name))
                })?;

                Ok(format!(
r#"# {name} ({address})
client
dev tun
proto {proto}
remote {endpoint} {port}
resolv-retry infinite
nobind
persist-key
persist-tun
remote-cert-tls server
cipher AES-256-GCM
auth SHA256
key-direction 1
verb 3

<ca>
{ca}
</ca>

<cert>
{cert}
</cert>

<key>
{key}
</key>

<tls-auth>
{ta}
</tls-auth>
"#,
                    name = client.name,
                    address = client.tunnel_address,
                    proto = self.openvpn.transport,
                    endpoint = self.public_endpoint,
                    port = self.openvpn.port,
                    ca = ca_certificate.trim_end(),
                    cert = issued.certificate.trim_end(),
                    key = issued.private_key.trim_end(),
                    ta = control_channel_key.trim_end(),
                ))
            }
            ServerKeyMaterial::WireGuard { server_keys } => {
                let psk_line = client
                    .keys
                    .preshared_key
                    .as_ref()
                    .map(|psk| format!("PresharedKey = {}\n", psk))
                    .unwrap_or_default();

                Ok(format!(
r#"# {name} ({address})
[Interface]
# PrivateKey = <private key of {name}>
Address = {address}/{prefix}

[Peer]
PublicKey = {server_pubkey}
{psk_line}Endpoint = {endpoint}:{port}
AllowedIPs = {subnet}
PersistentKeepalive = 25
"#,
                    name = client.name,
                    address = client.tunnel_address,
                    prefix = self.subnet.prefix(),
                    server_pubkey = server_keys.public_key,
                    psk_line = psk_line,
                    endpoint = self.public_endpoint,
                    port = self.wireguard.port,
                    subnet = self.subnet,
                ))
            }
        }
    }

    /// MikroTik RouterOS commands bringing the tunnel up on the remote router.
    pub fn build_router_script(&self, client: &VpnClient, material: &ServerKeyMaterial) -> Result<String> {
        check_protocol(client, material)?;

        let generated = client
            .last_generated_at
            .and_then(|ts| chrono::DateTime::<chrono::Utc>::from_timestamp(ts, 0))
            .map(|d| d.to_rfc3339())
            .unwrap_or_else(|| "unknown".to_string());

        match material {
            ServerKeyMaterial::OpenVpn { .. } => Ok(format!(
r#"# ============================================================
# OpenVPN client for MikroTik - {name}
# Tunnel address: {address}
# Generated: {generated}
# ============================================================

# STEP 1: Upload these files to the router (WinBox or FTP):
# - ca.crt
# - {name}.crt
# - {name}.key

# STEP 2: Import certificates
/certificate import file-name=ca.crt passphrase=""
/certificate import file-name={name}.crt passphrase=""
/certificate import file-name={name}.key passphrase=""

# STEP 3: Create the OVPN client interface
/interface ovpn-client add name={iface} \
    connect-to={endpoint} port={port} \
    mode=ip protocol={proto} \
    user={name} \
    certificate={name}.crt_0 \
    cipher=aes256-gcm auth=sha256 \
    add-default-route=no \
    comment="Tunnel to hub"

# STEP 4: Allow tunnel traffic
/ip firewall filter add chain=input src-address={subnet} action=accept \
    comment="Allow hub tunnel" place-before=0

# STEP 5: Enable the interface
/interface ovpn-client enable {iface}

# ============================================================
# Verification:
# ============================================================
# /interface ovpn-client print
# /interface ovpn-client monitor {iface}
# /ping {server_ip}
"#,
                name = client.name,
                address = client.tunnel_address,
                generated = generated,
                iface = self.router.openvpn_interface,
                endpoint = self.public_endpoint,
                port = self.openvpn.port,
                proto = self.openvpn.transport,
                subnet = self.subnet,
                server_ip = self.server_ip(),
            )),
            ServerKeyMaterial::WireGuard { server_keys } => {
                let private_key = client.keys.private_key.as_deref().ok_or_else(|| {
                    Error::Internal(format!("peer {} has no stored private key", client.name))
                })?;
                let psk_line = client
                    .keys
                    .preshared_key
                    .as_ref()
                    .map(|psk| format!("    preshared-key=\"{}\" \\\n", psk))
                    .unwrap_or_default();

                Ok(format!(
r#"# ============================================================
# WireGuard client for MikroTik v7+ - {name}
# Tunnel address: {address}
# Generated: {generated}
# ============================================================

# Requires RouterOS v7 or later

# STEP 1: Create the WireGuard interface
/interface wireguard add name={iface} \
    listen-port={listen_port} \
    mtu={mtu} \
    private-key="{private_key}"

# STEP 2: Assign the tunnel address
/ip address add address={address}/{prefix} interface={iface}

# STEP 3: Add the hub as peer
/interface wireguard peers add interface={iface} \
    public-key="{server_pubkey}" \
{psk_line}    endpoint-address={endpoint} \
    endpoint-port={port} \
    allowed-address={subnet} \
    persistent-keepalive=25

# STEP 4: Allow tunnel traffic
/ip firewall filter add chain=input src-address={subnet} action=accept \
    comment="Allow hub tunnel" place-before=0

# STEP 5: Route the tunnel network
/ip route add dst-address={subnet} gateway={iface}

# STEP 6: Enable the interface
/interface wireguard enable {iface}

# ============================================================
# Verification:
# ============================================================
# /interface wireguard print
# /interface wireguard peers print
# /ping {server_ip}
"#,
                    name = client.name,
                    address = client.tunnel_address,
                    generated = generated,
                    iface = self.router.wireguard_interface,
                    listen_port = self.router.wireguard_listen_port,
                    mtu = self.router.mtu,
                    private_key = private_key,
                    prefix = self.subnet.prefix(),
                    server_pubkey = server_keys.public_key,
                    psk_line = psk_line,
                    endpoint = self.public_endpoint,
                    port = self.wireguard.port,
                    subnet = self.subnet,
                    server_ip = self.server_ip(),
                ))
            }
        }
    }
}

fn check_protocol(client: &VpnClient, material: &ServerKeyMaterial) -> Result<()> {
    if client.protocol == material.protocol() {
        Ok(())
    } else {
        Err(Error::InvalidInput(format!(
            "client {} uses {}, not {}",
            client.name,
            client.protocol,
            material.protocol()
        )))
    }
}

/// Peer traffic selector: the tunnel address as a host plus any routed LAN.
fn allowed_ips(client: &VpnClient) -> String {
    match client.routed_subnet {
        Some(subnet) => format!("{}/32, {}", client.tunnel_address, subnet),
        None => format!("{}/32", client.tunnel_address),
    }
}
