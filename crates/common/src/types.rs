//! Core types for Sitelink

use crate::{Error, Result};
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use uuid::Uuid;

/// Tunnel technology used by a remote site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    /// Certificate-authenticated tunnels (OpenVPN with an easy-rsa PKI)
    #[serde(rename = "openvpn")]
    OpenVpn,
    /// Asymmetric-key tunnels with optional pre-shared keys (WireGuard)
    #[serde(rename = "wireguard")]
    WireGuard,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::OpenVpn => "openvpn",
            Protocol::WireGuard => "wireguard",
        }
    }

    /// Whether client identity is proven by an issued certificate.
    pub fn is_certificate_based(&self) -> bool {
        matches!(self, Protocol::OpenVpn)
    }
}

impl Default for Protocol {
    fn default() -> Self {
        Self::OpenVpn
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Protocol {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "openvpn" => Ok(Self::OpenVpn),
            "wireguard" => Ok(Self::WireGuard),
            _ => Err(Error::InvalidInput(format!("unknown protocol: {}", s))),
        }
    }
}

/// Client lifecycle state.
///
/// `Purged` is terminal and never stored: a purged client has no row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientState {
    Pending,
    Active,
    Disabled,
    Purged,
}

impl Default for ClientState {
    fn default() -> Self {
        Self::Pending
    }
}

impl ClientState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientState::Pending => "pending",
            ClientState::Active => "active",
            ClientState::Disabled => "disabled",
            ClientState::Purged => "purged",
        }
    }

    pub fn can_transition_to(&self, to: ClientState) -> bool {
        matches!(
            (self, to),
            (ClientState::Pending, ClientState::Active)
                | (ClientState::Pending, ClientState::Purged)
                | (ClientState::Active, ClientState::Disabled)
                | (ClientState::Disabled, ClientState::Purged)
        )
    }

    /// Validate a transition, returning the new state.
    pub fn transition(self, to: ClientState) -> Result<ClientState> {
        if self.can_transition_to(to) {
            Ok(to)
        } else {
            Err(Error::InvalidStateTransition {
                from: self.to_string(),
                to: to.to_string(),
            })
        }
    }
}

impl std::fmt::Display for ClientState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ClientState {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "active" => Ok(Self::Active),
            "disabled" => Ok(Self::Disabled),
            "purged" => Ok(Self::Purged),
            _ => Err(Error::InvalidInput(format!("unknown client state: {}", s))),
        }
    }
}

/// Key material kept on a WireGuard client record.
///
/// OpenVPN clients carry none: their private material lives in the PKI store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientKeys {
    pub public_key: Option<String>,
    #[serde(skip_serializing)]
    pub private_key: Option<String>,
    #[serde(skip_serializing)]
    pub preshared_key: Option<String>,
}

/// A remote site's tunnel enrollment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VpnClient {
    pub id: String,
    /// Unique identity; certificate common name for OpenVPN
    pub name: String,
    pub description: Option<String>,
    pub protocol: Protocol,
    pub tunnel_address: Ipv4Addr,
    /// LAN behind the remote router
    pub routed_subnet: Option<Ipv4Network>,
    #[serde(flatten)]
    pub keys: ClientKeys,
    pub enabled: bool,
    pub state: ClientState,
    #[serde(skip_serializing)]
    pub generated_bundle: Option<String>,
    #[serde(skip_serializing)]
    pub generated_script: Option<String>,
    pub last_generated_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl VpnClient {
    /// A fresh pending record.
    pub fn new(
        name: impl Into<String>,
        protocol: Protocol,
        tunnel_address: Ipv4Addr,
        routed_subnet: Option<Ipv4Network>,
    ) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            description: None,
            protocol,
            tunnel_address,
            routed_subnet,
            keys: ClientKeys::default(),
            enabled: true,
            state: ClientState::Pending,
            generated_bundle: None,
            generated_script: None,
            last_generated_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == ClientState::Active && self.enabled
    }

    pub fn touch(&mut self) {
        self.updated_at = chrono::Utc::now().timestamp();
    }
}

/// Check that a client name is usable as a certificate common name and file name.
pub fn validate_client_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 64 {
        return Err(Error::InvalidInput(format!(
            "client name must be 1-64 characters, got {}",
            name.len()
        )));
    }
    if name == "server" || name == "ca" {
        return Err(Error::InvalidInput(format!("client name '{}' is reserved", name)));
    }
    if name.starts_with('.') || name.starts_with('-') {
        return Err(Error::InvalidInput(format!(
            "client name '{}' must start with a letter or digit",
            name
        )));
    }
    if let Some(c) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_' || *c == '.'))
    {
        return Err(Error::InvalidInput(format!(
            "client name '{}' contains invalid character '{}'",
            name, c
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_machine() {
        assert!(ClientState::Pending.can_transition_to(ClientState::Active));
        assert!(ClientState::Active.can_transition_to(ClientState::Disabled));
        assert!(ClientState::Disabled.can_transition_to(ClientState::Purged));

        assert!(!ClientState::Active.can_transition_to(ClientState::Purged));
        assert!(!ClientState::Disabled.can_transition_to(ClientState::Active));
        assert!(!ClientState::Purged.can_transition_to(ClientState::Pending));

        let err = ClientState::Active.transition(ClientState::Purged).unwrap_err();
        assert!(matches!(err, Error::InvalidStateTransition { .. }));
    }

    #[test]
    fn test_protocol_roundtrip_names() {
        assert_eq!("openvpn".parse::<Protocol>().unwrap(), Protocol::OpenVpn);
        assert_eq!("wireguard".parse::<Protocol>().unwrap(), Protocol::WireGuard);
        assert!("ipsec".parse::<Protocol>().is_err());
        assert_eq!(
            serde_json::to_string(&Protocol::WireGuard).unwrap(),
            "\"wireguard\""
        );
    }

    #[test]
    fn test_client_name_validation() {
        assert!(validate_client_name("branch-01").is_ok());
        assert!(validate_client_name("site_a.lan").is_ok());
        assert!(validate_client_name("").is_err());
        assert!(validate_client_name("server").is_err());
        assert!(validate_client_name("-flag").is_err());
        assert!(validate_client_name("a b").is_err());
        assert!(validate_client_name("../etc").is_err());
    }

    #[test]
    fn test_private_keys_not_serialized() {
        let mut client = VpnClient::new("a", Protocol::WireGuard, Ipv4Addr::new(10, 0, 0, 2), None);
        client.keys.private_key = Some("secret".to_string());
        client.keys.public_key = Some("public".to_string());
        let json = serde_json::to_string(&client).unwrap();
        assert!(!json.contains("secret"));
        assert!(json.contains("public"));
    }
}
