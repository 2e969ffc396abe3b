mod support;

use sitelink_common::testing::FakeFailure;
use sitelink_common::{ClientState, ErrorKind, Protocol};
use sitelink_provision::{EnrollRequest, Stage};
use std::collections::HashSet;
use std::net::Ipv4Addr;
use support::{bare_hub_with, hub, hub_with};

fn host(last: u8) -> Ipv4Addr {
    Ipv4Addr::new(10, 200, 1, last)
}

/// Sequential enrollments across both protocols never share an address and
/// never take the hub's own.
#[tokio::test]
async fn sequential_enrollments_get_distinct_addresses() {
    let hub = hub().await;
    let subnet = hub.config.network.subnet;

    let mut seen = HashSet::new();
    for i in 0..12 {
        let protocol = if i % 2 == 0 { Protocol::OpenVpn } else { Protocol::WireGuard };
        let enrollment = hub
            .orchestrator
            .enroll_client(EnrollRequest::new(format!("site-{}", i), protocol))
            .await
            .unwrap();

        let addr = enrollment.client.tunnel_address;
        assert!(subnet.contains(addr));
        assert_ne!(addr, host(1));
        assert_ne!(addr, subnet.network());
        assert_ne!(addr, subnet.broadcast());
        assert!(seen.insert(addr), "address {} handed out twice", addr);
        assert_eq!(enrollment.client.state, ClientState::Active);
    }
}

/// Enroll A, B, C; disable B; the regenerated config names A and C only.
#[tokio::test]
async fn disabled_client_drops_out_of_wireguard_config() {
    let hub = hub().await;
    let o = &hub.orchestrator;

    let a = o.enroll_client(EnrollRequest::new("site-a", Protocol::WireGuard)).await.unwrap();
    let b = o.enroll_client(EnrollRequest::new("site-b", Protocol::WireGuard)).await.unwrap();
    let c = o.enroll_client(EnrollRequest::new("site-c", Protocol::WireGuard)).await.unwrap();
    assert_eq!(a.client.tunnel_address, host(2));
    assert_eq!(b.client.tunnel_address, host(3));
    assert_eq!(c.client.tunnel_address, host(4));

    let before = hub.read(&hub.wireguard_server_conf());
    assert!(before.contains("# Peer: site-b"));

    let disabled = o.disable_client(&b.client.id).await.unwrap();
    assert_eq!(disabled.state, ClientState::Disabled);
    assert!(!disabled.enabled);

    let regen = o.regenerate_server_config(Protocol::WireGuard).await.unwrap();
    let text = hub.read(&hub.wireguard_server_conf());
    assert_eq!(regen.rendered.contents, text);
    assert_eq!(regen.peers, 2);
    assert!(text.contains("# Peer: site-a"));
    assert!(text.contains("# Peer: site-c"));
    assert!(!text.contains("site-b"));
    assert!(!text.contains("10.200.1.3/32"));
    let b_key = b.client.keys.public_key.unwrap();
    assert!(!text.contains(&b_key));
}

/// Same scenario for the certificate-based protocol: route, mapping file and
/// certificate of B are all gone.
#[tokio::test]
async fn disabled_client_drops_out_of_openvpn_config() {
    let hub = hub().await;
    let o = &hub.orchestrator;

    for (name, lan) in [("site-a", "192.168.10.0/24"), ("site-b", "192.168.20.0/24"), ("site-c", "192.168.30.0/24")] {
        o.enroll_client(
            EnrollRequest::new(name, Protocol::OpenVpn).with_routed_subnet(lan.parse().unwrap()),
        )
        .await
        .unwrap();
    }
    let b_mapping = hub.config.openvpn.mapping_path("site-b");
    assert_eq!(
        hub.read(&b_mapping),
        "ifconfig-push 10.200.1.3 255.255.255.0\niroute 192.168.20.0 255.255.255.0\n"
    );

    hub.runner.reset_calls();
    o.disable_client("site-b").await.unwrap();
    assert_eq!(hub.runner.count("revoke"), 1);
    assert_eq!(hub.runner.count("gen-crl"), 1);
    assert!(!b_mapping.exists());
    assert!(!o.certificate_authority().has_unrevoked_certificate("site-b"));

    o.regenerate_server_config(Protocol::OpenVpn).await.unwrap();
    let text = hub.read(&hub.openvpn_server_conf());
    assert!(text.contains("# Client site-a (10.200.1.2)\nroute 192.168.10.0 255.255.255.0\n"));
    assert!(text.contains("# Client site-c (10.200.1.4)\nroute 192.168.30.0 255.255.255.0\n"));
    assert!(!text.contains("site-b"));
    assert!(!text.contains("192.168.20.0"));
}

/// Regenerating with no state change yields identical bytes and skips the write.
#[tokio::test]
async fn regenerate_is_idempotent() {
    let hub = hub().await;
    let o = &hub.orchestrator;
    o.enroll_client(EnrollRequest::new("site-a", Protocol::OpenVpn)).await.unwrap();
    o.enroll_client(EnrollRequest::new("site-w", Protocol::WireGuard)).await.unwrap();

    for protocol in [Protocol::OpenVpn, Protocol::WireGuard] {
        let first = o.regenerate_server_config(protocol).await.unwrap();
        let second = o.regenerate_server_config(protocol).await.unwrap();
        assert_eq!(first.rendered.contents, second.rendered.contents);
        assert_eq!(first.rendered.digest, second.rendered.digest);
        assert!(!second.changed);

        let dry_run = o.render_server_config(protocol).await.unwrap();
        assert_eq!(dry_run, second.rendered);
    }
}

/// A name holding an unrevoked certificate is refused before any address is
/// allocated or certificate issued.
#[tokio::test]
async fn enroll_with_unrevoked_certificate_is_refused() {
    let hub = hub().await;
    let o = &hub.orchestrator;
    o.certificate_authority()
        .issue_client_certificate("site-x")
        .await
        .unwrap();

    let err = o
        .enroll_client(EnrollRequest::new("site-x", Protocol::OpenVpn))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyExists);
    assert_eq!(err.stage, Stage::Validate);
    assert_eq!(err.identity, "site-x");

    assert!(o.list_clients(None).unwrap().is_empty());
    assert_eq!(hub.runner.count("build-client-full"), 1);

    // The address it would have taken is still the first one handed out
    let next = o.enroll_client(EnrollRequest::new("site-y", Protocol::OpenVpn)).await.unwrap();
    assert_eq!(next.client.tunnel_address, host(2));
}

/// Disabling an unknown id touches neither the PKI nor any config file.
#[tokio::test]
async fn disable_unknown_client_is_not_found() {
    let hub = hub().await;
    let err = hub.orchestrator.disable_client("no-such-id").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(hub.runner.calls().is_empty());
    assert!(!hub.openvpn_server_conf().exists());
    assert!(!hub.wireguard_server_conf().exists());
}

#[tokio::test]
async fn duplicate_name_is_refused() {
    let hub = hub().await;
    let o = &hub.orchestrator;
    o.enroll_client(EnrollRequest::new("site-a", Protocol::WireGuard)).await.unwrap();
    let err = o
        .enroll_client(EnrollRequest::new("site-a", Protocol::OpenVpn))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyExists);
    assert_eq!(o.list_clients(None).unwrap().len(), 1);
}

#[tokio::test]
async fn invalid_name_is_refused() {
    let hub = hub().await;
    let err = hub
        .orchestrator
        .enroll_client(EnrollRequest::new("../etc/passwd", Protocol::OpenVpn))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
    assert_eq!(err.stage, Stage::Validate);
}

/// A failed issuance leaves no record and no address claimed.
#[tokio::test]
async fn failed_issuance_leaves_no_record() {
    let hub = hub().await;
    let o = &hub.orchestrator;
    hub.runner
        .fail_on("build-client-full", FakeFailure::Exit("unable to write 'random state'".into()));

    let err = o
        .enroll_client(EnrollRequest::new("site-a", Protocol::OpenVpn))
        .await
        .unwrap_err();
    assert_eq!(err.stage, Stage::IssueCertificate);
    assert_eq!(err.kind(), ErrorKind::ProcessFailure);
    assert!(err.is_retryable());
    assert!(err.to_string().contains("random state"));
    assert!(o.list_clients(None).unwrap().is_empty());
    assert!(!hub.config.openvpn.mapping_path("site-a").exists());

    hub.runner.clear_failures();
    let ok = o.enroll_client(EnrollRequest::new("site-a", Protocol::OpenVpn)).await.unwrap();
    assert_eq!(ok.client.tunnel_address, host(2));
}

#[tokio::test]
async fn keygen_timeout_is_retryable_and_leaves_no_record() {
    let hub = hub().await;
    let o = &hub.orchestrator;
    // Create the server keypair first so only the client keygen times out
    o.ensure_server_keys().await.unwrap();
    hub.runner.fail_on("genkey", FakeFailure::Timeout);

    let err = o
        .enroll_client(EnrollRequest::new("site-w", Protocol::WireGuard))
        .await
        .unwrap_err();
    assert_eq!(err.stage, Stage::GenerateKeys);
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert!(err.is_retryable());
    assert!(o.list_clients(None).unwrap().is_empty());
}

/// A failure after the record was inserted removes it and revokes the
/// certificate so the name can be enrolled again.
#[tokio::test]
async fn failure_after_issuance_rolls_back() {
    let hub = hub().await;
    let o = &hub.orchestrator;

    // A directory where the server config file should be makes the write fail
    std::fs::create_dir_all(hub.openvpn_server_conf()).unwrap();

    let err = o
        .enroll_client(EnrollRequest::new("site-a", Protocol::OpenVpn))
        .await
        .unwrap_err();
    assert_eq!(err.stage, Stage::WriteArtifacts);
    assert!(o.list_clients(None).unwrap().is_empty());
    assert!(!o.certificate_authority().has_unrevoked_certificate("site-a"));
    assert!(!hub.config.openvpn.mapping_path("site-a").exists());

    std::fs::remove_dir_all(hub.openvpn_server_conf()).unwrap();
    o.enroll_client(EnrollRequest::new("site-a", Protocol::OpenVpn)).await.unwrap();
}

#[tokio::test]
async fn enroll_before_pki_bootstrap_is_not_initialized() {
    let hub = bare_hub_with(|_| {});
    let err = hub
        .orchestrator
        .enroll_client(EnrollRequest::new("site-a", Protocol::OpenVpn))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotInitialized);
    assert_eq!(err.stage, Stage::ServerMaterial);
    assert!(hub.runner.calls().is_empty());
}

/// Disabled clients hold their address until purged.
#[tokio::test]
async fn purge_releases_address() {
    let hub = hub().await;
    let o = &hub.orchestrator;

    let a = o.enroll_client(EnrollRequest::new("site-a", Protocol::WireGuard)).await.unwrap();
    o.enroll_client(EnrollRequest::new("site-b", Protocol::WireGuard)).await.unwrap();
    o.disable_client(&a.client.id).await.unwrap();

    let c = o.enroll_client(EnrollRequest::new("site-c", Protocol::WireGuard)).await.unwrap();
    assert_eq!(c.client.tunnel_address, host(4));

    let purged = o.purge_client("site-a").await.unwrap();
    assert_eq!(purged.state, ClientState::Purged);
    assert!(o.get_client(&a.client.id).is_err());

    let d = o.enroll_client(EnrollRequest::new("site-d", Protocol::WireGuard)).await.unwrap();
    assert_eq!(d.client.tunnel_address, host(2));
}

#[tokio::test]
async fn purge_requires_disable_first() {
    let hub = hub().await;
    let o = &hub.orchestrator;
    o.enroll_client(EnrollRequest::new("site-a", Protocol::OpenVpn)).await.unwrap();

    let err = o.purge_client("site-a").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidStateTransition);
    assert_eq!(o.list_clients(None).unwrap().len(), 1);

    let err = o.disable_client("site-a").await.and(o.disable_client("site-a").await).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidStateTransition);
}

/// After purging a certificate-based client its name can be enrolled again.
#[tokio::test]
async fn name_reusable_after_purge() {
    let hub = hub().await;
    let o = &hub.orchestrator;
    o.enroll_client(EnrollRequest::new("site-a", Protocol::OpenVpn)).await.unwrap();
    o.disable_client("site-a").await.unwrap();
    o.purge_client("site-a").await.unwrap();

    let again = o.enroll_client(EnrollRequest::new("site-a", Protocol::OpenVpn)).await.unwrap();
    assert_eq!(again.client.tunnel_address, host(2));
}

#[tokio::test]
async fn address_exhaustion() {
    let hub = hub_with(|c| c.network.subnet = "10.77.0.0/29".parse().unwrap()).await;
    let o = &hub.orchestrator;
    for i in 0..5 {
        o.enroll_client(EnrollRequest::new(format!("site-{}", i), Protocol::WireGuard))
            .await
            .unwrap();
    }

    let err = o
        .enroll_client(EnrollRequest::new("site-late", Protocol::WireGuard))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AddressExhausted);
    assert_eq!(err.stage, Stage::Allocate);
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn openvpn_artifacts() {
    let hub = hub().await;
    let o = &hub.orchestrator;
    let e = o
        .enroll_client(
            EnrollRequest::new("site-a", Protocol::OpenVpn).with_description("Branch office"),
        )
        .await
        .unwrap();

    assert_eq!(e.client.description.as_deref(), Some("Branch office"));
    assert!(e.bundle.contains("remote hub.example.com 1194"));
    assert!(e.bundle.contains("cert-site-a"));
    assert!(e.bundle.contains("key-site-a"));
    assert!(e.router_script.contains("user=site-a"));

    // Stored copies are returned again
    assert_eq!(o.client_bundle("site-a").await.unwrap(), e.bundle);
    assert_eq!(o.router_script(&e.client.id).await.unwrap(), e.router_script);
    assert!(e.client.last_generated_at.is_some());
}

#[tokio::test]
async fn wireguard_artifacts() {
    let hub = hub().await;
    let o = &hub.orchestrator;
    let e = o
        .enroll_client(EnrollRequest::new("site-w", Protocol::WireGuard))
        .await
        .unwrap();
    let private_key = e.client.keys.private_key.clone().unwrap();
    let server_pub = o.server_public_key().unwrap();

    assert!(!e.bundle.contains(&private_key));
    assert!(e.bundle.contains(&server_pub));
    assert!(e.router_script.contains(&private_key));
    assert!(e.router_script.contains(&server_pub));

    let conf = hub.read(&hub.wireguard_server_conf());
    assert!(conf.contains(&format!("PublicKey = {}", e.client.keys.public_key.unwrap())));
    assert!(conf.contains(&format!("PresharedKey = {}", e.client.keys.preshared_key.unwrap())));

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(hub.wireguard_server_conf()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}

#[tokio::test]
async fn rekey_openvpn_revokes_then_reissues() {
    let hub = hub().await;
    let o = &hub.orchestrator;
    let before = o.enroll_client(EnrollRequest::new("site-a", Protocol::OpenVpn)).await.unwrap();
    hub.runner.reset_calls();

    let after = o.rekey_client("site-a").await.unwrap();
    assert_eq!(after.client.tunnel_address, before.client.tunnel_address);
    assert_eq!(hub.runner.count("revoke"), 1);
    assert_eq!(hub.runner.count("build-client-full"), 1);
    assert!(o.certificate_authority().has_unrevoked_certificate("site-a"));

    let calls = hub.runner.calls();
    let revoke_at = calls.iter().position(|c| c.tool_args()[0] == "revoke").unwrap();
    let issue_at = calls
        .iter()
        .position(|c| c.tool_args()[0] == "build-client-full")
        .unwrap();
    assert!(revoke_at < issue_at);
}

/// A disable retried after a failed CRL write still gets the revocation
/// into the installed CRL.
#[tokio::test]
async fn disable_retry_after_crl_failure_publishes_revocation() {
    let hub = hub().await;
    let o = &hub.orchestrator;
    o.enroll_client(EnrollRequest::new("site-b", Protocol::OpenVpn)).await.unwrap();
    let crl_path = hub.config.openvpn.server_dir.join("crl.pem");

    hub.runner.fail_on("gen-crl", FakeFailure::Exit("crl write failed".into()));
    let err = o.disable_client("site-b").await.unwrap_err();
    assert_eq!(err.stage, Stage::RevokeCertificate);
    assert_eq!(o.get_client("site-b").unwrap().state, ClientState::Active);

    hub.runner.clear_failures();
    let disabled = o.disable_client("site-b").await.unwrap();
    assert_eq!(disabled.state, ClientState::Disabled);
    assert!(hub.read(&crl_path).contains("site-b"));
    assert_eq!(hub.runner.count("revoke"), 1);
}

/// When the reissue half of a rekey fails the old bundle, which embeds the
/// revoked certificate, is no longer handed out.
#[tokio::test]
async fn failed_rekey_withholds_revoked_bundle() {
    let hub = hub().await;
    let o = &hub.orchestrator;
    o.enroll_client(EnrollRequest::new("site-a", Protocol::OpenVpn)).await.unwrap();

    hub.runner.fail_on("build-client-full", FakeFailure::Exit("openssl: disk full".into()));
    let err = o.rekey_client("site-a").await.unwrap_err();
    assert_eq!(err.stage, Stage::IssueCertificate);
    assert!(!o.certificate_authority().has_unrevoked_certificate("site-a"));
    assert!(o.get_client("site-a").unwrap().generated_bundle.is_none());
    assert_eq!(o.client_bundle("site-a").await.unwrap_err().kind(), ErrorKind::NotFound);

    hub.runner.clear_failures();
    let rekeyed = o.rekey_client("site-a").await.unwrap();
    assert!(rekeyed.bundle.contains("cert-site-a"));
    assert_eq!(o.client_bundle("site-a").await.unwrap(), rekeyed.bundle);
}

#[tokio::test]
async fn rekey_wireguard_replaces_peer_key() {
    let hub = hub().await;
    let o = &hub.orchestrator;
    let before = o.enroll_client(EnrollRequest::new("site-w", Protocol::WireGuard)).await.unwrap();
    let old_key = before.client.keys.public_key.clone().unwrap();

    let after = o.rekey_client(&before.client.id).await.unwrap();
    let new_key = after.client.keys.public_key.clone().unwrap();
    assert_ne!(old_key, new_key);

    let conf = hub.read(&hub.wireguard_server_conf());
    assert!(conf.contains(&new_key));
    assert!(!conf.contains(&old_key));
    assert_eq!(o.router_script("site-w").await.unwrap(), after.router_script);
}

#[tokio::test]
async fn update_routed_subnet_rewrites_mapping_and_routes() {
    let hub = hub().await;
    let o = &hub.orchestrator;
    o.enroll_client(EnrollRequest::new("site-a", Protocol::OpenVpn)).await.unwrap();

    let updated = o
        .update_routed_subnet("site-a", Some("172.20.5.0/24".parse().unwrap()))
        .await
        .unwrap();
    assert_eq!(updated.routed_subnet.unwrap().to_string(), "172.20.5.0/24");
    assert!(hub
        .read(&hub.config.openvpn.mapping_path("site-a"))
        .contains("iroute 172.20.5.0 255.255.255.0"));
    assert!(hub
        .read(&hub.openvpn_server_conf())
        .contains("route 172.20.5.0 255.255.255.0"));

    let err = o
        .update_routed_subnet("site-a", Some("10.200.0.0/16".parse().unwrap()))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);

    o.update_routed_subnet("site-a", None).await.unwrap();
    assert!(!hub.read(&hub.openvpn_server_conf()).contains("172.20.5.0"));
}

#[tokio::test]
async fn list_and_lookup() {
    let hub = hub().await;
    let o = &hub.orchestrator;
    let a = o.enroll_client(EnrollRequest::new("site-a", Protocol::OpenVpn)).await.unwrap();
    o.enroll_client(EnrollRequest::new("site-w", Protocol::WireGuard)).await.unwrap();

    assert_eq!(o.list_clients(None).unwrap().len(), 2);
    let wg = o.list_clients(Some(Protocol::WireGuard)).unwrap();
    assert_eq!(wg.len(), 1);
    assert_eq!(wg[0].name, "site-w");

    assert_eq!(o.get_client(&a.client.id).unwrap().name, "site-a");
    assert_eq!(o.get_client("site-a").unwrap().id, a.client.id);
    assert_eq!(o.get_client("nobody").unwrap_err().kind(), ErrorKind::NotFound);
}
