//! Shared fixture: a hub rooted in a temp directory, driven by the fake runner

#![allow(dead_code)]

use sitelink_common::testing::FakeRunner;
use sitelink_common::Database;
use sitelink_provision::{ProvisionerConfig, ProvisioningOrchestrator};
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

pub struct Hub {
    pub tmp: TempDir,
    pub runner: Arc<FakeRunner>,
    pub db: Arc<Database>,
    pub config: ProvisionerConfig,
    pub orchestrator: ProvisioningOrchestrator,
}

impl Hub {
    pub fn openvpn_server_conf(&self) -> PathBuf {
        self.config.openvpn.server_config_path()
    }

    pub fn wireguard_server_conf(&self) -> PathBuf {
        self.config.wireguard.config_path.clone()
    }

    pub fn read(&self, path: &PathBuf) -> String {
        std::fs::read_to_string(path).unwrap()
    }
}

/// A hub with no PKI yet.
pub fn bare_hub_with(configure: impl FnOnce(&mut ProvisionerConfig)) -> Hub {
    let tmp = TempDir::new().unwrap();
    let mut config = ProvisionerConfig::rooted_at(tmp.path());
    config.network.public_endpoint = "hub.example.com".to_string();
    configure(&mut config);

    let runner = Arc::new(FakeRunner::new());
    let db = Arc::new(Database::open_memory().unwrap());
    let orchestrator = ProvisioningOrchestrator::new(&config, db.clone(), runner.clone());

    Hub {
        tmp,
        runner,
        db,
        config,
        orchestrator,
    }
}

/// A hub with a bootstrapped PKI and default settings.
pub async fn hub() -> Hub {
    hub_with(|_| {}).await
}

pub async fn hub_with(configure: impl FnOnce(&mut ProvisionerConfig)) -> Hub {
    let hub = bare_hub_with(configure);
    hub.orchestrator.bootstrap_pki().await.unwrap();
    hub.runner.reset_calls();
    hub
}
