//! Wiring from CLI flags to a provisioning orchestrator

use anyhow::{Context as _, Result};
use sitelink_common::{CommandRunner, Database, TokioCommandRunner};
use sitelink_provision::{ProvisionerConfig, ProvisioningOrchestrator};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Loaded configuration plus the orchestrator built from it
pub struct Context {
    pub config: ProvisionerConfig,
    pub orchestrator: ProvisioningOrchestrator,
}

impl Context {
    /// Load `config_path` (defaults when the file is absent), apply the
    /// store override and open the state database.
    pub fn open(config_path: &Path, store: Option<PathBuf>) -> Result<Self> {
        let config = load_config(config_path, store)?;
        let db = Database::open(config.db_path())
            .with_context(|| format!("opening state database {}", config.db_path().display()))?;
        let runner: Arc<dyn CommandRunner> = Arc::new(TokioCommandRunner::new());
        let orchestrator = ProvisioningOrchestrator::new(&config, Arc::new(db), runner);

        Ok(Self {
            config,
            orchestrator,
        })
    }
}

fn load_config(path: &Path, store: Option<PathBuf>) -> Result<ProvisionerConfig> {
    let mut config = if path.exists() {
        ProvisionerConfig::load(path)
            .with_context(|| format!("loading configuration {}", path.display()))?
    } else {
        debug!("No configuration at {}, using defaults", path.display());
        ProvisionerConfig::default()
    };
    if let Some(store) = store {
        config.store_path = store;
    }
    Ok(config)
}
