//! Sitelink Common Library
//!
//! Shared types, persistence and process execution for the Sitelink
//! site-to-site VPN provisioner.

pub mod db;
pub mod error;
pub mod exec;
pub mod fsutil;
pub mod settings;
pub mod types;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-export commonly used types
pub use db::Database;
pub use error::{Error, ErrorKind, Result};
pub use exec::{CommandOutput, CommandRunner, CommandSpec, TokioCommandRunner};
pub use settings::SettingsStore;
pub use types::*;

/// Sitelink version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default state directory
pub fn default_store_path() -> std::path::PathBuf {
    std::path::PathBuf::from("/var/lib/sitelink")
}
