//! Sitelink provisioning core
//!
//! Certificate authority lifecycle, key generation, tunnel address
//! allocation and configuration synthesis for hub-and-spoke site tunnels.

pub mod allocator;
pub mod config;
pub mod keys;
pub mod orchestrator;
pub mod pki;
pub mod render;

pub use allocator::AddressAllocator;
pub use config::ProvisionerConfig;
pub use keys::{KeyPairManager, WgKeyPair};
pub use orchestrator::{
    EnrollRequest, Enrollment, ProvisioningOrchestrator, Regeneration, Stage, StageError,
    StageResult,
};
pub use pki::{CertificateAuthorityManager, IssuedCertificate, Readiness};
pub use render::{ConfigBuilder, RenderedConfig, ServerKeyMaterial};
