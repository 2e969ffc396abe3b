//! CLI Commands

pub mod client;
pub mod pki;
pub mod server;
pub mod wg;
