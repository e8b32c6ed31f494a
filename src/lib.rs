//! dbaas - on-demand managed database instances
//!
//! Users rent PostgreSQL, MySQL or MongoDB databases billed by run time
//! against a prepaid wallet.
//!
//! ## Components
//!
//! - `engines`: per-engine adapters for create, suspend, resume, terminate
//!   and password rotation
//! - `agent`: authenticated provisioning service in front of the adapters
//! - `credentials`: password generation and at-rest encryption
//! - `control_plane`: instances, wallets, lifecycle and billing
//! - `config`, `config_validator`: environment configuration
//! - `cli`: command-line surface

pub mod agent;
pub mod cli;
pub mod config;
pub mod config_validator;
pub mod control_plane;
pub mod credentials;
pub mod engines;

#[cfg(test)]
mod testing;
