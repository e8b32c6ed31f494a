//! Command-line surface
//!
//! - `dbaas agent`: serve the provisioning agent
//! - `dbaas billing [--once]`: run the billing scheduler, or a single pass

pub mod args;
pub mod commands;
pub mod errors;

pub use args::{Cli, Command};
pub use commands::run_command;
pub use errors::{CliError, CliResult};
