//! CLI argument definitions using clap
//!
//! Commands:
//! - dbaas agent [--port <port>]
//! - dbaas billing [--once]
//!
//! Everything else comes from the environment (see `config`).

use clap::{Parser, Subcommand};

/// Managed database instances billed against a prepaid wallet
#[derive(Parser, Debug)]
#[command(name = "dbaas")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum Command {
    /// Start the provisioning agent
    ///
    /// Serves the authenticated provisioning API in front of the
    /// PostgreSQL, MySQL and MongoDB adapters.
    Agent {
        /// Override AGENT_PORT
        #[arg(long)]
        port: Option<u16>,
    },

    /// Run the billing engine
    ///
    /// Meters running instances every BILLING_INTERVAL_SECS and suspends
    /// instances whose wallet goes negative.
    Billing {
        /// Run a single pass and exit
        #[arg(long)]
        once: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_agent() {
        let cli = Cli::try_parse_from(["dbaas", "agent"]).unwrap();
        assert_eq!(cli.command, Command::Agent { port: None });

        let cli = Cli::try_parse_from(["dbaas", "agent", "--port", "5001"]).unwrap();
        assert_eq!(cli.command, Command::Agent { port: Some(5001) });
    }

    #[test]
    fn test_parse_billing() {
        let cli = Cli::try_parse_from(["dbaas", "billing", "--once"]).unwrap();
        assert_eq!(cli.command, Command::Billing { once: true });

        let cli = Cli::try_parse_from(["dbaas", "billing"]).unwrap();
        assert_eq!(cli.command, Command::Billing { once: false });
    }

    #[test]
    fn test_rejects_unknown_command() {
        assert!(Cli::try_parse_from(["dbaas", "serve"]).is_err());
        assert!(Cli::try_parse_from(["dbaas", "agent", "--port", "70000"]).is_err());
    }
}
