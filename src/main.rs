//! dbaas binary entry point

use clap::Parser;
use dbaas::cli::{run_command, Cli};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Optional; real environment variables take precedence.
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dbaas=info".into()),
        )
        .init();

    let cli = Cli::parse();
    run_command(cli.command).await?;
    Ok(())
}
