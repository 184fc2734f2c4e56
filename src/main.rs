mod cli;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use cli::{handle_command, Cli};
use portbridge::utils::{level_for_verbosity, setup_logging};
use portbridge::Coordinator;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(level_for_verbosity(cli.verbose)).map_err(|e| anyhow::anyhow!("Logging setup failed: {}", e))?;
    info!("Starting portbridge...");

    let config = cli.network_config();
    let (coordinator, mut events) = Coordinator::with_defaults(config);

    handle_command(&coordinator, &mut events, cli.command, cli.json).await
}
