mod args;
mod cmd_impls;
mod cmd_node;
mod cmd_smoke;

use anyhow::Context;
use args::{Cli, Commands};
use clap::Parser;
use ln_interop::{logging, HarnessConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => HarnessConfig::load_from(path)?.with_env_overrides(),
        None => HarnessConfig::load().context("Failed to load harness config")?,
    };
    logging::init(cli.debug || config.debug);

    match cli.command {
        Commands::Impls => cmd_impls::cmd_impls(&config),
        Commands::Node { implementation } => cmd_node::cmd_node(config, implementation).await?,
        Commands::Smoke {
            first,
            second,
            timeout,
        } => cmd_smoke::cmd_smoke(config, first, second, timeout).await?,
    }

    Ok(())
}
