use anyhow::Context;
use clap::Parser;
use std::path::Path;
use tollgate_cli::{execute, init_tracing, Cli, TollgateConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = TollgateConfig::load(cli.config.as_deref().map(Path::new))
        .context("failed to load configuration")?;

    let level = cli
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    init_tracing(&level, cli.json || config.logging.json);

    let output = execute(&cli.command, &config).await?;
    print!("{output}");
    Ok(())
}
