use agidentity::cli::{run, Cli};
use agidentity::logging::init_tracing;
use clap::Parser;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = cli.load_config()?;
    init_tracing(config.log_level.as_deref().unwrap_or("info"));

    run(cli, config).await?;
    Ok(())
}
