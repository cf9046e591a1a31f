use asset_ux_cli::{service_management, Cli};
use clap::Parser;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    service_management::start(&cli)?;
    asset_ux_cli::execute(&cli).await
}
