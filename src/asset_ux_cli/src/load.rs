use anyhow::Context;
use asset_serde::{cmd::LoadArgs, Loader, StoreRegistry};

use crate::Cli;

#[derive(Debug, Default)]
pub struct Load {}

impl Load {
    pub async fn execute(&self, cli: &Cli, args: &LoadArgs) -> anyhow::Result<()> {
        let mut config = crate::ingest_config(cli)?;
        if let Some(mode) = args.mode {
            config = config.with_load_mode(mode);
        }
        if let Some(workers) = args.workers {
            config.load_workers = workers.max(1);
        }

        let registry = StoreRegistry::new();
        let store = crate::open_store(&registry, &args.target_dir, &args.schema)?;
        let report = Loader::new(config).load(&store).await.with_context(|| {
            format!(
                "[Load::execute] unable to load artifacts from {}",
                args.target_dir.display()
            )
        })?;
        registry.close_all();

        println!("{}", serde_json::to_string_pretty(&report)?);
        Ok(())
    }
}
