use anyhow::Context;
use asset_serde::{
    cmd::{AnalyseArgs, ReportFormat},
    OwnershipAnalyser, StoreRegistry,
};
use tracing::warn;

use crate::{format, Cli};

#[derive(Debug, Default)]
pub struct Analyse {}

impl Analyse {
    pub fn execute(&self, _cli: &Cli, args: &AnalyseArgs) -> anyhow::Result<()> {
        let registry = StoreRegistry::new();
        let store = crate::open_store(&registry, &args.target_dir, &args.schema)?;

        let readiness = store.check_readiness();
        if !readiness.ready {
            warn!(
                "[Analyse::execute] store in {} is {}",
                args.target_dir.display(),
                readiness.health_status
            );
        }

        let report = OwnershipAnalyser::new(&store).analyse(args.table.as_deref());
        registry.close_all();

        let json = serde_json::to_string_pretty(&report)?;
        if let Some(output) = &args.output {
            std::fs::write(output, &json)
                .with_context(|| format!("[Analyse::execute] unable to write {}", output.display()))?;
        }
        match args.format {
            ReportFormat::Json => println!("{json}"),
            ReportFormat::Table => println!("{}", format::ownership_tables(&report)),
        }
        Ok(())
    }
}
