use anyhow::Context;
use asset_serde::{cmd::TransformArgs, Transformer};
use tracing::info;

use crate::Cli;

#[derive(Debug, Default)]
pub struct Transform {}

impl Transform {
    pub async fn execute(&self, cli: &Cli, args: &TransformArgs) -> anyhow::Result<()> {
        let mut config = crate::ingest_config(cli)?;
        if let Some(workers) = args.workers {
            config.transform_workers = workers.max(1);
        }

        let report = Transformer::new(config)
            .transform_directory(&args.source_dir, &args.target_dir)
            .await
            .with_context(|| {
                format!(
                    "[Transform::execute] unable to flatten {} into {}",
                    args.source_dir.display(),
                    args.target_dir.display()
                )
            })?;

        info!(
            "[Transform::execute] {} successful, {} failed",
            report.successful, report.failed
        );
        println!("{}", serde_json::to_string_pretty(&report)?);
        Ok(())
    }
}
