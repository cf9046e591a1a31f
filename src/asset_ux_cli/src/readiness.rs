use asset_serde::{cmd::ReadinessArgs, StoreRegistry};

#[derive(Debug, Default)]
pub struct Readiness {}

impl Readiness {
    pub fn execute(&self, args: &ReadinessArgs) -> anyhow::Result<()> {
        let registry = StoreRegistry::new();
        let store = crate::open_store(&registry, &args.target_dir, &args.schema)?;
        let readiness = store.check_readiness();
        registry.close_all();

        println!("{}", serde_json::to_string_pretty(&readiness)?);
        Ok(())
    }
}
