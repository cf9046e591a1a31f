use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use asset_serde::{
    ownership::{AggregationRow, BusinessUnitRow, UNKNOWN_BU, UNKNOWN_MBU, ZOMBIE},
    registry::HealthStatus,
    IngestConfig, LoadMode, Loader, OwnershipAnalyser, SchemaRegistry, StoreRegistry, Transformer,
};
use pretty_assertions::assert_eq;

fn support_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../support")
}

fn schema() -> anyhow::Result<Arc<SchemaRegistry>> {
    Ok(Arc::new(SchemaRegistry::from_path(
        &support_dir().join("schema/asset-schema.yml"),
    )?))
}

fn row(group_key: &str, total_assets: i64, unowned_assets: i64) -> AggregationRow {
    AggregationRow {
        group_key: group_key.to_string(),
        total_assets,
        unowned_assets,
    }
}

/// Flattens the fixture inventory into a fresh directory and returns it.
async fn flattened_fixtures(workers: usize) -> anyhow::Result<tempfile::TempDir> {
    let target = tempfile::tempdir()?;
    let report = Transformer::new(IngestConfig::default().with_workers(workers))
        .transform_directory(&support_dir().join("test-fixtures/assets"), target.path())
        .await?;

    assert_eq!(report.total, 3);
    assert_eq!(report.successful, 2);
    assert_eq!(report.failed, 1);
    assert_eq!(report.source_assets, 6);
    assert_eq!(report.normalised_assets, 6);
    assert_eq!(report.totals.missing_attribution, 2);
    assert_eq!(report.totals.missing_name, 1);
    let broken = report.files.iter().find(|f| !f.success).unwrap();
    assert!(broken.input.ends_with("broken.json"));
    assert!(broken.error.as_deref().unwrap().starts_with("SourceReadError"));
    Ok(target)
}

async fn load_with(mode: LoadMode) -> anyhow::Result<()> {
    let target = flattened_fixtures(2).await?;
    let registry = StoreRegistry::new();
    let store = registry.open(target.path(), schema()?)?;

    let before = store.check_readiness();
    assert_eq!(before.health_status, HealthStatus::FilesOnly);
    assert!(!before.ready);

    let report = Loader::new(IngestConfig::default().with_workers(2).with_load_mode(mode))
        .load(&store)
        .await?;
    assert_eq!(report.mode, mode);
    assert_eq!(report.total, 2);
    assert_eq!(report.failed, 0);
    assert_eq!(report.valid_records, 6);
    assert_eq!(report.rows_loaded, report.valid_records as i64);
    assert_eq!(report.table_rows.get("servers"), Some(&3));
    assert_eq!(report.table_rows.get("services"), Some(&1));
    assert_eq!(report.table_rows.get("aws_services"), Some(&1));
    assert_eq!(report.table_rows.get("assets"), Some(&1));
    assert_eq!(report.table_rows.get("ec2"), Some(&0));

    let after = store.check_readiness();
    assert_eq!(after.health_status, HealthStatus::Healthy);
    assert!(after.ready);
    assert_eq!(after.object_count, 6);

    let analyser = OwnershipAnalyser::new(&store);
    assert_eq!(
        analyser.parent_cloud_distribution(None).rows,
        vec![row("Commerce", 3, 0), row(ZOMBIE, 2, 2), row("Finance", 1, 0)]
    );
    assert_eq!(
        analyser.cloud_distribution(None).rows,
        vec![row(ZOMBIE, 3, 3), row("Payments", 2, 0), row("Ledger", 1, 0)]
    );
    assert_eq!(
        analyser.team_distribution(None).rows,
        vec![row(ZOMBIE, 3, 3), row("Checkout", 2, 0), row("Bookkeeping", 1, 0)]
    );
    assert_eq!(
        analyser.team_distribution(Some("servers")).rows,
        vec![row(ZOMBIE, 2, 2), row("Checkout", 1, 0)]
    );

    let bu = analyser.bu_distribution(None);
    assert_eq!(bu.error, None);
    assert_eq!(
        bu.rows[0],
        BusinessUnitRow {
            bu: "Retail".to_string(),
            mbu: "Online".to_string(),
            total_assets: 2,
            unowned_assets: 0,
        }
    );
    assert_eq!(
        bu.rows[1],
        BusinessUnitRow {
            bu: UNKNOWN_BU.to_string(),
            mbu: UNKNOWN_MBU.to_string(),
            total_assets: 2,
            unowned_assets: 2,
        }
    );
    assert_eq!(bu.rows.iter().map(|r| r.total_assets).sum::<i64>(), 6);

    let summary = analyser.ownership_summary(None);
    assert_eq!(summary.total_assets, 6);
    assert_eq!(summary.total_assets_unowned, 2);
    assert_eq!(summary.total_parent_clouds, 3);

    let raw = store.execute_query("SELECT raw_data FROM servers WHERE id = 'srv-001'")?;
    let raw: serde_json::Value = serde_json::from_str(raw[0]["raw_data"].as_str().unwrap())?;
    assert_eq!(raw["parent_cloud"], "Commerce");
    assert_eq!(raw["tags_pci"], "true");
    assert!(raw.get("location").is_none());

    registry.close_all();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_parallel_load() -> anyhow::Result<()> {
    load_with(LoadMode::Parallel).await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_isolated_load() -> anyhow::Result<()> {
    load_with(LoadMode::Isolated).await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_streaming_load() -> anyhow::Result<()> {
    load_with(LoadMode::Streaming).await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reload_replaces_previous_rows() -> anyhow::Result<()> {
    let target = flattened_fixtures(1).await?;
    let registry = StoreRegistry::new();
    let store = registry.open(target.path(), schema()?)?;
    let loader = Loader::new(IngestConfig::default().with_workers(1));

    let first = loader.load(&store).await?;
    let second = loader.load(&store).await?;
    assert_eq!(first.rows_loaded, 6);
    assert_eq!(second.rows_loaded, 6);
    assert_eq!(second.mode, LoadMode::Parallel);
    Ok(())
}
