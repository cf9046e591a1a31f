//! Ownership aggregation over the loaded store.
//!
//! Every distribution groups assets by one ownership dimension, counting how
//! many assets fall under each owner and how many of those have no owner at
//! all. Null or blank owners collapse into the `Zombie` bucket. Query
//! failures never escape: they come back as an empty result plus an error.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::{
    error::{IngestError, IngestResult},
    persist::quote_ident,
    registry::AssetStore,
    schema::{FieldSource, TableSchema},
};

pub const ZOMBIE: &str = "Zombie";
pub const UNKNOWN_BU: &str = "Unknown BU";
pub const UNKNOWN_MBU: &str = "Unknown MBU";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    ParentCloud,
    Cloud,
    Team,
    BusinessUnit,
    ManagementBusinessUnit,
}

impl Dimension {
    pub fn label(&self) -> &'static str {
        match self {
            Dimension::ParentCloud => "parent_cloud",
            Dimension::Cloud => "cloud",
            Dimension::Team => "team",
            Dimension::BusinessUnit => "bu",
            Dimension::ManagementBusinessUnit => "mbu",
        }
    }

    /// Sub-field extracted when the grouping column holds structured text.
    fn embedded_key(&self) -> &'static str {
        match self {
            Dimension::ParentCloud | Dimension::Cloud | Dimension::Team => "name",
            Dimension::BusinessUnit => "bu",
            Dimension::ManagementBusinessUnit => "mbu",
        }
    }

    fn source(&self, table: &TableSchema) -> Option<FieldSource> {
        let column = |c: &Option<String>| {
            c.as_ref()
                .map(|column| FieldSource::Column { column: column.clone() })
        };
        match self {
            Dimension::ParentCloud => column(&table.ownership.parent_cloud),
            Dimension::Cloud => column(&table.ownership.cloud),
            Dimension::Team => column(&table.ownership.team),
            Dimension::BusinessUnit => table.business_units.bu.clone(),
            Dimension::ManagementBusinessUnit => table.business_units.mbu.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AggregationRow {
    pub group_key: String,
    pub total_assets: i64,
    pub unowned_assets: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BusinessUnitRow {
    pub bu: String,
    pub mbu: String,
    pub total_assets: i64,
    pub unowned_assets: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Distribution<R> {
    pub rows: Vec<R>,
    pub error: Option<String>,
}

impl<R> Distribution<R> {
    fn from_result(result: IngestResult<Vec<R>>) -> Distribution<R> {
        match result {
            Ok(rows) => Distribution { rows, error: None },
            Err(err) => {
                warn!("[ownership] {}", err);
                Distribution {
                    rows: Vec::new(),
                    error: Some(err.to_string()),
                }
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OwnershipSummary {
    pub total_assets: i64,
    pub total_assets_unowned: i64,
    pub total_parent_clouds: usize,
    pub total_clouds: usize,
    pub total_teams: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OwnershipReport {
    pub table: Option<String>,
    pub summary: OwnershipSummary,
    pub parent_cloud: Distribution<AggregationRow>,
    pub cloud: Distribution<AggregationRow>,
    pub team: Distribution<AggregationRow>,
    pub bu: Distribution<BusinessUnitRow>,
    pub mbu: Distribution<AggregationRow>,
}

/// Expression-level view of one dimension on one table.
struct Grouping {
    /// SQL yielding the raw (possibly null or blank) owner value.
    value: String,
}

impl Grouping {
    fn key(&self, fallback: &str) -> String {
        format!(
            "COALESCE(NULLIF(TRIM(CAST({} AS TEXT)), ''), '{}')",
            self.value, fallback
        )
    }

    fn blank(&self) -> String {
        format!(
            "({v} IS NULL OR TRIM(CAST({v} AS TEXT)) = '')",
            v = self.value
        )
    }

    fn unowned(&self) -> String {
        format!("SUM(CASE WHEN {} THEN 1 ELSE 0 END)", self.blank())
    }
}

pub struct OwnershipAnalyser<'a> {
    store: &'a AssetStore,
}

impl<'a> OwnershipAnalyser<'a> {
    pub fn new(store: &'a AssetStore) -> OwnershipAnalyser<'a> {
        OwnershipAnalyser { store }
    }

    pub fn parent_cloud_distribution(&self, table: Option<&str>) -> Distribution<AggregationRow> {
        self.distribution(Dimension::ParentCloud, table)
    }

    pub fn cloud_distribution(&self, table: Option<&str>) -> Distribution<AggregationRow> {
        self.distribution(Dimension::Cloud, table)
    }

    pub fn team_distribution(&self, table: Option<&str>) -> Distribution<AggregationRow> {
        self.distribution(Dimension::Team, table)
    }

    pub fn mbu_distribution(&self, table: Option<&str>) -> Distribution<AggregationRow> {
        self.distribution(Dimension::ManagementBusinessUnit, table)
    }

    /// Two-dimensional BU x MBU breakdown; unowned counts follow the BU value.
    pub fn bu_distribution(&self, table: Option<&str>) -> Distribution<BusinessUnitRow> {
        Distribution::from_result(self.try_bu_distribution(table))
    }

    /// Single-dimension distribution over one table, or across every declared
    /// table present in the store when `table` is `None`.
    pub fn distribution(
        &self,
        dimension: Dimension,
        table: Option<&str>,
    ) -> Distribution<AggregationRow> {
        Distribution::from_result(self.try_distribution(dimension, table))
    }

    pub fn ownership_summary(&self, table: Option<&str>) -> OwnershipSummary {
        match self.try_summary(table) {
            Ok(summary) => summary,
            Err(err) => {
                warn!("[ownership_summary] {}", err);
                OwnershipSummary {
                    error: Some(err.to_string()),
                    ..OwnershipSummary::default()
                }
            }
        }
    }

    pub fn analyse(&self, table: Option<&str>) -> OwnershipReport {
        OwnershipReport {
            table: table.map(String::from),
            summary: self.ownership_summary(table),
            parent_cloud: self.parent_cloud_distribution(table),
            cloud: self.cloud_distribution(table),
            team: self.team_distribution(table),
            bu: self.bu_distribution(table),
            mbu: self.mbu_distribution(table),
        }
    }

    fn tables(&self, table: Option<&str>) -> IngestResult<Vec<&'a TableSchema>> {
        let schema = self.store.schema();
        match table {
            Some(name) => schema
                .table(name)
                .map(|t| vec![t])
                .ok_or_else(|| IngestError::Query(format!("table {name} is not declared"))),
            None => {
                let existing = self.store.existing_tables()?;
                Ok(schema
                    .tables()
                    .iter()
                    .filter(|t| existing.contains(&t.table_name))
                    .collect())
            }
        }
    }

    /// Resolves how to read `dimension` from `table`. A plain column whose
    /// sampled value looks like serialized JSON is read as an embedded object.
    fn grouping(&self, dimension: Dimension, table: &TableSchema) -> IngestResult<Option<Grouping>> {
        let Some(source) = dimension.source(table) else {
            return Ok(None);
        };
        let source = match source {
            FieldSource::Column { column } if self.looks_structured(table, &column)? => {
                FieldSource::Embedded {
                    column,
                    key: dimension.embedded_key().to_string(),
                }
            }
            other => other,
        };
        let value = match &source {
            FieldSource::Column { column } => quote_ident(column),
            FieldSource::Embedded { column, key } => {
                let column = quote_ident(column);
                format!("(CASE WHEN json_valid({column}) THEN json_extract({column}, '$.{key}') END)")
            }
        };
        Ok(Some(Grouping { value }))
    }

    fn looks_structured(&self, table: &TableSchema, column: &str) -> IngestResult<bool> {
        let sql = format!(
            "SELECT {c} AS sample FROM {t} WHERE {c} IS NOT NULL AND TRIM({c}) != '' LIMIT 1",
            c = quote_ident(column),
            t = quote_ident(&table.table_name)
        );
        let rows = self.store.execute_query(&sql)?;
        Ok(rows
            .first()
            .and_then(|row| row.get("sample"))
            .and_then(Value::as_str)
            .map(|sample| {
                let sample = sample.trim_start();
                sample.starts_with('{') || sample.starts_with('[')
            })
            .unwrap_or(false))
    }

    fn per_table_sql(&self, dimension: Dimension, table: &TableSchema) -> IngestResult<Option<String>> {
        Ok(self.grouping(dimension, table)?.map(|grouping| {
            format!(
                "SELECT {key} AS group_key, COUNT(*) AS total_assets, {unowned} AS unowned_assets FROM {table} GROUP BY 1",
                key = grouping.key(ZOMBIE),
                unowned = grouping.unowned(),
                table = quote_ident(&table.table_name)
            )
        }))
    }

    fn try_distribution(
        &self,
        dimension: Dimension,
        table: Option<&str>,
    ) -> IngestResult<Vec<AggregationRow>> {
        let mut queries = Vec::new();
        for schema in self.tables(table)? {
            if let Some(sql) = self.per_table_sql(dimension, schema)? {
                queries.push(sql);
            }
        }
        if queries.is_empty() {
            return Err(IngestError::Query(format!(
                "no {} column available{}",
                dimension.label(),
                table.map(|t| format!(" in {t}")).unwrap_or_default()
            )));
        }

        let sql = queries.join(" UNION ALL ");
        debug!("[ownership] {} distribution: {}", dimension.label(), sql);
        let mut merged: BTreeMap<String, (i64, i64)> = BTreeMap::new();
        for row in self.store.execute_query(&sql)? {
            let entry = merged.entry(text(&row, "group_key")).or_default();
            entry.0 += count(&row, "total_assets");
            entry.1 += count(&row, "unowned_assets");
        }

        let mut rows: Vec<AggregationRow> = merged
            .into_iter()
            .map(|(group_key, (total_assets, unowned_assets))| AggregationRow {
                group_key,
                total_assets,
                unowned_assets,
            })
            .collect();
        rows.sort_by(|a, b| {
            b.total_assets
                .cmp(&a.total_assets)
                .then_with(|| a.group_key.cmp(&b.group_key))
        });
        Ok(rows)
    }

    fn try_bu_distribution(&self, table: Option<&str>) -> IngestResult<Vec<BusinessUnitRow>> {
        let mut queries = Vec::new();
        for schema in self.tables(table)? {
            let Some(bu) = self.grouping(Dimension::BusinessUnit, schema)? else {
                continue;
            };
            let mbu = match self.grouping(Dimension::ManagementBusinessUnit, schema)? {
                Some(mbu) => mbu.key(UNKNOWN_MBU),
                None => format!("'{UNKNOWN_MBU}'"),
            };
            queries.push(format!(
                "SELECT {bu_key} AS bu, {mbu} AS mbu, COUNT(*) AS total_assets, {unowned} AS unowned_assets FROM {table} GROUP BY 1, 2",
                bu_key = bu.key(UNKNOWN_BU),
                unowned = bu.unowned(),
                table = quote_ident(&schema.table_name)
            ));
        }
        if queries.is_empty() {
            return Err(IngestError::Query("no bu column available".to_string()));
        }

        let mut merged: BTreeMap<(String, String), (i64, i64)> = BTreeMap::new();
        for row in self.store.execute_query(&queries.join(" UNION ALL "))? {
            let entry = merged
                .entry((text(&row, "bu"), text(&row, "mbu")))
                .or_default();
            entry.0 += count(&row, "total_assets");
            entry.1 += count(&row, "unowned_assets");
        }

        let mut rows: Vec<BusinessUnitRow> = merged
            .into_iter()
            .map(|((bu, mbu), (total_assets, unowned_assets))| BusinessUnitRow {
                bu,
                mbu,
                total_assets,
                unowned_assets,
            })
            .collect();
        rows.sort_by(|a, b| {
            b.total_assets
                .cmp(&a.total_assets)
                .then_with(|| (&a.bu, &a.mbu).cmp(&(&b.bu, &b.mbu)))
        });
        Ok(rows)
    }

    fn try_summary(&self, table: Option<&str>) -> IngestResult<OwnershipSummary> {
        let mut total_assets = 0;
        let mut total_assets_unowned = 0;
        for schema in self.tables(table)? {
            let name = quote_ident(&schema.table_name);
            let total = self
                .store
                .execute_query(&format!("SELECT COUNT(*) AS total FROM {name}"))?;
            total_assets += total.first().map(|row| count(row, "total")).unwrap_or(0);

            let mut blanks = Vec::new();
            for dimension in [Dimension::ParentCloud, Dimension::Cloud, Dimension::Team] {
                if let Some(grouping) = self.grouping(dimension, schema)? {
                    blanks.push(grouping.blank());
                }
            }
            // a table without ownership columns counts as owned
            if !blanks.is_empty() {
                let unowned = self.store.execute_query(&format!(
                    "SELECT COUNT(*) AS total FROM {name} WHERE {}",
                    blanks.join(" AND ")
                ))?;
                total_assets_unowned += unowned.first().map(|row| count(row, "total")).unwrap_or(0);
            }
        }

        let distinct = |dimension| {
            self.try_distribution(dimension, table)
                .map(|rows| rows.len())
                .unwrap_or(0)
        };
        Ok(OwnershipSummary {
            total_assets,
            total_assets_unowned,
            total_parent_clouds: distinct(Dimension::ParentCloud),
            total_clouds: distinct(Dimension::Cloud),
            total_teams: distinct(Dimension::Team),
            error: None,
        })
    }
}

fn text(row: &Map<String, Value>, key: &str) -> String {
    match row.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

fn count(row: &Map<String, Value>, key: &str) -> i64 {
    row.get(key).and_then(Value::as_i64).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        persist::{self, RowBuilder},
        registry::StoreRegistry,
        schema::{tests::SCHEMA_YAML, SchemaRegistry},
    };
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn seeded_store(dir: &std::path::Path, assets: Value) -> anyhow::Result<Arc<AssetStore>> {
        let schema = Arc::new(SchemaRegistry::from_yaml_str(SCHEMA_YAML)?);
        let registry = StoreRegistry::new();
        let store = registry.open(dir, schema)?;
        let records: Vec<_> = assets
            .as_array()
            .unwrap()
            .iter()
            .map(|asset| crate::flatten::flatten(asset.as_object().unwrap()))
            .collect();
        store.with_connection(true, |conn| {
            persist::create_tables(conn, store.schema())?;
            let rows = RowBuilder::new(store.schema()).rows(&records);
            let tx = conn.transaction()?;
            persist::insert_rows(&tx, store.schema(), &rows)?;
            tx.commit()?;
            Ok(())
        })?;
        Ok(store)
    }

    fn owned(id: &str, class: &str, parent_cloud: &str, team: &str) -> Value {
        json!({
            "id": id,
            "assetClass": class,
            "assetAttributions": [{
                "roles": ["resource_owner"],
                "parentCloud": {"name": parent_cloud},
                "team": {"name": team}
            }],
            "properties": {"bu": "Retail", "mbu": "Stores"}
        })
    }

    #[test]
    fn test_distribution_with_zombie_bucket() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = seeded_store(
            dir.path(),
            json!([
                owned("a", "server", "AWS", "Payments"),
                owned("b", "server", "AWS", ""),
                owned("c", "server", "GCP", "Payments"),
                {"id": "d", "assetClass": "server"},
            ]),
        )?;
        let analyser = OwnershipAnalyser::new(&store);

        let parent = analyser.parent_cloud_distribution(Some("servers"));
        assert_eq!(parent.error, None);
        assert_eq!(
            parent.rows,
            vec![
                AggregationRow { group_key: "AWS".into(), total_assets: 2, unowned_assets: 0 },
                AggregationRow { group_key: "GCP".into(), total_assets: 1, unowned_assets: 0 },
                AggregationRow { group_key: ZOMBIE.into(), total_assets: 1, unowned_assets: 1 },
            ]
        );

        let team = analyser.team_distribution(Some("servers"));
        let total: i64 = team.rows.iter().map(|r| r.total_assets).sum();
        let unowned: i64 = team.rows.iter().map(|r| r.unowned_assets).sum();
        assert_eq!(total - unowned, 2);
        assert_eq!(team.rows[0].group_key, "Payments");
        assert_eq!(team.rows[1].group_key, ZOMBIE);
        assert_eq!(team.rows[1].unowned_assets, 2);

        let cloud = analyser.cloud_distribution(Some("servers"));
        assert_eq!(
            cloud.rows,
            vec![AggregationRow { group_key: ZOMBIE.into(), total_assets: 4, unowned_assets: 4 }]
        );
        Ok(())
    }

    #[test]
    fn test_business_unit_breakdown() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = seeded_store(
            dir.path(),
            json!([
                owned("a", "service", "AWS", "Payments"),
                owned("b", "service", "AWS", "Payments"),
                {"id": "c", "assetClass": "service", "properties": {"bu": "", "mbu": "Ops"}},
            ]),
        )?;
        let analyser = OwnershipAnalyser::new(&store);

        let bu = analyser.bu_distribution(Some("services"));
        assert_eq!(bu.error, None);
        assert_eq!(
            bu.rows,
            vec![
                BusinessUnitRow {
                    bu: "Retail".into(),
                    mbu: "Stores".into(),
                    total_assets: 2,
                    unowned_assets: 0
                },
                BusinessUnitRow {
                    bu: UNKNOWN_BU.into(),
                    mbu: "Ops".into(),
                    total_assets: 1,
                    unowned_assets: 1
                },
            ]
        );

        let mbu = analyser.mbu_distribution(Some("services"));
        assert_eq!(mbu.rows[0].group_key, "Stores");
        assert_eq!(mbu.rows[1].group_key, "Ops");
        Ok(())
    }

    #[test]
    fn test_cross_table_equals_sum_of_tables() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = seeded_store(
            dir.path(),
            json!([
                owned("a", "server", "AWS", "Payments"),
                owned("b", "service", "AWS", "Payments"),
                owned("c", "aws_sqs", "GCP", "Ops"),
                {"id": "d"},
            ]),
        )?;
        let analyser = OwnershipAnalyser::new(&store);

        let all = analyser.parent_cloud_distribution(None);
        let mut summed: BTreeMap<String, i64> = BTreeMap::new();
        for table in store.existing_tables()? {
            for row in analyser.parent_cloud_distribution(Some(table.as_str())).rows {
                *summed.entry(row.group_key).or_default() += row.total_assets;
            }
        }
        let crossed: BTreeMap<String, i64> = all
            .rows
            .iter()
            .map(|r| (r.group_key.clone(), r.total_assets))
            .collect();
        assert_eq!(crossed, summed);
        assert_eq!(all.rows[0].group_key, "AWS");

        let summary = analyser.ownership_summary(None);
        assert_eq!(summary.total_assets, 4);
        assert_eq!(summary.total_assets_unowned, 1);
        assert_eq!(summary.total_parent_clouds, 3);
        assert_eq!(summary.total_teams, 3);
        assert_eq!(summary.total_clouds, 1);
        Ok(())
    }

    #[test]
    fn test_failures_surface_as_errors() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = seeded_store(dir.path(), json!([{"id": "a"}]))?;
        let analyser = OwnershipAnalyser::new(&store);

        let unknown = analyser.team_distribution(Some("nope"));
        assert!(unknown.is_empty());
        assert!(unknown.error.is_some());

        store.with_connection(false, |conn| {
            Ok(conn.execute_batch("ALTER TABLE servers RENAME COLUMN team TO squad")?)
        })?;
        let renamed = analyser.team_distribution(Some("servers"));
        assert!(renamed.is_empty());
        assert!(renamed.error.unwrap().contains("team"));
        Ok(())
    }

    #[test]
    fn test_structured_values_are_extracted() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = seeded_store(dir.path(), json!([]))?;
        store.with_connection(false, |conn| {
            Ok(conn.execute_batch(
                r#"INSERT INTO ec2 (id, team) VALUES ('i1', '{"name":"Infra"}'), ('i2', '{"name":""}')"#,
            )?)
        })?;
        let rows = OwnershipAnalyser::new(&store).team_distribution(Some("ec2")).rows;
        assert_eq!(
            rows,
            vec![
                AggregationRow { group_key: "Infra".into(), total_assets: 1, unowned_assets: 0 },
                AggregationRow { group_key: ZOMBIE.into(), total_assets: 1, unowned_assets: 1 },
            ]
        );
        Ok(())
    }
}
