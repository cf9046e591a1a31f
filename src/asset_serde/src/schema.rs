//! Column schema for the asset store.
//!
//! The schema is supplied as YAML (see `SchemaRegistry::from_yaml_str`) and
//! resolved once into per-table column lists plus a typed ownership map, so
//! neither the loader nor the aggregation engine has to infer shape at run time.

use std::{collections::HashSet, path::Path};

use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value as YamlValue};
use tracing::debug;

use crate::error::{IngestError, IngestResult};

pub const DEFAULT_TABLE: &str = "assets";
pub const DEFAULT_RAW_COLUMN: &str = "raw_data";

/// Built-in asset classes as `(class_name, display_name, table_name)`, used
/// when the schema document does not declare its own `classes` list.
pub const BUILTIN_ASSET_CLASSES: &[(&str, &str, &str)] = &[
    ("server", "Server", "servers"),
    ("network_device", "Network Device", "network_device"),
    ("aws_rds_instance", "RDS", "rds"),
    ("aws_ec2_instance", "AWS EC2", "ec2"),
    ("aws_account", "AWS Account", "aws_accounts"),
    ("aws_eks_cluster", "AWS EKS", "containers"),
    ("aws_sqs", "AWS SQS", "aws_services"),
    ("service", "Service", "services"),
];

const PARENT_CLOUD_PATTERNS: &[&str] = &["parent_cloud", "parentcloud"];
const CLOUD_PATTERNS: &[&str] = &["cloud"];
const TEAM_PATTERNS: &[&str] = &["team"];
const MBU_PATTERNS: &[&str] = &["properties_mbu", "mbu", "properties"];
const BU_PATTERNS: &[&str] = &["properties_bu", "bu", "business_unit", "properties"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogicalType {
    Scalar,
    EmbeddedObject,
}

impl LogicalType {
    pub fn parse(type_name: &str) -> Option<LogicalType> {
        match type_name.trim().to_ascii_uppercase().as_str() {
            "VARCHAR" | "TEXT" | "STRING" | "INTEGER" | "BIGINT" | "DOUBLE" | "BOOLEAN"
            | "TIMESTAMP" => Some(LogicalType::Scalar),
            "JSON" | "OBJECT" | "STRUCT" | "MAP" => Some(LogicalType::EmbeddedObject),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnSchema {
    pub name: String,
    pub logical_type: LogicalType,
}

/// Where a business-unit style value lives: a plain column, or a key inside
/// an embedded-object column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FieldSource {
    Column { column: String },
    Embedded { column: String, key: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OwnershipColumns {
    pub parent_cloud: Option<String>,
    pub cloud: Option<String>,
    pub team: Option<String>,
}

impl OwnershipColumns {
    pub fn resolved(&self) -> Vec<&str> {
        [&self.parent_cloud, &self.cloud, &self.team]
            .into_iter()
            .filter_map(|c| c.as_deref())
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BusinessUnitColumns {
    pub bu: Option<FieldSource>,
    pub mbu: Option<FieldSource>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableSchema {
    pub table_name: String,
    pub class_names: Vec<String>,
    pub display_name: String,
    pub columns: Vec<ColumnSchema>,
    pub ownership: OwnershipColumns,
    pub business_units: BusinessUnitColumns,
}

impl TableSchema {
    fn new(table_name: &str, display_name: &str, columns: Vec<ColumnSchema>) -> TableSchema {
        let ownership = resolve_ownership(&columns);
        let business_units = resolve_business_units(&columns, &ownership);
        TableSchema {
            table_name: table_name.to_string(),
            class_names: Vec::new(),
            display_name: display_name.to_string(),
            columns,
            ownership,
            business_units,
        }
    }

    pub fn column(&self, name: &str) -> Option<&ColumnSchema> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Columns that receive a non-unique index: `id` plus the resolved
    /// ownership columns.
    pub fn index_columns(&self) -> Vec<String> {
        self.column("id")
            .map(|c| c.name.as_str())
            .into_iter()
            .chain(self.ownership.resolved())
            .map(String::from)
            .collect()
    }
}

#[derive(Debug, Deserialize)]
struct SchemaDocument {
    assets: AssetsSection,
}

#[derive(Debug, Deserialize)]
struct AssetsSection {
    #[serde(default)]
    raw_column: Option<String>,
    #[serde(default)]
    default_table: Option<String>,
    common: Option<Mapping>,
    #[serde(default)]
    classes: Option<Vec<ClassSection>>,
}

#[derive(Debug, Deserialize)]
struct ClassSection {
    class_name: String,
    #[serde(default)]
    display_name: Option<String>,
    table_name: String,
    #[serde(default)]
    columns: Option<Mapping>,
}

/// Resolved schema for every declared asset-class table.
#[derive(Debug, Clone, Serialize)]
pub struct SchemaRegistry {
    tables: Vec<TableSchema>,
    default_table: String,
    raw_column: String,
}

impl SchemaRegistry {
    pub fn from_path(path: &Path) -> IngestResult<SchemaRegistry> {
        let text = std::fs::read_to_string(path).map_err(|err| {
            IngestError::Schema(format!("unable to read {}: {}", path.display(), err))
        })?;
        Self::from_yaml_str(&text)
    }

    pub fn from_yaml_str(text: &str) -> IngestResult<SchemaRegistry> {
        let doc: SchemaDocument = serde_yaml::from_str(text)
            .map_err(|err| IngestError::Schema(format!("invalid schema document: {err}")))?;
        let assets = doc.assets;

        let common = assets
            .common
            .ok_or_else(|| IngestError::Schema("missing assets.common section".to_string()))?;
        let common = parse_columns("assets.common", &common)?;
        if common.is_empty() {
            return Err(IngestError::Schema(
                "assets.common declares no columns".to_string(),
            ));
        }

        let default_table = assets
            .default_table
            .unwrap_or_else(|| DEFAULT_TABLE.to_string());
        let raw_column = assets
            .raw_column
            .unwrap_or_else(|| DEFAULT_RAW_COLUMN.to_string());

        let classes: Vec<(String, String, String, Vec<ColumnSchema>)> = match assets.classes {
            Some(classes) => classes
                .into_iter()
                .map(|class| {
                    let extra = match &class.columns {
                        Some(columns) => parse_columns(&class.class_name, columns)?,
                        None => Vec::new(),
                    };
                    Ok((
                        class.display_name.clone().unwrap_or(class.class_name.clone()),
                        class.class_name,
                        class.table_name,
                        extra,
                    ))
                })
                .collect::<IngestResult<_>>()?,
            None => BUILTIN_ASSET_CLASSES
                .iter()
                .map(|(class, display, table)| {
                    (display.to_string(), class.to_string(), table.to_string(), Vec::new())
                })
                .collect(),
        };

        let mut registry = SchemaRegistry {
            tables: vec![TableSchema::new(&default_table, "Assets", common.clone())],
            default_table,
            raw_column,
        };

        for (display_name, class_name, table_name, extra) in classes {
            if table_name.trim().is_empty() {
                return Err(IngestError::Schema(format!(
                    "asset class {class_name} has an empty table_name"
                )));
            }
            if let Some(existing) = registry.table_mut(&table_name) {
                existing.class_names.push(class_name);
                continue;
            }
            let mut columns = common.clone();
            for column in extra {
                if columns.iter().any(|c| c.name == column.name) {
                    return Err(IngestError::Schema(format!(
                        "asset class {class_name} redeclares column {}",
                        column.name
                    )));
                }
                columns.push(column);
            }
            let mut table = TableSchema::new(&table_name, &display_name, columns);
            table.class_names.push(class_name);
            registry.tables.push(table);
        }

        debug!(
            "[schema] resolved {} tables: {:?}",
            registry.tables.len(),
            registry.table_names()
        );
        Ok(registry)
    }

    pub fn tables(&self) -> &[TableSchema] {
        &self.tables
    }

    pub fn table_names(&self) -> Vec<&str> {
        self.tables.iter().map(|t| t.table_name.as_str()).collect()
    }

    pub fn table(&self, table_name: &str) -> Option<&TableSchema> {
        self.tables.iter().find(|t| t.table_name == table_name)
    }

    fn table_mut(&mut self, table_name: &str) -> Option<&mut TableSchema> {
        self.tables.iter_mut().find(|t| t.table_name == table_name)
    }

    /// Table receiving records of `class_name`; undeclared or missing
    /// classes land in the default table.
    pub fn table_for_class(&self, class_name: Option<&str>) -> &TableSchema {
        class_name
            .and_then(|class| {
                self.tables
                    .iter()
                    .find(|t| t.class_names.iter().any(|c| c == class))
            })
            .unwrap_or(&self.tables[0])
    }

    pub fn default_table(&self) -> &str {
        &self.default_table
    }

    pub fn raw_column(&self) -> &str {
        &self.raw_column
    }
}

fn parse_columns(section: &str, mapping: &Mapping) -> IngestResult<Vec<ColumnSchema>> {
    let mut seen = HashSet::new();
    let mut columns = Vec::with_capacity(mapping.len());
    for (name, type_name) in mapping {
        let name = match name {
            YamlValue::String(name) if !name.trim().is_empty() => name.trim().to_string(),
            other => {
                return Err(IngestError::Schema(format!(
                    "{section}: invalid column name {other:?}"
                )))
            }
        };
        let logical_type = type_name
            .as_str()
            .and_then(LogicalType::parse)
            .ok_or_else(|| {
                IngestError::Schema(format!(
                    "{section}: column {name} has unsupported type {type_name:?}"
                ))
            })?;
        if !seen.insert(name.clone()) {
            return Err(IngestError::Schema(format!(
                "{section}: duplicate column {name}"
            )));
        }
        columns.push(ColumnSchema { name, logical_type });
    }
    Ok(columns)
}

/// Picks a column for one ownership dimension. Patterns are tried in priority
/// order; within a pattern an exact name wins over a substring match, and
/// among substring matches the lowest ordinal position wins. Columns already
/// claimed by another dimension are never reused.
/// How a pattern matches a column name that is not an exact hit.
#[derive(Debug, Clone, Copy)]
enum PatternMatch {
    Substring,
    /// The pattern's `_`-separated tokens appear as a contiguous run of the
    /// name's tokens, so `bu` matches `properties_bu` but not `attributes`.
    Tokens,
}

impl PatternMatch {
    fn matches(self, name: &str, pattern: &str) -> bool {
        let name = name.to_ascii_lowercase();
        match self {
            PatternMatch::Substring => name.contains(pattern),
            PatternMatch::Tokens => {
                let tokens: Vec<&str> = name.split('_').collect();
                let wanted: Vec<&str> = pattern.split('_').collect();
                tokens.windows(wanted.len()).any(|run| run == wanted.as_slice())
            }
        }
    }
}

fn find_column<'a>(
    columns: &'a [ColumnSchema],
    patterns: &[&str],
    claimed: &[&str],
    rule: PatternMatch,
) -> Option<&'a ColumnSchema> {
    let available = || {
        columns
            .iter()
            .filter(|c| !claimed.iter().any(|taken| taken.eq_ignore_ascii_case(&c.name)))
    };
    patterns.iter().find_map(|pattern| {
        available()
            .find(|c| c.name.eq_ignore_ascii_case(pattern))
            .or_else(|| available().find(|c| rule.matches(&c.name, pattern)))
    })
}

fn resolve_ownership(columns: &[ColumnSchema]) -> OwnershipColumns {
    let scalars: Vec<ColumnSchema> = columns
        .iter()
        .filter(|c| c.logical_type == LogicalType::Scalar)
        .cloned()
        .collect();
    let mut claimed: Vec<&str> = Vec::new();

    let parent_cloud = find_column(&scalars, PARENT_CLOUD_PATTERNS, &claimed, PatternMatch::Substring).map(|c| c.name.clone());
    if let Some(col) = &parent_cloud {
        claimed.push(col);
    }
    let cloud = find_column(&scalars, CLOUD_PATTERNS, &claimed, PatternMatch::Substring).map(|c| c.name.clone());
    if let Some(col) = &cloud {
        claimed.push(col);
    }
    let team = find_column(&scalars, TEAM_PATTERNS, &claimed, PatternMatch::Substring).map(|c| c.name.clone());

    OwnershipColumns {
        parent_cloud,
        cloud,
        team,
    }
}

fn resolve_business_units(
    columns: &[ColumnSchema],
    ownership: &OwnershipColumns,
) -> BusinessUnitColumns {
    let claimed = ownership.resolved();
    let source = |patterns: &[&str], key: &str| {
        find_column(columns, patterns, &claimed, PatternMatch::Tokens).map(|c| {
            match c.logical_type {
                LogicalType::EmbeddedObject => FieldSource::Embedded {
                    column: c.name.clone(),
                    key: key.to_string(),
                },
                LogicalType::Scalar => FieldSource::Column {
                    column: c.name.clone(),
                },
            }
        })
    };
    let bu = source(BU_PATTERNS, "bu");
    let mbu = source(MBU_PATTERNS, "mbu");
    BusinessUnitColumns { bu, mbu }
}
