use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const ATTRIBUTIONS_KEY: &str = "assetAttributions";
pub const PROPERTIES_KEY: &str = "properties";
pub const TAGS_KEY: &str = "tags";
pub const RESOURCE_OWNER_ROLE: &str = "resource_owner";

/// Top-level keys that are never copied verbatim into a flattened record.
const SKIPPED_KEYS: &[&str] = &[ATTRIBUTIONS_KEY, PROPERTIES_KEY, TAGS_KEY, "location"];

/// `(attribution block, flattened column prefix)` in output order.
const OWNERSHIP_BLOCKS: &[(&str, &str)] = &[
    ("parentCloud", "parent_cloud"),
    ("cloud", "cloud"),
    ("team", "team"),
];

pub type FlatRecord = Map<String, Value>;

/// Flattens one raw asset into a single-level record.
///
/// Retains top-level scalars, adds the nine ownership columns taken from the
/// first `resource_owner` attribution, and prefixes every `properties` and
/// `tags` entry. Any other nested block is dropped. The function is pure: the
/// same input always produces the same output.
pub fn flatten(asset: &Map<String, Value>) -> FlatRecord {
    let mut flat = Map::new();

    for (key, value) in asset {
        if SKIPPED_KEYS.contains(&key.as_str()) {
            continue;
        }
        if is_scalar(value) {
            flat.insert(key.clone(), value.clone());
        }
    }

    if let Some(Value::Array(attributions)) = asset.get(ATTRIBUTIONS_KEY) {
        if !attributions.is_empty() {
            flat.extend(ownership(attributions));
        }
    }

    if let Some(Value::Object(properties)) = asset.get(PROPERTIES_KEY) {
        flat.extend(prefixed(PROPERTIES_KEY, properties));
    }
    if let Some(Value::Object(tags)) = asset.get(TAGS_KEY) {
        flat.extend(prefixed(TAGS_KEY, tags));
    }

    flat
}

/// Ownership columns from the first attribution whose `roles` contains
/// `resource_owner`. When none qualifies every column is null; there is no
/// fallback to another attribution.
pub fn ownership(attributions: &[Value]) -> FlatRecord {
    let owner = attributions
        .iter()
        .filter_map(Value::as_object)
        .find(|attribution| has_owner_role(attribution));

    let mut columns = Map::new();
    for (block, prefix) in OWNERSHIP_BLOCKS {
        let entity = owner
            .and_then(|attribution| attribution.get(*block))
            .and_then(Value::as_object);
        let lead = entity
            .and_then(|e| e.get("lead"))
            .and_then(Value::as_object);

        columns.insert(
            prefix.to_string(),
            entity.map_or(Value::Null, |e| leaf(e.get("name"))),
        );
        columns.insert(
            format!("{prefix}_id"),
            entity.map_or(Value::Null, |e| leaf(e.get("identifier"))),
        );
        columns.insert(
            format!("{prefix}_owner_email"),
            lead.map_or(Value::Null, |l| leaf(l.get("emailId"))),
        );
    }
    columns
}

fn has_owner_role(attribution: &Map<String, Value>) -> bool {
    match attribution.get("roles") {
        Some(Value::Array(roles)) => roles
            .iter()
            .any(|role| role.as_str() == Some(RESOURCE_OWNER_ROLE)),
        _ => false,
    }
}

/// Ownership leaves follow [`string_cast`] for scalars, so `false` and `0`
/// survive as text. Missing or structured values become null.
fn leaf(value: Option<&Value>) -> Value {
    match value {
        Some(scalar @ (Value::String(_) | Value::Number(_) | Value::Bool(_))) => {
            string_cast(scalar)
        }
        _ => Value::Null,
    }
}

fn prefixed(prefix: &str, entries: &Map<String, Value>) -> FlatRecord {
    entries
        .iter()
        .map(|(key, value)| (format!("{prefix}_{key}"), string_cast(value)))
        .collect()
}

/// Null for null or empty strings, otherwise the value's text form.
pub fn string_cast(value: &Value) -> Value {
    match value {
        Value::Null => Value::Null,
        Value::String(s) if s.is_empty() => Value::Null,
        Value::String(s) => Value::String(s.clone()),
        other => Value::String(other.to_string()),
    }
}

fn is_scalar(value: &Value) -> bool {
    !matches!(value, Value::Array(_) | Value::Object(_))
}

/// Data-quality counters accumulated while flattening one file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileCounters {
    pub missing_attribution: u64,
    pub missing_properties: u64,
    pub missing_name: u64,
    pub missing_parent_cloud: u64,
}

impl FileCounters {
    pub fn observe(&mut self, asset: &Map<String, Value>, flat: &FlatRecord) {
        let empty_or_absent = |key: &str| match asset.get(key) {
            Some(Value::Array(items)) => items.is_empty(),
            Some(Value::Object(entries)) => entries.is_empty(),
            Some(Value::Null) | None => true,
            Some(_) => false,
        };
        if empty_or_absent(ATTRIBUTIONS_KEY) {
            self.missing_attribution += 1;
        }
        if empty_or_absent(PROPERTIES_KEY) {
            self.missing_properties += 1;
        }
        if is_missing_name(flat.get("name")) {
            self.missing_name += 1;
        }
        if is_blank(flat.get("parent_cloud")) {
            self.missing_parent_cloud += 1;
        }
    }

    pub fn merge(&mut self, other: &FileCounters) {
        self.missing_attribution += other.missing_attribution;
        self.missing_properties += other.missing_properties;
        self.missing_name += other.missing_name;
        self.missing_parent_cloud += other.missing_parent_cloud;
    }
}

fn is_blank(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.trim().is_empty(),
        Some(_) => false,
    }
}

fn is_missing_name(value: Option<&Value>) -> bool {
    match value {
        Some(Value::String(s)) => matches!(s.trim(), "" | "None" | "null"),
        other => is_blank(other),
    }
}
