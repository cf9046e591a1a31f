use std::{collections::BTreeMap, path::Path};

use common::{
    execute_sql, execute_sql_batch, execute_sql_no_args, query_sql_rows_no_args,
    query_sql_single_no_args,
};
use indoc::indoc;
use rusqlite::{
    params_from_iter, types::Value as SqlValue, Connection, OpenFlags, Result as RusqliteResult, ToSql,
    Transaction,
};
use serde_json::{Map, Value};
use tracing::debug;

use crate::{
    flatten::FlatRecord,
    schema::{LogicalType, SchemaRegistry, TableSchema},
};

pub const DEFAULT_STORE_FILE_NAME: &str = "assetinsight.sqlite.db";
const CHUNK_STORE_ALIAS: &str = "chunk_store";

// separate the SQL from the execute so we can use it in logging, errors, etc.
const PREPARE_STORE_SQL: &str = indoc! {"
    PRAGMA journal_mode = WAL;
    PRAGMA synchronous = NORMAL;
    PRAGMA temp_store = MEMORY;
"};

const PREPARE_CHUNK_STORE_SQL: &str = indoc! {"
    PRAGMA journal_mode = OFF;
    PRAGMA synchronous = OFF;
"};

const SELECT_TABLE_NAMES_SQL: &str = indoc! {"
    SELECT name
      FROM sqlite_master
     WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
     ORDER BY name
"};

execute_sql_batch!(prepare_store, PREPARE_STORE_SQL);
execute_sql_batch!(prepare_chunk_store, PREPARE_CHUNK_STORE_SQL);
query_sql_single_no_args!(test_connection, "SELECT 1"; ok: i64);
query_sql_rows_no_args!(for_each_table_name, SELECT_TABLE_NAMES_SQL; name: String);
execute_sql!(attach_chunk_store, "ATTACH DATABASE ?1 AS chunk_store", path: &str);
execute_sql_no_args!(detach_chunk_store, "DETACH DATABASE chunk_store");

pub fn store_path(backing_dir: &Path) -> std::path::PathBuf {
    backing_dir.join(DEFAULT_STORE_FILE_NAME)
}

pub fn open_store(path: &Path) -> RusqliteResult<Connection> {
    let conn = Connection::open(path)?;
    prepare_store(&conn)?;
    Ok(conn)
}

pub fn open_chunk_store(path: &Path) -> RusqliteResult<Connection> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
    )?;
    prepare_chunk_store(&conn)?;
    Ok(conn)
}

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub fn table_names(conn: &Connection) -> RusqliteResult<Vec<String>> {
    let mut names = Vec::new();
    for_each_table_name(conn, |_, name| {
        names.push(name);
        Ok(())
    })?;
    Ok(names)
}

pub fn create_table_sql(table: &TableSchema) -> String {
    let columns = table
        .columns
        .iter()
        .map(|c| format!("    {} TEXT", quote_ident(&c.name)))
        .collect::<Vec<_>>()
        .join(",\n");
    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n{}\n)",
        quote_ident(&table.table_name),
        columns
    )
}

pub fn create_index_sql(table: &TableSchema) -> Vec<String> {
    table
        .index_columns()
        .iter()
        .map(|column| {
            format!(
                "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
                quote_ident(&format!("idx_{}_{}", table.table_name, column)),
                quote_ident(&table.table_name),
                quote_ident(column)
            )
        })
        .collect()
}

pub fn insert_sql(table: &TableSchema) -> String {
    let columns = table
        .columns
        .iter()
        .map(|c| quote_ident(&c.name))
        .collect::<Vec<_>>()
        .join(", ");
    let placeholders = (1..=table.columns.len())
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quote_ident(&table.table_name),
        columns,
        placeholders
    )
}

/// Drops every declared table so a load always starts from an empty store.
pub fn reset_tables(conn: &Connection, schema: &SchemaRegistry) -> RusqliteResult<()> {
    for table in schema.tables() {
        conn.execute_batch(&format!(
            "DROP TABLE IF EXISTS {}",
            quote_ident(&table.table_name)
        ))?;
    }
    Ok(())
}

pub fn create_tables(conn: &Connection, schema: &SchemaRegistry) -> RusqliteResult<()> {
    for table in schema.tables() {
        conn.execute_batch(&create_table_sql(table))?;
    }
    Ok(())
}

pub fn create_indexes(conn: &Connection, schema: &SchemaRegistry) -> RusqliteResult<()> {
    for table in schema.tables() {
        for sql in create_index_sql(table) {
            debug!("[create_indexes] {sql}");
            conn.execute_batch(&sql)?;
        }
    }
    Ok(())
}

pub type Row = Vec<SqlValue>;

/// Schema-shaped rows grouped by destination table.
#[derive(Debug, Default)]
pub struct RowSet {
    pub tables: BTreeMap<String, Vec<Row>>,
}

impl RowSet {
    pub fn len(&self) -> usize {
        self.tables.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn push(&mut self, table: &str, row: Row) {
        self.tables.entry(table.to_string()).or_default().push(row);
    }
}

/// Turns flattened records into row tuples in schema column order.
pub struct RowBuilder<'a> {
    schema: &'a SchemaRegistry,
}

impl<'a> RowBuilder<'a> {
    pub fn new(schema: &'a SchemaRegistry) -> RowBuilder<'a> {
        RowBuilder { schema }
    }

    pub fn route(&self, record: &FlatRecord) -> &'a TableSchema {
        self.schema
            .table_for_class(record.get("assetClass").and_then(Value::as_str))
    }

    pub fn row(&self, table: &TableSchema, record: &FlatRecord) -> Row {
        table
            .columns
            .iter()
            .map(|column| {
                if column.name == self.schema.raw_column() {
                    return SqlValue::Text(Value::Object(record.clone()).to_string());
                }
                match column.logical_type {
                    LogicalType::Scalar => scalar(record.get(&column.name)),
                    LogicalType::EmbeddedObject => embedded(&column.name, record),
                }
            })
            .collect()
    }

    pub fn rows<'r>(&self, records: impl IntoIterator<Item = &'r FlatRecord>) -> RowSet {
        let mut rows = RowSet::default();
        for record in records {
            let table = self.route(record);
            rows.push(&table.table_name, self.row(table, record));
        }
        rows
    }
}

fn scalar(value: Option<&Value>) -> SqlValue {
    match value {
        None | Some(Value::Null) => SqlValue::Null,
        Some(Value::String(s)) => SqlValue::Text(s.clone()),
        Some(other) => SqlValue::Text(other.to_string()),
    }
}

/// Rebuilds `{key: value}` from every `<column>_<key>` entry, dropping nulls
/// and empty strings, and serializes it.
fn embedded(column: &str, record: &FlatRecord) -> SqlValue {
    let prefix = format!("{column}_");
    let nested: Map<String, Value> = record
        .iter()
        .filter_map(|(key, value)| {
            let key = key.strip_prefix(&prefix)?;
            match value {
                Value::Null => None,
                Value::String(s) if s.is_empty() => None,
                other => Some((key.to_string(), other.clone())),
            }
        })
        .collect();
    SqlValue::Text(Value::Object(nested).to_string())
}

/// Inserts every row of `rows` inside `tx` with one cached statement per table.
pub fn insert_rows(tx: &Transaction, schema: &SchemaRegistry, rows: &RowSet) -> RusqliteResult<usize> {
    let mut inserted = 0;
    for (table_name, table_rows) in &rows.tables {
        let Some(table) = schema.table(table_name) else {
            continue;
        };
        let mut stmt = tx.prepare_cached(&insert_sql(table))?;
        for row in table_rows {
            inserted += stmt.execute(params_from_iter(row.iter()))?;
        }
    }
    Ok(inserted)
}

/// Copies every declared table of a private chunk store into the main store.
/// ATTACH cannot run inside a transaction, so the copy happens between an
/// attach and a detach on the main connection.
pub fn merge_chunk_store(
    conn: &mut Connection,
    schema: &SchemaRegistry,
    chunk_path: &Path,
) -> RusqliteResult<usize> {
    attach_chunk_store(conn, &chunk_path.to_string_lossy())?;
    let copied = (|| -> RusqliteResult<usize> {
        let tx = conn.transaction()?;
        let mut copied = 0;
        for table in schema.tables() {
            let sql = format!(
                "INSERT INTO main.{table} SELECT * FROM {alias}.{table}",
                table = quote_ident(&table.table_name),
                alias = CHUNK_STORE_ALIAS
            );
            copied += tx.execute(&sql, [])?;
        }
        tx.commit()?;
        Ok(copied)
    })();
    detach_chunk_store(conn)?;
    copied
}

pub fn count_rows(conn: &Connection, table: &str) -> RusqliteResult<i64> {
    conn.query_row(
        &format!("SELECT COUNT(*) FROM {}", quote_ident(table)),
        [],
        |row| row.get(0),
    )
}

/// Runs `sql` and returns every row as a JSON object keyed by column name.
pub fn query_json_rows(conn: &Connection, sql: &str) -> RusqliteResult<Vec<Map<String, Value>>> {
    let mut stmt = conn.prepare(sql)?;
    let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let mut rows = stmt.query([])?;
    let mut result = Vec::new();
    while let Some(row) = rows.next()? {
        let mut object = Map::new();
        for (index, name) in names.iter().enumerate() {
            let value = match row.get::<_, SqlValue>(index)? {
                SqlValue::Null => Value::Null,
                SqlValue::Integer(i) => Value::from(i),
                SqlValue::Real(f) => Value::from(f),
                SqlValue::Text(s) => Value::String(s),
                SqlValue::Blob(b) => Value::String(String::from_utf8_lossy(&b).to_string()),
            };
            object.insert(name.clone(), value);
        }
        result.push(object);
    }
    Ok(result)
}
