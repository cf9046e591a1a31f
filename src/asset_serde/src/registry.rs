use std::{
    collections::{BTreeMap, HashMap},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
};

use rusqlite::Connection;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::{
    error::{IngestError, IngestResult},
    persist,
    schema::SchemaRegistry,
    transform::json_files,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Error,
    NoFiles,
    FilesOnly,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => f.write_str("HEALTHY"),
            HealthStatus::Warning => f.write_str("WARNING"),
            HealthStatus::Error => f.write_str("ERROR"),
            HealthStatus::NoFiles => f.write_str("NO_FILES"),
            HealthStatus::FilesOnly => f.write_str("FILES_ONLY"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Readiness {
    pub ready: bool,
    pub health_status: HealthStatus,
    pub object_count: i64,
    pub table_count: usize,
    pub error: Option<String>,
}

impl Readiness {
    fn failed(health_status: HealthStatus, error: String) -> Readiness {
        Readiness {
            ready: false,
            health_status,
            object_count: 0,
            table_count: 0,
            error: Some(error),
        }
    }
}

/// One store file per backing directory. The connection is opened lazily so
/// an instance can report readiness before anything has been loaded.
#[derive(Debug)]
pub struct AssetStore {
    backing_dir: PathBuf,
    path: PathBuf,
    schema: Arc<SchemaRegistry>,
    conn: Mutex<Option<Connection>>,
}

impl AssetStore {
    fn new(backing_dir: PathBuf, schema: Arc<SchemaRegistry>) -> AssetStore {
        AssetStore {
            path: persist::store_path(&backing_dir),
            backing_dir,
            schema,
            conn: Mutex::new(None),
        }
    }

    pub fn backing_dir(&self) -> &Path {
        &self.backing_dir
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn schema(&self) -> &SchemaRegistry {
        &self.schema
    }

    pub fn shared_schema(&self) -> Arc<SchemaRegistry> {
        Arc::clone(&self.schema)
    }

    pub fn is_open(&self) -> bool {
        self.lock().map(|conn| conn.is_some()).unwrap_or(false)
    }

    fn lock(&self) -> IngestResult<MutexGuard<'_, Option<Connection>>> {
        self.conn
            .lock()
            .map_err(|_| IngestError::Query(format!("store {} lock poisoned", self.path.display())))
    }

    /// Runs `f` with the store connection, creating the store file when
    /// `create` is set. Without `create` a missing store file is an error.
    pub(crate) fn with_connection<R>(
        &self,
        create: bool,
        f: impl FnOnce(&mut Connection) -> IngestResult<R>,
    ) -> IngestResult<R> {
        let mut guard = self.lock()?;
        if guard.is_none() {
            if !create && !self.path.exists() {
                return Err(IngestError::Query(format!(
                    "store {} has not been created",
                    self.path.display()
                )));
            }
            debug!("[AssetStore] opening {}", self.path.display());
            *guard = Some(persist::open_store(&self.path)?);
        }
        match guard.as_mut() {
            Some(conn) => f(conn),
            None => Err(IngestError::Query("store connection unavailable".to_string())),
        }
    }

    pub fn execute_query(&self, sql: &str) -> IngestResult<Vec<Map<String, Value>>> {
        self.with_connection(false, |conn| {
            persist::query_json_rows(conn, sql).map_err(|err| IngestError::Query(err.to_string()))
        })
    }

    /// Declared tables present in the store, in declaration order.
    pub fn existing_tables(&self) -> IngestResult<Vec<String>> {
        self.with_connection(false, |conn| {
            let existing = persist::table_names(conn)?;
            Ok(self
                .schema
                .table_names()
                .into_iter()
                .filter(|table| existing.iter().any(|name| name == table))
                .map(String::from)
                .collect())
        })
    }

    /// Declared tables that exist in the store with their row counts.
    pub fn table_counts(&self) -> IngestResult<BTreeMap<String, i64>> {
        let tables = self.existing_tables()?;
        self.with_connection(false, |conn| {
            let mut counts = BTreeMap::new();
            for table in tables {
                let rows = persist::count_rows(conn, &table)?;
                counts.insert(table, rows);
            }
            Ok(counts)
        })
    }

    /// Health report for collaborators. Never fails; problems are reported in
    /// `health_status` and `error`.
    pub fn check_readiness(&self) -> Readiness {
        if !self.is_open() && !self.path.exists() {
            let artifacts = json_files(&self.backing_dir)
                .map(|files| files.len())
                .unwrap_or(0);
            return if artifacts > 0 {
                Readiness::failed(
                    HealthStatus::FilesOnly,
                    format!("{artifacts} JSON files found but the store has not been loaded"),
                )
            } else {
                Readiness::failed(
                    HealthStatus::NoFiles,
                    format!("no JSON files or store in {}", self.backing_dir.display()),
                )
            };
        }

        let inspected = self.with_connection(false, |conn| {
            persist::test_connection(conn)?;
            let tables = persist::table_names(conn)?;
            let mut object_count = 0;
            for table in self.schema.table_names() {
                if tables.iter().any(|name| name == table) {
                    object_count += persist::count_rows(conn, table)?;
                }
            }
            Ok((tables, object_count))
        });

        let (tables, object_count) = match inspected {
            Ok(inspected) => inspected,
            Err(err) => {
                return Readiness::failed(HealthStatus::Error, format!("store check failed: {err}"))
            }
        };

        let health_status = if tables.is_empty() {
            HealthStatus::Error
        } else if !tables.iter().any(|name| name == self.schema.default_table()) {
            HealthStatus::Warning
        } else {
            HealthStatus::Healthy
        };
        let ready = health_status == HealthStatus::Healthy && object_count > 0;
        Readiness {
            ready,
            health_status,
            object_count,
            table_count: tables.len(),
            error: (!ready)
                .then(|| format!("data not ready: {health_status}, {object_count} objects")),
        }
    }

    /// Drops the connection. The next call reopens the existing file.
    pub fn close(&self) {
        if let Ok(mut guard) = self.lock() {
            if guard.take().is_some() {
                debug!("[AssetStore] closed {}", self.path.display());
            }
        }
    }
}

/// Live store instances keyed by canonical backing directory. A second
/// `open` for the same directory returns the instance already registered.
#[derive(Debug, Default)]
pub struct StoreRegistry {
    stores: Mutex<HashMap<PathBuf, Arc<AssetStore>>>,
}

impl StoreRegistry {
    pub fn new() -> StoreRegistry {
        StoreRegistry::default()
    }

    fn lock(&self) -> IngestResult<MutexGuard<'_, HashMap<PathBuf, Arc<AssetStore>>>> {
        self.stores
            .lock()
            .map_err(|_| IngestError::Query("store registry lock poisoned".to_string()))
    }

    fn key(backing_dir: &Path) -> IngestResult<PathBuf> {
        std::fs::canonicalize(backing_dir).map_err(|err| IngestError::source_read(backing_dir, err))
    }

    pub fn open(
        &self,
        backing_dir: &Path,
        schema: Arc<SchemaRegistry>,
    ) -> IngestResult<Arc<AssetStore>> {
        let key = Self::key(backing_dir)?;
        let mut stores = self.lock()?;
        if let Some(store) = stores.get(&key) {
            debug!("[StoreRegistry] reusing store for {}", key.display());
            return Ok(Arc::clone(store));
        }
        info!("[StoreRegistry] registering store for {}", key.display());
        let store = Arc::new(AssetStore::new(key.clone(), schema));
        stores.insert(key, Arc::clone(&store));
        Ok(store)
    }

    pub fn get(&self, backing_dir: &Path) -> Option<Arc<AssetStore>> {
        let key = Self::key(backing_dir).ok()?;
        self.lock().ok()?.get(&key).cloned()
    }

    /// Closes and unregisters the store for `backing_dir`. Returns whether
    /// one was registered.
    pub fn close(&self, backing_dir: &Path) -> bool {
        let Ok(key) = Self::key(backing_dir) else {
            return false;
        };
        let removed = self.lock().ok().and_then(|mut stores| stores.remove(&key));
        match removed {
            Some(store) => {
                store.close();
                true
            }
            None => false,
        }
    }

    pub fn close_all(&self) {
        if let Ok(mut stores) = self.lock() {
            for (_, store) in stores.drain() {
                store.close();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.lock().map(|stores| stores.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::tests::SCHEMA_YAML;
    use pretty_assertions::assert_eq;

    fn schema() -> Arc<SchemaRegistry> {
        Arc::new(SchemaRegistry::from_yaml_str(SCHEMA_YAML).unwrap())
    }

    #[test]
    fn test_registry_reuses_open_instance() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let registry = StoreRegistry::new();

        let first = registry.open(dir.path(), schema())?;
        let second = registry.open(&dir.path().join("."), schema())?;
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
        assert!(registry.get(dir.path()).is_some());

        assert!(registry.close(dir.path()));
        assert!(!registry.close(dir.path()));
        assert!(registry.is_empty());

        let third = registry.open(dir.path(), schema())?;
        assert!(!Arc::ptr_eq(&first, &third));
        registry.close_all();
        assert!(registry.is_empty());
        Ok(())
    }

    #[test]
    fn test_open_requires_existing_directory() {
        let registry = StoreRegistry::new();
        let result = registry.open(Path::new("/no/such/backing/dir"), schema());
        assert!(matches!(result, Err(IngestError::SourceRead { .. })));
    }

    #[test]
    fn test_readiness_without_store() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let registry = StoreRegistry::new();
        let store = registry.open(dir.path(), schema())?;

        let readiness = store.check_readiness();
        assert_eq!(readiness.health_status, HealthStatus::NoFiles);
        assert!(!readiness.ready);

        std::fs::write(dir.path().join("a_flattened.json"), "[]")?;
        let readiness = store.check_readiness();
        assert_eq!(readiness.health_status, HealthStatus::FilesOnly);
        assert!(readiness.error.is_some());

        assert!(store.execute_query("SELECT 1").is_err());
        assert!(!store.path().exists());
        Ok(())
    }

    #[test]
    fn test_readiness_states() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let registry = StoreRegistry::new();
        let store = registry.open(dir.path(), schema())?;

        store.with_connection(true, |_| Ok(()))?;
        assert_eq!(store.check_readiness().health_status, HealthStatus::Error);

        store.with_connection(true, |conn| {
            persist::create_tables(conn, store.schema())?;
            Ok(())
        })?;
        let readiness = store.check_readiness();
        assert_eq!(readiness.health_status, HealthStatus::Healthy);
        assert_eq!(readiness.table_count, 9);
        assert!(!readiness.ready);

        store.execute_query("INSERT INTO servers (id) VALUES ('s1')")?;
        let readiness = store.check_readiness();
        assert!(readiness.ready);
        assert_eq!(readiness.object_count, 1);
        assert_eq!(readiness.error, None);

        store.execute_query("DROP TABLE assets")?;
        assert_eq!(store.check_readiness().health_status, HealthStatus::Warning);

        let rows = store.execute_query("SELECT id FROM servers")?;
        assert_eq!(rows[0]["id"], Value::from("s1"));
        assert!(matches!(
            store.execute_query("SELECT missing FROM servers"),
            Err(IngestError::Query(_))
        ));
        Ok(())
    }
}
