use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::catalog::{Catalog, TableSchema};
use crate::record::Row;
use crate::{EngineError, EngineResult, ObjectKind};

/// File name of the per-database catalog.
pub const CATALOG_FILE: &str = "metadata.json";
const TABLE_EXTENSION: &str = "json";

/// Whole-file JSON persistence under `<root>/<database>/`.
///
/// Every save rewrites its file in full. There is no locking and no atomic
/// replace: an interrupted write can leave a truncated file behind.
#[derive(Debug, Clone)]
pub struct TableStore {
    root: PathBuf,
    pretty: bool,
}

impl TableStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            pretty: true,
        }
    }

    pub fn with_pretty(mut self, pretty: bool) -> Self {
        self.pretty = pretty;
        self
    }

    pub fn database_dir(&self, database: &str) -> PathBuf {
        self.root.join(database)
    }

    pub fn catalog_path(&self, database: &str) -> PathBuf {
        self.database_dir(database).join(CATALOG_FILE)
    }

    pub fn table_path(&self, database: &str, table: &str) -> PathBuf {
        self.database_dir(database)
            .join(table)
            .with_extension(TABLE_EXTENSION)
    }

    pub fn database_exists(&self, database: &str) -> bool {
        self.database_dir(database).is_dir()
    }

    /// Creates the database directory and an empty catalog if absent.
    pub fn ensure(&self, database: &str) -> EngineResult<()> {
        fs::create_dir_all(self.database_dir(database))?;
        let catalog_path = self.catalog_path(database);
        if !catalog_path.exists() {
            debug!(database, "creating empty catalog");
            self.write_json(&catalog_path, &Catalog::new())?;
        }
        Ok(())
    }

    /// Names of all database directories under the root, sorted.
    pub fn list_databases(&self) -> EngineResult<Vec<String>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    pub fn drop_database(&self, database: &str) -> EngineResult<()> {
        let dir = self.database_dir(database);
        if !dir.is_dir() {
            return Err(EngineError::NotFound {
                kind: ObjectKind::Database,
                name: database.to_string(),
            });
        }
        fs::remove_dir_all(dir)?;
        Ok(())
    }

    /// Reads the catalog; a missing catalog file reads as empty.
    pub fn load_catalog(&self, database: &str) -> EngineResult<Catalog> {
        Ok(self
            .read_json(&self.catalog_path(database))?
            .unwrap_or_default())
    }

    pub fn save_catalog(&self, database: &str, catalog: &Catalog) -> EngineResult<()> {
        self.ensure(database)?;
        self.write_json(&self.catalog_path(database), catalog)
    }

    /// Upserts one schema entry, keyed by table name, and rewrites the catalog.
    pub fn save_schema(&self, database: &str, schema: &TableSchema) -> EngineResult<()> {
        let mut catalog = self.load_catalog(database)?;
        catalog.upsert(schema.clone());
        self.save_catalog(database, &catalog)
    }

    pub fn remove_schema(&self, database: &str, table: &str) -> EngineResult<()> {
        let mut catalog = self.load_catalog(database)?;
        if catalog.remove_table(table).is_some() {
            self.save_catalog(database, &catalog)?;
        }
        Ok(())
    }

    pub fn save_rows(&self, database: &str, table: &str, rows: &[Row]) -> EngineResult<()> {
        self.ensure(database)?;
        debug!(database, table, rows = rows.len(), "writing table file");
        self.write_json(&self.table_path(database, table), rows)
    }

    /// Reads a table's full row sequence; a missing file reads as empty.
    pub fn load_rows(&self, database: &str, table: &str) -> EngineResult<Vec<Row>> {
        Ok(self
            .read_json(&self.table_path(database, table))?
            .unwrap_or_default())
    }

    pub fn remove_rows(&self, database: &str, table: &str) -> EngineResult<()> {
        match fs::remove_file(self.table_path(database, table)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn write_json<T: Serialize + ?Sized>(&self, path: &Path, value: &T) -> EngineResult<()> {
        let encoded = if self.pretty {
            serde_json::to_vec_pretty(value)
        } else {
            serde_json::to_vec(value)
        }
        .map_err(|source| EngineError::Corrupt {
            path: path.to_path_buf(),
            source,
        })?;
        fs::write(path, encoded)?;
        Ok(())
    }

    fn read_json<T: DeserializeOwned>(&self, path: &Path) -> EngineResult<Option<T>> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| EngineError::Corrupt {
                path: path.to_path_buf(),
                source,
            })
    }
}
