use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use thiserror::Error;
use tracing::{debug, info, warn};

mod catalog;
mod config;
mod index;
mod record;
mod store;

pub use catalog::{Catalog, ColumnSchema, ColumnType, ForeignKey, TableSchema};
pub use config::EngineConfig;
pub use index::Index;
pub use record::{Predicate, Row, Value};
pub use store::{TableStore, CATALOG_FILE};

/// Table name reserved for the catalog file.
const RESERVED_TABLE_NAME: &str = "metadata";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Database,
    Table,
    Column,
    Row,
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ObjectKind::Database => "database",
            ObjectKind::Table => "table",
            ObjectKind::Column => "column",
            ObjectKind::Row => "row",
        })
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no database selected")]
    NoActiveDatabase,

    #[error("{kind} '{name}' not found")]
    NotFound { kind: ObjectKind, name: String },

    #[error("missing column '{column}' for table '{table}'")]
    MissingColumn { table: String, column: String },

    #[error("column '{column}' expects {expected}, got {actual}")]
    TypeCoercion {
        column: String,
        expected: ColumnType,
        actual: &'static str,
    },

    #[error("duplicate primary key '{value}' in table '{table}'")]
    DuplicateKey { table: String, value: Value },

    #[error("foreign key violation: {table}.{column} = '{value}' has no match in {reference}")]
    ForeignKeyViolation {
        table: String,
        column: String,
        value: Value,
        reference: String,
    },

    #[error("integrity violation: {0}")]
    IntegrityViolation(String),

    #[error("table '{0}' already exists")]
    TableExists(String),

    #[error("column '{column}' is not declared by table '{table}'")]
    UnknownColumn { table: String, column: String },

    #[error("invalid schema: {0}")]
    InvalidSchema(String),

    #[error("invalid name '{0}': use letters, digits, '_' or '-'")]
    InvalidName(String),

    #[error("invalid predicate: {0}")]
    InvalidPredicate(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot decode {}: {source}", .path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl EngineError {
    pub(crate) fn table_not_found(table: &str) -> Self {
        EngineError::NotFound {
            kind: ObjectKind::Table,
            name: table.to_string(),
        }
    }

    pub(crate) fn column_not_found(table: &str, column: &str) -> Self {
        EngineError::NotFound {
            kind: ObjectKind::Column,
            name: format!("{table}.{column}"),
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Schemas and primary-key indices of the selected database.
#[derive(Debug)]
struct ActiveDatabase {
    name: String,
    catalog: Catalog,
    indices: HashMap<String, Index>,
}

impl ActiveDatabase {
    fn schema(&self, table: &str) -> EngineResult<&TableSchema> {
        self.catalog
            .table(table)
            .ok_or_else(|| EngineError::table_not_found(table))
    }
}

/// Operational surface over one data root.
///
/// Row-level operations act on the selected database and fail with
/// [`EngineError::NoActiveDatabase`] until [`Engine::select_database`] has
/// succeeded. The engine is single-writer: callers sharing one instance
/// across threads must serialize access themselves.
#[derive(Debug)]
pub struct Engine {
    store: TableStore,
    active: Option<ActiveDatabase>,
}

impl Engine {
    pub fn open(config: EngineConfig) -> Self {
        Self {
            store: TableStore::new(config.data_dir).with_pretty(config.pretty),
            active: None,
        }
    }

    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self::open(EngineConfig::new().with_data_dir(data_dir))
    }

    pub fn store(&self) -> &TableStore {
        &self.store
    }

    pub fn active_database(&self) -> Option<&str> {
        self.active.as_ref().map(|db| db.name.as_str())
    }

    fn active(&self) -> EngineResult<&ActiveDatabase> {
        self.active.as_ref().ok_or(EngineError::NoActiveDatabase)
    }

    pub fn table_names(&self) -> EngineResult<Vec<&str>> {
        Ok(self.active()?.catalog.table_names())
    }

    pub fn schema(&self, table: &str) -> EngineResult<&TableSchema> {
        self.active()?.schema(table)
    }

    /// Primary-key index of `table`, if the table declares a key.
    pub fn index(&self, table: &str) -> Option<&Index> {
        self.active.as_ref()?.indices.get(table)
    }

    pub fn list_databases(&self) -> EngineResult<Vec<String>> {
        self.store.list_databases()
    }

    /// Makes `name` the active database, creating it when it does not exist,
    /// and rebuilds every primary-key index from stored rows.
    pub fn select_database(&mut self, name: &str) -> EngineResult<()> {
        validate_name(name)?;
        let created = !self.store.database_exists(name);
        self.hydrate(name)?;
        info!(
            database = name,
            tables = self.active()?.catalog.tables().len(),
            created,
            "database selected"
        );
        Ok(())
    }

    pub fn drop_database(&mut self, name: &str) -> EngineResult<()> {
        validate_name(name)?;
        self.store.drop_database(name)?;
        if self.active_database() == Some(name) {
            self.active = None;
        }
        info!(database = name, "database dropped");
        Ok(())
    }

    /// Rebuilds the primary-key indices of the active database by scanning
    /// each keyed table in stored order.
    pub fn rebuild_indices(&mut self) -> EngineResult<()> {
        let db = self.active.as_mut().ok_or(EngineError::NoActiveDatabase)?;
        db.indices = build_indices(&self.store, &db.name, &db.catalog)?;
        Ok(())
    }

    /// Reloads catalog and indices of the active database from disk.
    fn rehydrate(&mut self) -> EngineResult<()> {
        let name = self.active()?.name.clone();
        self.hydrate(&name)
    }

    fn hydrate(&mut self, name: &str) -> EngineResult<()> {
        self.store.ensure(name)?;
        let catalog = self.store.load_catalog(name)?;
        let indices = build_indices(&self.store, name, &catalog)?;
        self.active = Some(ActiveDatabase {
            name: name.to_string(),
            catalog,
            indices,
        });
        Ok(())
    }

    pub fn create_table(&mut self, schema: TableSchema) -> EngineResult<()> {
        let db = self.active.as_mut().ok_or(EngineError::NoActiveDatabase)?;
        validate_table_name(&schema.name)?;
        schema.check()?;
        for fk in &schema.foreign_keys {
            validate_table_name(&fk.parent_table)?;
        }
        if db.catalog.table(&schema.name).is_some() {
            return Err(EngineError::TableExists(schema.name));
        }

        self.store.save_schema(&db.name, &schema)?;
        self.store.save_rows(&db.name, &schema.name, &[])?;
        if let Some(pk) = &schema.primary_key {
            db.indices.insert(schema.name.clone(), Index::new(pk.clone()));
        }
        info!(database = %db.name, table = %schema.name, "table created");
        db.catalog.upsert(schema);
        Ok(())
    }

    pub fn drop_table(&mut self, table: &str) -> EngineResult<()> {
        let db = self.active.as_mut().ok_or(EngineError::NoActiveDatabase)?;
        db.schema(table)?;

        self.store.remove_schema(&db.name, table)?;
        self.store.remove_rows(&db.name, table)?;
        db.catalog.remove_table(table);
        db.indices.remove(table);
        info!(database = %db.name, table, "table dropped");
        Ok(())
    }

    /// Validates, constraint-checks and appends one row. Returns the row as
    /// stored.
    pub fn insert(&mut self, table: &str, row: Row) -> EngineResult<Row> {
        let db = self.active.as_mut().ok_or(EngineError::NoActiveDatabase)?;
        let schema = db
            .catalog
            .table(table)
            .ok_or_else(|| EngineError::table_not_found(table))?;
        let row = schema.validate(&row)?;
        reject_undeclared(schema, &row)?;

        let mut rows = self.store.load_rows(&db.name, table)?;
        let key = match &schema.primary_key {
            Some(pk) => {
                let index = db
                    .indices
                    .entry(table.to_string())
                    .or_insert_with(|| Index::build(pk.clone(), &rows).0);
                let value = row.get(pk).cloned();
                if let Some(value) = &value {
                    if index.get(value).is_some() {
                        return Err(EngineError::DuplicateKey {
                            table: table.to_string(),
                            value: value.clone(),
                        });
                    }
                }
                value
            }
            None => None,
        };
        check_foreign_keys(&self.store, &db.name, schema, &row)?;

        let position = rows.len();
        if let (Some(value), Some(index)) = (&key, db.indices.get_mut(table)) {
            index.add(value, position);
        }
        rows.push(row.clone());
        if let Err(err) = self.store.save_rows(&db.name, table, &rows) {
            if let (Some(value), Some(index)) = (&key, db.indices.get_mut(table)) {
                index.remove(value);
            }
            return Err(err);
        }
        debug!(table, position, "row inserted");
        Ok(row)
    }

    /// Returns every row of `table`, or the rows whose column equals the
    /// predicate value after coercion to the column's declared type.
    pub fn select(&self, table: &str, predicate: Option<&Predicate>) -> EngineResult<Vec<Row>> {
        let db = self.active()?;
        let schema = db.schema(table)?;
        let rows = self.store.load_rows(&db.name, table)?;
        let Some(predicate) = predicate else {
            return Ok(rows);
        };

        let column = predicate.column.as_str();
        let value = schema.coerce(column, &predicate.value)?;
        let matches = |row: &Row| row.get(column) == Some(&value);

        if let Some(index) = db.indices.get(table).filter(|index| index.column() == column) {
            debug!(table, column, "select via index");
            return Ok(index
                .get(&value)
                .and_then(|position| rows.into_iter().nth(position))
                .filter(|row| matches(row))
                .into_iter()
                .collect());
        }
        debug!(table, column, rows = rows.len(), "select via scan");
        Ok(rows.into_iter().filter(|row| matches(row)).collect())
    }

    /// Merges `fields` into the row whose primary key equals `key`, then
    /// re-validates, persists and rehydrates. Returns the updated row.
    pub fn update(&mut self, table: &str, key: &Value, fields: Row) -> EngineResult<Row> {
        let db = self.active()?;
        let schema = db.schema(table)?;
        let pk = schema.primary_key.as_deref().ok_or_else(|| {
            EngineError::InvalidPredicate(format!("table '{table}' has no primary key"))
        })?;
        let key = schema.coerce(pk, key)?;

        let mut rows = self.store.load_rows(&db.name, table)?;
        let position = rows
            .iter()
            .position(|row| row.get(pk) == Some(&key))
            .ok_or_else(|| EngineError::NotFound {
                kind: ObjectKind::Row,
                name: format!("{table}.{pk}={key}"),
            })?;

        let mut merged = rows[position].clone();
        for (column, value) in fields {
            merged.insert(column, value);
        }
        let merged = schema.validate(&merged)?;
        reject_undeclared(schema, &merged)?;
        if let Some(new_key) = merged.get(pk) {
            let collides = rows
                .iter()
                .enumerate()
                .any(|(other, row)| other != position && row.get(pk) == Some(new_key));
            if collides {
                return Err(EngineError::DuplicateKey {
                    table: table.to_string(),
                    value: new_key.clone(),
                });
            }
        }
        check_foreign_keys(&self.store, &db.name, schema, &merged)?;

        rows[position] = merged.clone();
        self.store.save_rows(&db.name, table, &rows)?;
        debug!(table, position, "row updated");
        self.rehydrate()?;
        Ok(merged)
    }

    /// Removes every row matching all `predicate` columns. An empty
    /// predicate matches every row. Returns the number of rows removed.
    pub fn delete(&mut self, table: &str, predicate: &Row) -> EngineResult<usize> {
        let db = self.active()?;
        let schema = db.schema(table)?;
        let conditions = predicate
            .iter()
            .map(|(column, value)| schema.coerce(column, value).map(|value| (column, value)))
            .collect::<EngineResult<Vec<_>>>()?;

        let rows = self.store.load_rows(&db.name, table)?;
        let before = rows.len();
        let kept: Vec<Row> = rows
            .into_iter()
            .filter(|row| {
                !conditions
                    .iter()
                    .all(|(column, value)| row.get(column) == Some(value))
            })
            .collect();
        let removed = before - kept.len();

        self.store.save_rows(&db.name, table, &kept)?;
        debug!(table, removed, "rows deleted");
        self.rehydrate()?;
        Ok(removed)
    }

    /// Inner nested-loop join on `left.left_column == right.right_column`,
    /// comparing stored values as-is.
    ///
    /// Each result holds the left row's fields followed by the right row's;
    /// a right field whose name is already taken is renamed
    /// `"<right>_<name>"`. Results follow left order, then right order.
    pub fn join(
        &self,
        left: &str,
        right: &str,
        left_column: &str,
        right_column: &str,
    ) -> EngineResult<Vec<Row>> {
        let db = self.active()?;
        for (table, column) in [(left, left_column), (right, right_column)] {
            if db.schema(table)?.column(column).is_none() {
                return Err(EngineError::column_not_found(table, column));
            }
        }

        let left_rows = self.store.load_rows(&db.name, left)?;
        let right_rows = self.store.load_rows(&db.name, right)?;
        let mut joined = Vec::new();
        for left_row in &left_rows {
            let Some(left_value) = left_row.get(left_column) else {
                continue;
            };
            for right_row in &right_rows {
                if right_row.get(right_column) == Some(left_value) {
                    joined.push(merge_rows(left_row, right_row, right));
                }
            }
        }
        debug!(left, right, rows = joined.len(), "join complete");
        Ok(joined)
    }

    /// Declares a new column and backfills existing rows with `default`
    /// (coerced to the column type) or the type's zero value.
    pub fn add_column(
        &mut self,
        table: &str,
        column: ColumnSchema,
        default: Option<Value>,
    ) -> EngineResult<()> {
        let db = self.active()?;
        let mut updated = db.schema(table)?.clone();
        let fill = match default {
            Some(value) => column.column_type.coerce(&value).ok_or_else(|| {
                EngineError::TypeCoercion {
                    column: column.name.clone(),
                    expected: column.column_type,
                    actual: value.type_name(),
                }
            })?,
            None => column.column_type.zero_value(),
        };
        let name = column.name.clone();
        updated.add_column(column)?;
        updated.check()?;

        let mut rows = self.store.load_rows(&db.name, table)?;
        for row in &mut rows {
            row.insert(name.clone(), fill.clone());
        }
        self.store.save_schema(&db.name, &updated)?;
        self.store.save_rows(&db.name, table, &rows)?;
        info!(database = %db.name, table, column = %name, "column added");
        self.rehydrate()
    }

    /// Drops a column from the schema and from every stored row. The
    /// primary-key column cannot be removed.
    pub fn remove_column(&mut self, table: &str, column: &str) -> EngineResult<()> {
        let db = self.active()?;
        let mut updated = db.schema(table)?.clone();
        updated.remove_column(column)?;

        let mut rows = self.store.load_rows(&db.name, table)?;
        for row in &mut rows {
            row.remove(column);
        }
        self.store.save_schema(&db.name, &updated)?;
        self.store.save_rows(&db.name, table, &rows)?;
        info!(database = %db.name, table, column, "column removed");
        self.rehydrate()
    }
}

fn validate_name(name: &str) -> EngineResult<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(EngineError::InvalidName(name.to_string()))
    }
}

fn validate_table_name(name: &str) -> EngineResult<()> {
    validate_name(name)?;
    if name == RESERVED_TABLE_NAME {
        return Err(EngineError::InvalidName(name.to_string()));
    }
    Ok(())
}

fn reject_undeclared(schema: &TableSchema, row: &Row) -> EngineResult<()> {
    match schema.undeclared_column(row) {
        Some(column) => Err(EngineError::UnknownColumn {
            table: schema.name.clone(),
            column: column.to_string(),
        }),
        None => Ok(()),
    }
}

/// Full scan of each parent table; no parent index is consulted.
fn check_foreign_keys(
    store: &TableStore,
    database: &str,
    schema: &TableSchema,
    row: &Row,
) -> EngineResult<()> {
    for fk in &schema.foreign_keys {
        let Some(value) = row.get(&fk.column) else {
            continue;
        };
        // Catalogs are editable on disk; the parent name becomes a path.
        validate_table_name(&fk.parent_table)?;
        let parents = store.load_rows(database, &fk.parent_table)?;
        if !parents
            .iter()
            .any(|parent| parent.get(&fk.parent_column) == Some(value))
        {
            return Err(EngineError::ForeignKeyViolation {
                table: schema.name.clone(),
                column: fk.column.clone(),
                value: value.clone(),
                reference: fk.reference(),
            });
        }
    }
    Ok(())
}

fn build_indices(
    store: &TableStore,
    database: &str,
    catalog: &Catalog,
) -> EngineResult<HashMap<String, Index>> {
    let mut indices = HashMap::new();
    for table in catalog.tables() {
        let Some(pk) = &table.primary_key else {
            continue;
        };
        let rows = store.load_rows(database, &table.name)?;
        let (index, duplicates) = Index::build(pk.clone(), &rows);
        if !duplicates.is_empty() {
            warn!(
                database,
                table = %table.name,
                duplicates = duplicates.len(),
                "stored rows repeat primary key values; first occurrence indexed"
            );
        }
        debug!(database, table = %table.name, entries = index.len(), "index rebuilt");
        indices.insert(table.name.clone(), index);
    }
    Ok(indices)
}

/// Appends `right` to a copy of `left`. A right field whose name is taken
/// becomes `<right_table>_<name>`, then `<right_table>_<name>_2`, `_3`, ...
/// until the name is free, so no left value is ever overwritten.
fn merge_rows(left: &Row, right: &Row, right_table: &str) -> Row {
    let mut merged = left.clone();
    for (column, value) in right.iter() {
        let name = if merged.contains(column) {
            free_name(&merged, &format!("{right_table}_{column}"))
        } else {
            column.to_string()
        };
        merged.insert(name, value.clone());
    }
    merged
}

fn free_name(row: &Row, base: &str) -> String {
    if !row.contains(base) {
        return base.to_string();
    }
    (2..)
        .map(|suffix| format!("{base}_{suffix}"))
        .find(|candidate| !row.contains(candidate))
        .unwrap_or_else(|| base.to_string())
}
