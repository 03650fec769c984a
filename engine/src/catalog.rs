use std::fmt;

use serde::de::{self, MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::record::{Row, Value};
use crate::{EngineError, EngineResult};

/// Declared column types.
///
/// - `Int`: signed 64-bit integer values
/// - `Float`: finite 64-bit floating point values
/// - `Str`: UTF-8 string values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    #[serde(alias = "integer")]
    Int,
    #[serde(alias = "real")]
    Float,
    #[serde(alias = "string", alias = "text")]
    Str,
}

impl ColumnType {
    pub fn name(self) -> &'static str {
        match self {
            ColumnType::Int => "int",
            ColumnType::Float => "float",
            ColumnType::Str => "str",
        }
    }

    /// Converts `value` to this type, or `None` when no lossless
    /// conversion exists.
    pub fn coerce(self, value: &Value) -> Option<Value> {
        match (self, value) {
            (ColumnType::Int, Value::Int(v)) => Some(Value::Int(*v)),
            (ColumnType::Int, Value::Float(v)) => float_to_int(*v).map(Value::Int),
            (ColumnType::Int, Value::Text(v)) => v.trim().parse::<i64>().ok().map(Value::Int),
            (ColumnType::Float, Value::Int(v)) => Some(Value::Float(*v as f64)),
            (ColumnType::Float, Value::Float(v)) => v.is_finite().then_some(Value::Float(*v)),
            (ColumnType::Float, Value::Text(v)) => v
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|parsed| parsed.is_finite())
                .map(Value::Float),
            (ColumnType::Str, Value::Text(v)) => Some(Value::Text(v.clone())),
            (ColumnType::Str, other) => Some(Value::Text(other.to_string())),
        }
    }

    /// Fill value for rows that predate a column.
    pub fn zero_value(self) -> Value {
        match self {
            ColumnType::Int => Value::Int(0),
            ColumnType::Float => Value::Float(0.0),
            ColumnType::Str => Value::Text(String::new()),
        }
    }
}

fn float_to_int(value: f64) -> Option<i64> {
    // i64::MAX as f64 rounds up to 2^63, hence the exclusive upper bound.
    if value.is_finite()
        && value.fract() == 0.0
        && value >= i64::MIN as f64
        && value < i64::MAX as f64
    {
        Some(value as i64)
    } else {
        None
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSchema {
    pub name: String,
    pub column_type: ColumnType,
}

impl ColumnSchema {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
        }
    }
}

/// `column` must match some row of `parent_table.parent_column`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKey {
    pub column: String,
    pub parent_table: String,
    pub parent_column: String,
}

impl ForeignKey {
    pub fn new(
        column: impl Into<String>,
        parent_table: impl Into<String>,
        parent_column: impl Into<String>,
    ) -> Self {
        Self {
            column: column.into(),
            parent_table: parent_table.into(),
            parent_column: parent_column.into(),
        }
    }

    /// Parses a `"<parent_table>.<parent_column>"` reference.
    pub fn parse(column: impl Into<String>, reference: &str) -> EngineResult<Self> {
        match reference.split_once('.') {
            Some((table, parent_column))
                if !table.is_empty() && !parent_column.is_empty() && !parent_column.contains('.') =>
            {
                Ok(Self::new(column, table, parent_column))
            }
            _ => Err(EngineError::InvalidSchema(format!(
                "foreign key reference '{reference}' is not of the form <table>.<column>"
            ))),
        }
    }

    pub fn reference(&self) -> String {
        format!("{}.{}", self.parent_table, self.parent_column)
    }
}

/// Shape and key constraints of one table.
///
/// Persisted in the catalog as
/// `{name, columns: {col: type}, primary_key, unique_keys, foreign_keys: {col: "t.c"}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    #[serde(with = "column_map")]
    pub columns: Vec<ColumnSchema>,
    #[serde(default)]
    pub primary_key: Option<String>,
    /// Declared only; uniqueness is enforced for the primary key alone.
    #[serde(default)]
    pub unique_keys: Vec<String>,
    #[serde(default, with = "foreign_key_map")]
    pub foreign_keys: Vec<ForeignKey>,
}

impl TableSchema {
    pub fn new(name: impl Into<String>, columns: Vec<ColumnSchema>) -> Self {
        Self {
            name: name.into(),
            columns,
            primary_key: None,
            unique_keys: Vec::new(),
            foreign_keys: Vec::new(),
        }
    }

    pub fn with_primary_key(mut self, column: impl Into<String>) -> Self {
        self.primary_key = Some(column.into());
        self
    }

    pub fn with_unique_key(mut self, column: impl Into<String>) -> Self {
        self.unique_keys.push(column.into());
        self
    }

    pub fn with_foreign_key(
        mut self,
        column: impl Into<String>,
        parent_table: impl Into<String>,
        parent_column: impl Into<String>,
    ) -> Self {
        self.foreign_keys
            .push(ForeignKey::new(column, parent_table, parent_column));
        self
    }

    pub fn column(&self, name: &str) -> Option<&ColumnSchema> {
        self.columns.iter().find(|column| column.name == name)
    }

    pub fn column_type(&self, name: &str) -> Option<ColumnType> {
        self.column(name).map(|column| column.column_type)
    }

    /// Rejects definitions whose keys name undeclared columns.
    pub fn check(&self) -> EngineResult<()> {
        if self.columns.is_empty() {
            return Err(EngineError::InvalidSchema(format!(
                "table '{}' declares no columns",
                self.name
            )));
        }
        for (position, column) in self.columns.iter().enumerate() {
            if column.name.is_empty() {
                return Err(EngineError::InvalidSchema(format!(
                    "table '{}' has an unnamed column",
                    self.name
                )));
            }
            if self.columns[..position].iter().any(|c| c.name == column.name) {
                return Err(EngineError::InvalidSchema(format!(
                    "column '{}' declared twice in table '{}'",
                    column.name, self.name
                )));
            }
        }
        let keys = self
            .primary_key
            .iter()
            .map(|pk| ("primary key", pk))
            .chain(self.unique_keys.iter().map(|uk| ("unique key", uk)))
            .chain(self.foreign_keys.iter().map(|fk| ("foreign key", &fk.column)));
        for (role, column) in keys {
            if self.column(column).is_none() {
                return Err(EngineError::InvalidSchema(format!(
                    "{role} '{column}' is not a column of table '{}'",
                    self.name
                )));
            }
        }
        Ok(())
    }

    /// Checks that every declared column is present and coerces it to its
    /// declared type.
    ///
    /// The returned row lists declared columns first, in declaration order,
    /// followed by any undeclared columns of `row` unchanged.
    pub fn validate(&self, row: &Row) -> EngineResult<Row> {
        let mut validated = Row::new();
        for column in &self.columns {
            let raw = row
                .get(&column.name)
                .ok_or_else(|| EngineError::MissingColumn {
                    table: self.name.clone(),
                    column: column.name.clone(),
                })?;
            let value = column
                .column_type
                .coerce(raw)
                .ok_or_else(|| EngineError::TypeCoercion {
                    column: column.name.clone(),
                    expected: column.column_type,
                    actual: raw.type_name(),
                })?;
            validated.insert(column.name.clone(), value);
        }
        for (column, value) in row.iter() {
            if !validated.contains(column) {
                validated.insert(column, value.clone());
            }
        }
        Ok(validated)
    }

    /// Coerces a comparison value to the type of `column`.
    pub fn coerce(&self, column: &str, value: &Value) -> EngineResult<Value> {
        let column_type = self
            .column_type(column)
            .ok_or_else(|| EngineError::column_not_found(&self.name, column))?;
        column_type
            .coerce(value)
            .ok_or_else(|| EngineError::TypeCoercion {
                column: column.to_string(),
                expected: column_type,
                actual: value.type_name(),
            })
    }

    /// First column of `row` this schema does not declare.
    pub fn undeclared_column<'r>(&self, row: &'r Row) -> Option<&'r str> {
        row.columns().find(|column| self.column(column).is_none())
    }

    pub fn add_column(&mut self, column: ColumnSchema) -> EngineResult<()> {
        if self.column(&column.name).is_some() {
            return Err(EngineError::InvalidSchema(format!(
                "column '{}' already exists in table '{}'",
                column.name, self.name
            )));
        }
        self.columns.push(column);
        Ok(())
    }

    /// Removes a column along with any unique or foreign key declared on it.
    pub fn remove_column(&mut self, name: &str) -> EngineResult<ColumnSchema> {
        if self.primary_key.as_deref() == Some(name) {
            return Err(EngineError::IntegrityViolation(format!(
                "cannot remove primary key column '{name}' of table '{}'",
                self.name
            )));
        }
        let position = self
            .columns
            .iter()
            .position(|column| column.name == name)
            .ok_or_else(|| EngineError::column_not_found(&self.name, name))?;
        self.unique_keys.retain(|column| column != name);
        self.foreign_keys.retain(|fk| fk.column != name);
        Ok(self.columns.remove(position))
    }
}

mod column_map {
    use super::*;

    pub fn serialize<S: Serializer>(
        columns: &[ColumnSchema],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(columns.len()))?;
        for column in columns {
            map.serialize_entry(&column.name, &column.column_type)?;
        }
        map.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<ColumnSchema>, D::Error> {
        struct ColumnsVisitor;

        impl<'de> Visitor<'de> for ColumnsVisitor {
            type Value = Vec<ColumnSchema>;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an object of column names to column types")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut columns: Vec<ColumnSchema> = Vec::new();
                while let Some((name, column_type)) = access.next_entry::<String, ColumnType>()? {
                    if columns.iter().any(|column| column.name == name) {
                        return Err(de::Error::custom(format!("duplicate column '{name}'")));
                    }
                    columns.push(ColumnSchema::new(name, column_type));
                }
                Ok(columns)
            }
        }

        deserializer.deserialize_map(ColumnsVisitor)
    }
}

mod foreign_key_map {
    use super::*;

    pub fn serialize<S: Serializer>(keys: &[ForeignKey], serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(keys.len()))?;
        for key in keys {
            map.serialize_entry(&key.column, &key.reference())?;
        }
        map.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<ForeignKey>, D::Error> {
        struct ForeignKeysVisitor;

        impl<'de> Visitor<'de> for ForeignKeysVisitor {
            type Value = Vec<ForeignKey>;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an object of column names to \"table.column\" references")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut keys = Vec::new();
                while let Some((column, reference)) = access.next_entry::<String, String>()? {
                    let key = ForeignKey::parse(column, &reference).map_err(de::Error::custom)?;
                    keys.push(key);
                }
                Ok(keys)
            }
        }

        deserializer.deserialize_map(ForeignKeysVisitor)
    }
}

/// Every table schema of one database, keyed by table name.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Catalog {
    tables: Vec<TableSchema>,
}

impl Catalog {
    pub fn new() -> Self {
        Self { tables: Vec::new() }
    }

    /// Inserts `table`, replacing any schema registered under the same name.
    pub fn upsert(&mut self, table: TableSchema) {
        match self.tables.iter_mut().find(|t| t.name == table.name) {
            Some(slot) => *slot = table,
            None => self.tables.push(table),
        }
    }

    pub fn remove_table(&mut self, name: &str) -> Option<TableSchema> {
        if let Some(index) = self.tables.iter().position(|table| table.name == name) {
            return Some(self.tables.remove(index));
        }
        None
    }

    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        self.tables.iter().find(|table| table.name == name)
    }

    pub fn tables(&self) -> &[TableSchema] {
        &self.tables
    }

    pub fn table_names(&self) -> Vec<&str> {
        self.tables.iter().map(|table| table.name.as_str()).collect()
    }
}

impl Serialize for Catalog {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.tables.len()))?;
        for table in &self.tables {
            map.serialize_entry(&table.name, table)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Catalog {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct CatalogVisitor;

        impl<'de> Visitor<'de> for CatalogVisitor {
            type Value = Catalog;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an object of table names to table schemas")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Catalog, A::Error> {
                let mut catalog = Catalog::new();
                while let Some((name, table)) = access.next_entry::<String, TableSchema>()? {
                    if table.name != name {
                        return Err(de::Error::custom(format!(
                            "catalog entry '{name}' holds schema of table '{}'",
                            table.name
                        )));
                    }
                    catalog.upsert(table);
                }
                Ok(catalog)
            }
        }

        deserializer.deserialize_map(CatalogVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn users() -> TableSchema {
        TableSchema::new(
            "users",
            vec![
                ColumnSchema::new("id", ColumnType::Int),
                ColumnSchema::new("name", ColumnType::Str),
            ],
        )
        .with_primary_key("id")
    }

    #[test]
    fn validate_coerces_to_declared_types() {
        let row = Row::new().with("name", 42).with("id", "7");
        let validated = users().validate(&row).expect("validate");
        assert_eq!(validated, Row::new().with("id", 7).with("name", "42"));
    }

    #[test]
    fn validate_reports_missing_column() {
        let err = users().validate(&Row::new().with("id", 1)).unwrap_err();
        match err {
            EngineError::MissingColumn { table, column } => {
                assert_eq!(table, "users");
                assert_eq!(column, "name");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn validate_reports_impossible_coercion() {
        let err = users()
            .validate(&Row::new().with("id", "abc").with("name", "x"))
            .unwrap_err();
        match err {
            EngineError::TypeCoercion {
                column,
                expected,
                actual,
            } => {
                assert_eq!(column, "id");
                assert_eq!(expected, ColumnType::Int);
                assert_eq!(actual, "str");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn validate_passes_unknown_columns_through() {
        let row = Row::new()
            .with("extra", 1.5)
            .with("id", 1)
            .with("name", "Lucy");
        let validated = users().validate(&row).expect("validate");
        assert_eq!(
            validated.columns().collect::<Vec<_>>(),
            vec!["id", "name", "extra"]
        );
        assert_eq!(validated.get("extra"), Some(&Value::Float(1.5)));
        assert_eq!(users().undeclared_column(&validated), Some("extra"));
    }

    #[test]
    fn int_coercion_rejects_fractional_floats() {
        assert_eq!(ColumnType::Int.coerce(&Value::Float(3.0)), Some(Value::Int(3)));
        assert_eq!(ColumnType::Int.coerce(&Value::Float(3.5)), None);
        assert_eq!(ColumnType::Int.coerce(&Value::Float(f64::NAN)), None);
        assert_eq!(ColumnType::Int.coerce(&Value::text(" 12 ")), Some(Value::Int(12)));
    }

    #[test]
    fn float_coercion_rejects_non_finite_values() {
        assert_eq!(ColumnType::Float.coerce(&Value::Int(2)), Some(Value::Float(2.0)));
        assert_eq!(ColumnType::Float.coerce(&Value::text("inf")), None);
        assert_eq!(ColumnType::Float.coerce(&Value::text("2.5")), Some(Value::Float(2.5)));
    }

    #[test]
    fn column_type_accepts_aliases() {
        let parsed: ColumnType = serde_json::from_str("\"string\"").unwrap();
        assert_eq!(parsed, ColumnType::Str);
        let parsed: ColumnType = serde_json::from_str("\"real\"").unwrap();
        assert_eq!(parsed, ColumnType::Float);
        assert!(serde_json::from_str::<ColumnType>("\"blob\"").is_err());
    }

    #[test]
    fn remove_primary_key_column_is_forbidden() {
        let mut schema = users();
        let err = schema.remove_column("id").unwrap_err();
        assert!(matches!(err, EngineError::IntegrityViolation(_)));
        assert_eq!(schema, users());
    }

    #[test]
    fn remove_column_drops_dependent_keys() {
        let mut schema = TableSchema::new(
            "posts",
            vec![
                ColumnSchema::new("p_id", ColumnType::Int),
                ColumnSchema::new("user_id", ColumnType::Int),
            ],
        )
        .with_primary_key("p_id")
        .with_unique_key("user_id")
        .with_foreign_key("user_id", "users", "id");
        schema.remove_column("user_id").expect("remove");
        assert!(schema.unique_keys.is_empty());
        assert!(schema.foreign_keys.is_empty());
        assert_eq!(schema.columns.len(), 1);
    }

    #[test]
    fn check_rejects_keys_on_undeclared_columns() {
        let schema = users().with_foreign_key("team_id", "teams", "id");
        assert!(matches!(schema.check(), Err(EngineError::InvalidSchema(_))));
        assert!(users().check().is_ok());
    }

    #[test]
    fn foreign_key_reference_must_name_table_and_column() {
        let key = ForeignKey::parse("user_id", "users.id").expect("parse");
        assert_eq!(key.parent_table, "users");
        assert_eq!(key.reference(), "users.id");
        assert!(ForeignKey::parse("user_id", "users").is_err());
        assert!(ForeignKey::parse("user_id", ".id").is_err());
        assert!(ForeignKey::parse("user_id", "a.b.c").is_err());
    }

    #[test]
    fn schema_json_form_is_lossless() {
        let schema = TableSchema::new(
            "posts",
            vec![
                ColumnSchema::new("p_id", ColumnType::Int),
                ColumnSchema::new("user_id", ColumnType::Int),
                ColumnSchema::new("content", ColumnType::Str),
            ],
        )
        .with_primary_key("p_id")
        .with_unique_key("content")
        .with_foreign_key("user_id", "users", "id");

        let json = serde_json::to_value(&schema).expect("encode");
        assert_eq!(json["columns"]["user_id"], "int");
        assert_eq!(json["foreign_keys"]["user_id"], "users.id");
        let decoded: TableSchema = serde_json::from_value(json).expect("decode");
        assert_eq!(decoded, schema);
    }

    #[test]
    fn catalog_serializes_as_object_keyed_by_table() {
        let mut catalog = Catalog::new();
        catalog.upsert(users());
        catalog.upsert(users().with_unique_key("name"));
        assert_eq!(catalog.tables().len(), 1);

        let json = serde_json::to_value(&catalog).expect("encode");
        assert_eq!(json["users"]["primary_key"], "id");
        let decoded: Catalog = serde_json::from_value(json).expect("decode");
        assert_eq!(decoded, catalog);
    }

    #[test]
    fn catalog_rejects_mismatched_entry_names() {
        let json = serde_json::json!({ "people": users() });
        assert!(serde_json::from_value::<Catalog>(json).is_err());
    }
}
