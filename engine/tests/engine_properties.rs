use std::collections::HashSet;
use std::fs;

use pesadb_engine::{
    ColumnSchema, ColumnType, Engine, EngineError, Predicate, Row, TableSchema, Value,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;

fn open(dir: &TempDir) -> Engine {
    let mut engine = Engine::new(dir.path());
    engine.select_database("props").expect("select database");
    engine
}

fn accounts() -> TableSchema {
    TableSchema::new(
        "accounts",
        vec![
            ColumnSchema::new("id", ColumnType::Int),
            ColumnSchema::new("owner", ColumnType::Str),
            ColumnSchema::new("balance", ColumnType::Float),
        ],
    )
    .with_primary_key("id")
}

fn account(id: i64, owner: &str, balance: f64) -> Row {
    Row::new()
        .with("id", id)
        .with("owner", owner)
        .with("balance", balance)
}

/// Every indexed key must resolve to a stored row carrying that key, and
/// every stored key must be indexed.
fn assert_index_matches_rows(engine: &Engine, table: &str) {
    let rows = engine.select(table, None).expect("select all");
    let index = engine.index(table).expect("primary key index");
    assert_eq!(index.len(), rows.len());
    for (position, row) in rows.iter().enumerate() {
        let key = row.get(index.column()).expect("key column");
        assert_eq!(index.get(key), Some(position), "key {key} misplaced");
    }
}

#[test]
fn random_inserts_never_store_duplicate_keys() {
    let dir = TempDir::new().unwrap();
    let mut engine = open(&dir);
    engine.create_table(accounts()).unwrap();

    let mut rng = StdRng::seed_from_u64(7);
    let mut accepted = HashSet::new();
    for _ in 0..200 {
        let id = rng.gen_range(0..60);
        let result = engine.insert("accounts", account(id, "x", rng.gen_range(0.0..100.0)));
        match result {
            Ok(_) => assert!(accepted.insert(id), "id {id} accepted twice"),
            Err(EngineError::DuplicateKey { .. }) => assert!(accepted.contains(&id)),
            Err(err) => panic!("unexpected error: {err}"),
        }
    }

    let stored: Vec<i64> = engine
        .select("accounts", None)
        .unwrap()
        .iter()
        .filter_map(|row| row.get("id").and_then(Value::as_int))
        .collect();
    let distinct: HashSet<_> = stored.iter().copied().collect();
    assert_eq!(stored.len(), distinct.len());
    assert_eq!(distinct, accepted);
    assert_index_matches_rows(&engine, "accounts");
}

#[test]
fn index_tracks_rows_through_updates_and_deletes() {
    let dir = TempDir::new().unwrap();
    let mut engine = open(&dir);
    engine.create_table(accounts()).unwrap();
    for id in 0..20 {
        let owner = if id % 3 == 0 { "ops" } else { "dev" };
        engine
            .insert("accounts", account(id, owner, id as f64))
            .unwrap();
    }

    engine
        .delete("accounts", &Row::new().with("owner", "ops"))
        .unwrap();
    assert_index_matches_rows(&engine, "accounts");

    engine
        .update("accounts", &Value::Int(1), Row::new().with("id", 100))
        .unwrap();
    engine
        .update("accounts", &Value::Int(2), Row::new().with("balance", "2.5"))
        .unwrap();
    assert_index_matches_rows(&engine, "accounts");

    let rows = engine
        .select("accounts", Some(&Predicate::equals("id", 2)))
        .unwrap();
    assert_eq!(rows, vec![account(2, "dev", 2.5)]);
}

#[test]
fn join_is_commutative_up_to_field_order() {
    let dir = TempDir::new().unwrap();
    let mut engine = open(&dir);
    engine
        .create_table(
            TableSchema::new(
                "teams",
                vec![
                    ColumnSchema::new("team_id", ColumnType::Int),
                    ColumnSchema::new("title", ColumnType::Str),
                ],
            )
            .with_primary_key("team_id"),
        )
        .unwrap();
    engine
        .create_table(TableSchema::new(
            "members",
            vec![
                ColumnSchema::new("member", ColumnType::Str),
                ColumnSchema::new("team", ColumnType::Int),
            ],
        ))
        .unwrap();

    for (id, title) in [(1, "core"), (2, "web"), (3, "empty")] {
        engine
            .insert("teams", Row::new().with("team_id", id).with("title", title))
            .unwrap();
    }
    for (member, team) in [("ana", 1), ("bo", 2), ("cy", 1), ("di", 9)] {
        engine
            .insert("members", Row::new().with("member", member).with("team", team))
            .unwrap();
    }

    let normalize = |rows: Vec<Row>| {
        let mut rows: Vec<Vec<(String, Value)>> = rows
            .into_iter()
            .map(|row| {
                let mut fields: Vec<_> = row.into_iter().collect();
                fields.sort_by(|a, b| a.0.cmp(&b.0));
                fields
            })
            .collect();
        rows.sort_by(|a, b| format!("{a:?}").cmp(&format!("{b:?}")));
        rows
    };

    let forward = engine.join("teams", "members", "team_id", "team").unwrap();
    let backward = engine.join("members", "teams", "team", "team_id").unwrap();
    assert_eq!(forward.len(), 3);
    assert_eq!(normalize(forward), normalize(backward));
}

/// Tags every field of a joined row with the table it came from. The left
/// row's fields come first, in order; the rest follow the right table's
/// declared columns, whatever name they were stored under.
fn by_origin(
    rows: Vec<Row>,
    left: (&str, usize),
    right: (&str, &[&str]),
) -> Vec<Vec<(String, String, Value)>> {
    let mut tagged: Vec<Vec<(String, String, Value)>> = rows
        .into_iter()
        .map(|row| {
            let fields: Vec<(String, Value)> = row.into_iter().collect();
            let mut origin: Vec<(String, String, Value)> = fields
                .into_iter()
                .enumerate()
                .map(|(position, (name, value))| {
                    if position < left.1 {
                        (left.0.to_string(), name, value)
                    } else {
                        let column = right.1[position - left.1];
                        (right.0.to_string(), column.to_string(), value)
                    }
                })
                .collect();
            origin.sort_by(|a, b| (&a.0, &a.1).cmp(&(&b.0, &b.1)));
            origin
        })
        .collect();
    tagged.sort_by(|a, b| format!("{a:?}").cmp(&format!("{b:?}")));
    tagged
}

#[test]
fn join_is_commutative_with_colliding_columns() {
    let dir = TempDir::new().unwrap();
    let mut engine = open(&dir);
    let owners = ["id", "name"];
    let pets = ["id", "name", "owner_id"];
    engine
        .create_table(
            TableSchema::new(
                "owners",
                vec![
                    ColumnSchema::new("id", ColumnType::Int),
                    ColumnSchema::new("name", ColumnType::Str),
                ],
            )
            .with_primary_key("id"),
        )
        .unwrap();
    engine
        .create_table(
            TableSchema::new(
                "pets",
                vec![
                    ColumnSchema::new("id", ColumnType::Int),
                    ColumnSchema::new("name", ColumnType::Str),
                    ColumnSchema::new("owner_id", ColumnType::Int),
                ],
            )
            .with_primary_key("id"),
        )
        .unwrap();

    for (id, name) in [(1, "ana"), (2, "bo"), (3, "cy")] {
        engine
            .insert("owners", Row::new().with("id", id).with("name", name))
            .unwrap();
    }
    for (id, name, owner) in [(10, "rex", 1), (11, "tom", 1), (12, "kit", 2), (13, "ace", 7)] {
        engine
            .insert(
                "pets",
                Row::new()
                    .with("id", id)
                    .with("name", name)
                    .with("owner_id", owner),
            )
            .unwrap();
    }

    let forward = engine.join("owners", "pets", "id", "owner_id").unwrap();
    let backward = engine.join("pets", "owners", "owner_id", "id").unwrap();
    assert_eq!(forward.len(), 3);
    assert!(forward.iter().all(|row| row.len() == 5));
    assert!(forward.iter().all(|row| row.contains("pets_name")));
    assert!(backward.iter().all(|row| row.contains("owners_name")));

    assert_eq!(
        by_origin(forward, ("owners", owners.len()), ("pets", &pets[..])),
        by_origin(backward, ("pets", pets.len()), ("owners", &owners[..])),
    );
}

#[test]
fn rejected_schema_change_leaves_files_untouched() {
    let dir = TempDir::new().unwrap();
    let mut engine = open(&dir);
    engine.create_table(accounts()).unwrap();
    engine.insert("accounts", account(1, "ana", 3.0)).unwrap();

    let catalog_path = engine.store().catalog_path("props");
    let table_path = engine.store().table_path("props", "accounts");
    let catalog_before = fs::read(&catalog_path).unwrap();
    let rows_before = fs::read(&table_path).unwrap();

    assert!(matches!(
        engine.remove_column("accounts", "id"),
        Err(EngineError::IntegrityViolation(_))
    ));
    assert!(matches!(
        engine.add_column("accounts", ColumnSchema::new("owner", ColumnType::Str), None),
        Err(EngineError::InvalidSchema(_))
    ));
    assert!(matches!(
        engine.add_column(
            "accounts",
            ColumnSchema::new("age", ColumnType::Int),
            Some(Value::text("old"))
        ),
        Err(EngineError::TypeCoercion { .. })
    ));

    assert_eq!(fs::read(&catalog_path).unwrap(), catalog_before);
    assert_eq!(fs::read(&table_path).unwrap(), rows_before);
}

#[test]
fn schema_survives_restart() {
    let dir = TempDir::new().unwrap();
    let schema = TableSchema::new(
        "posts",
        vec![
            ColumnSchema::new("p_id", ColumnType::Int),
            ColumnSchema::new("user_id", ColumnType::Int),
            ColumnSchema::new("body", ColumnType::Str),
        ],
    )
    .with_primary_key("p_id")
    .with_unique_key("body")
    .with_foreign_key("user_id", "users", "id");
    {
        let mut engine = open(&dir);
        engine.create_table(schema.clone()).unwrap();
    }

    let engine = open(&dir);
    assert_eq!(engine.schema("posts").unwrap(), &schema);
    assert_eq!(engine.list_databases().unwrap(), vec!["props"]);
}

#[test]
fn users_and_posts_walkthrough() {
    let dir = TempDir::new().unwrap();
    let mut engine = open(&dir);
    engine
        .create_table(
            TableSchema::new(
                "users",
                vec![
                    ColumnSchema::new("id", ColumnType::Int),
                    ColumnSchema::new("name", ColumnType::Str),
                ],
            )
            .with_primary_key("id"),
        )
        .unwrap();
    engine
        .create_table(
            TableSchema::new(
                "posts",
                vec![
                    ColumnSchema::new("p_id", ColumnType::Int),
                    ColumnSchema::new("user_id", ColumnType::Int),
                    ColumnSchema::new("content", ColumnType::Str),
                ],
            )
            .with_primary_key("p_id")
            .with_foreign_key("user_id", "users", "id"),
        )
        .unwrap();

    engine
        .insert("users", Row::new().with("id", 1).with("name", "Lucy"))
        .unwrap();
    engine
        .insert(
            "posts",
            Row::new()
                .with("p_id", "10")
                .with("user_id", "1")
                .with("content", "Hello"),
        )
        .unwrap();
    assert!(matches!(
        engine.insert(
            "posts",
            Row::new()
                .with("p_id", 11)
                .with("user_id", 2)
                .with("content", "nobody"),
        ),
        Err(EngineError::ForeignKeyViolation { .. })
    ));

    let joined = engine.join("users", "posts", "id", "user_id").unwrap();
    assert_eq!(
        joined,
        vec![Row::new()
            .with("id", 1)
            .with("name", "Lucy")
            .with("p_id", 10)
            .with("user_id", 1)
            .with("content", "Hello")]
    );
}
