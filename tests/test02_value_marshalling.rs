use std::collections::{BTreeMap, HashMap};

use rand::seq::IndexedRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use sqlite_dispatch::prelude::*;

fn inventory() -> Result<Connection, DbError> {
    let conn = Connection::open_in_memory()?;
    conn.execute(
        "CREATE TABLE inventory (
            id INTEGER PRIMARY KEY,
            label TEXT,
            weight REAL,
            photo BLOB,
            tags JSON,
            attrs JSON,
            raw_attrs TEXT
        )",
    )?;
    Ok(conn)
}

#[test]
fn scalars_round_trip() -> Result<(), DbError> {
    let conn = inventory()?;
    conn.run(
        "INSERT INTO inventory (label, weight, photo) VALUES (?, ?, ?)",
        &params!["bolt", 0.25, vec![0xde_u8, 0xad, 0xbe, 0xef]],
    )?;
    let row = conn.query_row("SELECT label, weight, photo, tags FROM inventory", &[], |row| {
        Ok((
            row.get::<String>(0)?,
            row.get::<f64>(1)?,
            row.get::<Vec<u8>>(2)?,
            row.get::<Option<Vec<String>>>(3)?,
        ))
    })?;
    assert_eq!(
        row,
        Some(("bolt".into(), 0.25, vec![0xde, 0xad, 0xbe, 0xef], None))
    );
    Ok(())
}

#[test]
fn sequences_and_mappings_are_json_encoded() -> Result<(), DbError> {
    let conn = inventory()?;
    let tags = Value::Array(vec![Value::from("steel"), Value::from(8), Value::Null]);
    let mut attrs = BTreeMap::new();
    attrs.insert("thread".to_string(), Value::from("M8"));
    attrs.insert("length_mm".to_string(), Value::from(40));
    attrs.insert("coated".to_string(), Value::from(true));

    conn.run(
        "INSERT INTO inventory (tags, attrs, raw_attrs) VALUES (?, ?, ?)",
        &[tags.clone(), Value::Object(attrs.clone()), Value::Object(attrs.clone())],
    )?;

    // Stored physically as text.
    let stored: Option<String> = conn.query("SELECT typeof(tags) FROM inventory", &[])?;
    assert_eq!(stored.as_deref(), Some("text"));

    // Decoded on the way out because the column is declared JSON.
    let back = conn.query_row("SELECT tags, attrs FROM inventory", &[], |row| {
        Ok((row.value(0)?, row.value(1)?))
    })?;
    assert_eq!(back, Some((tags, Value::Object(attrs.clone()))));

    // A TEXT column keeps the raw JSON, but structured targets still parse it.
    let raw: Option<Value> = conn.query("SELECT raw_attrs FROM inventory", &[])?;
    assert!(matches!(raw, Some(Value::Text(_))));
    let parsed: Option<HashMap<String, Value>> =
        conn.query("SELECT raw_attrs FROM inventory", &[])?;
    assert_eq!(parsed.map(|m| m.len()), Some(3));
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Dimensions {
    width: u32,
    height: u32,
    notes: Vec<String>,
}

#[test]
fn serde_types_travel_through_json_wrapper() -> Result<(), DbError> {
    let conn = inventory()?;
    let dims = Dimensions {
        width: 30,
        height: 12,
        notes: vec!["fragile".into()],
    };
    conn.run(
        "INSERT INTO inventory (attrs) VALUES (?)",
        &[Json(dims.clone()).to_value()?],
    )?;
    let Json(back): Json<Dimensions> = conn
        .query("SELECT attrs FROM inventory", &[])?
        .expect("one row");
    assert_eq!(back, dims);
    Ok(())
}

#[test]
fn extraction_rejects_nulls_and_mismatches() -> Result<(), DbError> {
    let conn = inventory()?;
    conn.run("INSERT INTO inventory (label) VALUES (NULL)", &[])?;

    assert!(matches!(
        conn.query::<String>("SELECT label FROM inventory", &[]),
        Err(DbError::ExtractionError(_))
    ));
    assert_eq!(
        conn.query::<Option<String>>("SELECT label FROM inventory", &[])?,
        Some(None)
    );
    assert!(matches!(
        conn.query::<i8>("SELECT 1000", &[]),
        Err(DbError::ExtractionError(_))
    ));
    assert!(matches!(
        conn.query::<Vec<i64>>("SELECT 'not json'", &[]),
        Err(DbError::ExtractionError(_))
    ));
    Ok(())
}

#[test]
fn values_without_a_json_form_fail_to_bind() {
    let conn = inventory().unwrap();
    let res = conn.run(
        "INSERT INTO inventory (tags) VALUES (?)",
        &[Value::Array(vec![Value::Real(f64::NAN)])],
    );
    assert!(matches!(res, Err(DbError::BindingError(_))));
    let res = conn.run(
        "INSERT INTO inventory (tags) VALUES (?)",
        &[Value::Array(vec![Value::Blob(vec![1, 2])])],
    );
    assert!(matches!(res, Err(DbError::BindingError(_))));
}

fn random_leaf(rng: &mut ChaCha8Rng) -> Value {
    match rng.random_range(0..4) {
        0 => Value::Null,
        1 => Value::Integer(rng.random_range(-1_000_000..1_000_000)),
        // Quarter steps print and parse back exactly.
        2 => Value::Real(f64::from(rng.random_range(-4_000..4_000)) / 4.0 + 0.25),
        _ => {
            let len = rng.random_range(0..8);
            let text: String = (0..len)
                .map(|_| *["a", "Z", " ", "\"", "\\", "\n", "é", "🚗", "[1]"].choose(rng).unwrap_or(&"a"))
                .collect();
            Value::Text(text)
        }
    }
}

fn random_structured(rng: &mut ChaCha8Rng, depth: u32) -> Value {
    let len = rng.random_range(0..5);
    let child = |rng: &mut ChaCha8Rng| {
        if depth > 0 && rng.random_bool(0.3) {
            random_structured(rng, depth - 1)
        } else {
            random_leaf(rng)
        }
    };
    if rng.random_bool(0.5) {
        Value::Array((0..len).map(|_| child(rng)).collect())
    } else {
        Value::Object(
            (0..len)
                .map(|i| (format!("k{i}_{}", rng.random_range(0..100)), child(rng)))
                .collect(),
        )
    }
}

#[test]
fn random_nested_values_survive_json_columns() -> Result<(), DbError> {
    let conn = inventory()?;
    let mut rng = ChaCha8Rng::seed_from_u64(20_240_611);
    for _ in 0..200 {
        let original = random_structured(&mut rng, 3);
        let id = conn.insert(
            "inventory",
            &Record::from([("attrs".to_string(), original.clone())]),
        )?;
        let back: Option<Value> =
            conn.query("SELECT attrs FROM inventory WHERE id = ?", &params![id])?;
        assert_eq!(back.as_ref(), Some(&original), "value {original:?}");
    }
    Ok(())
}
