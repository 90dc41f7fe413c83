use std::time::Duration;

use sqlite_dispatch::prelude::*;

fn record(pairs: &[(&str, Value)]) -> Record {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), v.clone()))
        .collect()
}

fn garage() -> Result<Connection, DbError> {
    let conn = Connection::open_in_memory()?;
    conn.execute(
        "CREATE TABLE cars (id INTEGER PRIMARY KEY, name TEXT, price INTEGER, note TEXT);
         CREATE TABLE audit (car_id INTEGER);
         CREATE TRIGGER cars_audit AFTER UPDATE ON cars BEGIN
             INSERT INTO audit VALUES (NEW.id);
         END;",
    )?;
    Ok(conn)
}

#[test]
fn insert_returns_rowid() -> Result<(), DbError> {
    let conn = garage()?;
    let id = conn.insert(
        "cars",
        &record(&[("name", Value::from("Ford")), ("price", Value::from(20000))]),
    )?;
    assert_eq!(id, 1);
    let id = conn.insert("cars", &Record::new())?;
    assert_eq!(id, 2);
    assert_eq!(conn.count("cars", &Record::new())?, 2);
    Ok(())
}

#[test]
fn if_changed_updates_skip_identical_rows() -> Result<(), DbError> {
    let conn = garage()?;
    let id = conn.insert(
        "cars",
        &record(&[("name", Value::from("Ford")), ("note", Value::Null)]),
    )?;
    let filter = record(&[("id", Value::from(id))]);

    let same = record(&[("name", Value::from("Ford")), ("note", Value::Null)]);
    assert_eq!(conn.update("cars", &same, &filter, UpdateMode::IfChanged)?, 0);
    assert_eq!(conn.count("audit", &Record::new())?, 0);

    assert_eq!(conn.update("cars", &same, &filter, UpdateMode::Always)?, 1);
    assert_eq!(conn.count("audit", &Record::new())?, 1);

    let changed = record(&[("note", Value::from("serviced"))]);
    assert_eq!(conn.update("cars", &changed, &filter, UpdateMode::default())?, 1);
    assert_eq!(conn.count("cars", &record(&[("note", Value::from("serviced"))]))?, 1);
    Ok(())
}

#[test]
fn delete_requires_a_filter() -> Result<(), DbError> {
    let conn = garage()?;
    for name in ["Audi", "Skoda", "Volvo"] {
        conn.insert("cars", &record(&[("name", Value::from(name))]))?;
    }
    assert!(matches!(
        conn.delete("cars", &Record::new()),
        Err(DbError::ConfigError(_))
    ));
    assert_eq!(conn.delete("cars", &record(&[("name", Value::from("Skoda"))]))?, 1);
    assert_eq!(conn.delete_all("cars")?, 2);
    assert_eq!(conn.count("cars", &Record::new())?, 0);
    Ok(())
}

#[test]
fn scripts_load_from_files() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let script = dir.path().join("schema.sql");
    std::fs::write(
        &script,
        "CREATE TABLE cars (id INTEGER PRIMARY KEY, name TEXT);\nINSERT INTO cars (name) VALUES ('Audi');\n",
    )?;

    let db = Database::builder(StorageLocation::on_disk(dir.path().join("garage.db")))
        .drain_delay(Duration::ZERO)
        .open()?;
    db.execute_file(&script)?;
    assert_eq!(db.read(|c| c.count("cars", &Record::new()))?, 1);

    let missing = dir.path().join("missing.sql");
    match db.execute_file(&missing) {
        Err(DbError::ResourceError { path, .. }) => assert_eq!(path, missing),
        other => panic!("expected a resource error, got {other:?}"),
    }
    Ok(())
}
