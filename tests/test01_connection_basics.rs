use sqlite_dispatch::prelude::*;
use sqlite_dispatch::{ConnectionOptions, CursorState};

fn cars(conn: &Connection) -> Result<(), DbError> {
    conn.execute(
        "CREATE TABLE cars (id INTEGER PRIMARY KEY, name TEXT NOT NULL, price INTEGER NOT NULL);
         INSERT INTO cars (name, price) VALUES ('Audi', 52642);
         INSERT INTO cars (name, price) VALUES ('Mercedes', 57127);
         INSERT INTO cars (name, price) VALUES ('Skoda', 9000);",
    )
}

#[test]
fn bound_insert_is_visible_to_select() -> Result<(), DbError> {
    let conn = Connection::open_in_memory()?;
    conn.execute("CREATE TABLE cars (id INTEGER PRIMARY KEY, name TEXT, price INTEGER)")?;

    let mut insert = conn.prepare(
        "INSERT INTO cars (name, price) VALUES (?, ?)",
        &params!["Ford", 20000],
    )?;
    assert_eq!(insert.run()?, 1);
    drop(insert);

    let names: Vec<String> =
        conn.query_all("SELECT name FROM cars WHERE price >= 20000", &[])?;
    assert_eq!(names, vec!["Ford".to_string()]);
    Ok(())
}

#[test]
fn fetch_visits_every_row_in_order() -> Result<(), DbError> {
    let conn = Connection::open_in_memory()?;
    cars(&conn)?;

    let mut seen = Vec::new();
    let visited = conn.fetch("SELECT id, name, price FROM cars ORDER BY id", &[], |row| {
        seen.push((row.get::<i64>("id")?, row.get::<String>("name")?));
        Ok(())
    })?;
    assert_eq!(visited, 3);
    assert_eq!(seen[2], (3, "Skoda".to_string()));
    Ok(())
}

#[test]
fn row_views_must_be_copied_out() -> Result<(), DbError> {
    let conn = Connection::open_in_memory()?;
    cars(&conn)?;

    let mut kept: Vec<Vec<Value>> = Vec::new();
    conn.fetch("SELECT name, price FROM cars ORDER BY price", &[], |row| {
        kept.push(row.values()?);
        Ok(())
    })?;
    assert_eq!(kept[0], vec![Value::from("Skoda"), Value::Integer(9000)]);

    let maps: Vec<std::collections::BTreeMap<String, Value>> =
        conn.query_rows("SELECT name FROM cars WHERE price < ?", &params![10_000])?;
    assert_eq!(maps.len(), 1);
    assert_eq!(maps[0]["name"], Value::from("Skoda"));
    Ok(())
}

#[test]
fn statement_reset_reruns_from_the_top() -> Result<(), DbError> {
    let conn = Connection::open_in_memory()?;
    cars(&conn)?;

    let mut stmt = conn.prepare("SELECT count(*) FROM cars WHERE price > ?", &params![10_000])?;
    assert_eq!(stmt.query_value::<i64>()?, Some(2));
    assert!(matches!(stmt.query_value::<i64>(), Err(DbError::StatementNotReset)));

    stmt.reset()?;
    assert_eq!(stmt.state(), CursorState::Ready);
    assert_eq!(stmt.query_value::<i64>()?, Some(2));

    stmt.bind(&params![0])?;
    assert_eq!(stmt.query_value::<i64>()?, Some(3));
    Ok(())
}

#[test]
fn errors_are_classified() -> Result<(), DbError> {
    let conn = Connection::open_in_memory()?;
    cars(&conn)?;

    assert!(matches!(conn.execute("SELEC nonsense"), Err(DbError::SqliteError(_))));
    assert!(matches!(
        conn.run("INSERT INTO cars (name, price) VALUES (?, ?)", &params!["Kia"]),
        Err(DbError::BindingError(_))
    ));
    assert!(matches!(
        conn.run("INSERT INTO cars (name, price) VALUES (NULL, 1)", &[]),
        Err(DbError::SqliteError(_))
    ));
    assert!(matches!(
        conn.query::<i64>("SELECT name FROM cars", &[]),
        Err(DbError::ExtractionError(_))
    ));
    Ok(())
}

#[test]
fn temporary_connection_is_usable() -> Result<(), DbError> {
    let conn = Connection::open(&StorageLocation::Temporary, ConnectionOptions::default())?;
    cars(&conn)?;
    assert_eq!(conn.count("cars", &Record::new())?, 3);
    conn.close()
}
