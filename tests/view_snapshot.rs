use test_log::test;
use tundra::{Config, FieldType, FieldValue, Order, Schema, Slice};

fn schema() -> Schema {
    Schema::builder("x")
        .key_field("id", FieldType::Bytes, 0)
        .field("v", FieldType::Bytes)
        .build()
        .unwrap()
}

fn kv(key: &str, value: &str) -> [FieldValue; 2] {
    [
        FieldValue::Bytes(Slice::from(key)),
        FieldValue::Bytes(Slice::from(value)),
    ]
}

fn value_of(db: &tundra::DatabaseHandle, payload: &Slice) -> Vec<u8> {
    match db.schema().decode_field_by_name(payload, "v").unwrap() {
        FieldValue::Bytes(bytes) => bytes.to_vec(),
        other => panic!("unexpected field value {other:?}"),
    }
}

#[test]
fn view_pins_a_consistent_snapshot() -> tundra::Result<()> {
    let folder = tempfile::tempdir()?;

    let env = Config::new(&folder).worker_threads(0).open()?;
    let db = env.database(schema())?;

    db.set(&kv("k", "old"))?;

    let view = env.view();

    db.set(&kv("k", "new"))?;
    db.set(&kv("fresh", "x"))?;

    let payload = view.get(&db, &[FieldValue::Bytes(Slice::from("k"))])?.unwrap();
    assert_eq!(b"old".to_vec(), value_of(&db, &payload));

    // keys born after the view are invisible
    assert!(view
        .get(&db, &[FieldValue::Bytes(Slice::from("fresh"))])?
        .is_none());

    // the live read sees the new state
    let payload = db.get(&[FieldValue::Bytes(Slice::from("k"))])?.unwrap();
    assert_eq!(b"new".to_vec(), value_of(&db, &payload));

    env.close();
    Ok(())
}

#[test]
fn view_survives_flush_and_compaction() -> tundra::Result<()> {
    let folder = tempfile::tempdir()?;

    let env = Config::new(&folder).worker_threads(0).open()?;
    let db = env.database(schema())?;

    db.set(&kv("k", "old"))?;
    db.flush()?;

    let view = env.view();

    db.set(&kv("k", "new"))?;
    db.flush()?;

    // the retention rule must keep the pinned version through compaction
    db.compact()?;

    let payload = view.get(&db, &[FieldValue::Bytes(Slice::from("k"))])?.unwrap();
    assert_eq!(b"old".to_vec(), value_of(&db, &payload));

    drop(view);

    // once the pin is gone, another compaction may fold the history
    db.compact()?;

    let payload = db.get(&[FieldValue::Bytes(Slice::from("k"))])?.unwrap();
    assert_eq!(b"new".to_vec(), value_of(&db, &payload));

    env.close();
    Ok(())
}

#[test]
fn view_cursor_is_frozen() -> tundra::Result<()> {
    let folder = tempfile::tempdir()?;

    let env = Config::new(&folder).worker_threads(0).open()?;
    let db = env.database(schema())?;

    for key in ["a", "b"] {
        db.set(&kv(key, "v"))?;
    }

    let view = env.view();

    db.set(&kv("c", "v"))?;
    db.delete(&[FieldValue::Bytes(Slice::from("a"))])?;

    let frozen = view
        .cursor(&db, Order::Gte, None, None)?
        .map(|item| item.map(|record| record.key.user_key.clone()))
        .collect::<tundra::Result<Vec<_>>>()?;

    assert_eq!(vec![Slice::from("a"), Slice::from("b")], frozen);

    let live = db
        .cursor(Order::Gte, None, None)?
        .map(|item| item.map(|record| record.key.user_key.clone()))
        .collect::<tundra::Result<Vec<_>>>()?;

    assert_eq!(vec![Slice::from("b"), Slice::from("c")], live);

    env.close();
    Ok(())
}

#[test]
fn snapshot_file_accelerates_reopen() -> tundra::Result<()> {
    let folder = tempfile::tempdir()?;

    {
        let env = Config::new(&folder).worker_threads(0).open()?;
        let db = env.database(schema())?;

        for n in 0..50u32 {
            db.set(&kv(&format!("k{n:02}"), &n.to_string()))?;
        }

        db.flush()?;
        db.snapshot()?;

        env.close();
    }

    assert!(folder.path().join("x").join("index").exists());

    {
        let env = Config::new(&folder).worker_threads(0).open()?;
        let db = env.database(schema())?;

        for n in [0u32, 25, 49] {
            assert!(db
                .get(&[FieldValue::Bytes(Slice::from(format!("k{n:02}")))])?
                .is_some());
        }

        env.close();
    }

    Ok(())
}
