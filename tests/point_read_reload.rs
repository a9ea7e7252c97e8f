use test_log::test;
use tundra::{Config, FieldType, FieldValue, Schema, Slice};

fn schema() -> Schema {
    Schema::builder("x")
        .key_field("id", FieldType::Bytes, 0)
        .field("v", FieldType::Bytes)
        .build()
        .unwrap()
}

fn value_of(db: &tundra::DatabaseHandle, payload: &Slice) -> Vec<u8> {
    match db.schema().decode_field_by_name(payload, "v").unwrap() {
        FieldValue::Bytes(bytes) => bytes.to_vec(),
        other => panic!("unexpected field value {other:?}"),
    }
}

#[test]
fn point_set_get_survives_reopen() -> tundra::Result<()> {
    let folder = tempfile::tempdir()?;

    {
        let env = Config::new(&folder).worker_threads(0).open()?;
        let db = env.database(schema())?;

        db.set(&[
            FieldValue::Bytes(Slice::from("a")),
            FieldValue::Bytes(Slice::from("1")),
        ])?;

        let payload = db.get(&[FieldValue::Bytes(Slice::from("a"))])?.unwrap();
        assert_eq!(b"1".to_vec(), value_of(&db, &payload));

        env.close();
    }

    {
        let env = Config::new(&folder).worker_threads(0).open()?;
        let db = env.database(schema())?;

        let payload = db.get(&[FieldValue::Bytes(Slice::from("a"))])?.unwrap();
        assert_eq!(b"1".to_vec(), value_of(&db, &payload));

        env.close();
    }

    Ok(())
}

#[test]
fn reload_after_flush_reads_from_branch() -> tundra::Result<()> {
    let folder = tempfile::tempdir()?;

    {
        let env = Config::new(&folder).worker_threads(0).open()?;
        let db = env.database(schema())?;

        for n in 0..100u32 {
            db.set(&[
                FieldValue::Bytes(Slice::from(format!("key-{n:03}"))),
                FieldValue::Bytes(Slice::from(n.to_string())),
            ])?;
        }

        db.flush()?;
        assert_eq!(1, db.stats().branch_count);

        env.close();
    }

    {
        let env = Config::new(&folder).worker_threads(0).open()?;
        let db = env.database(schema())?;

        assert_eq!(1, db.stats().branch_count);

        for n in [0u32, 42, 99] {
            let payload = db
                .get(&[FieldValue::Bytes(Slice::from(format!("key-{n:03}")))])?
                .unwrap();
            assert_eq!(n.to_string().into_bytes(), value_of(&db, &payload));
        }

        assert!(db
            .get(&[FieldValue::Bytes(Slice::from("key-999"))])?
            .is_none());

        env.close();
    }

    Ok(())
}

#[test]
fn delete_shadows_older_versions() -> tundra::Result<()> {
    let folder = tempfile::tempdir()?;

    let env = Config::new(&folder).worker_threads(0).open()?;
    let db = env.database(schema())?;

    db.set(&[
        FieldValue::Bytes(Slice::from("k")),
        FieldValue::Bytes(Slice::from("1")),
    ])?;

    db.flush()?;

    db.delete(&[FieldValue::Bytes(Slice::from("k"))])?;

    assert!(db.get(&[FieldValue::Bytes(Slice::from("k"))])?.is_none());

    // still gone after the tombstone is flushed on top of the old branch
    db.flush()?;
    assert!(db.get(&[FieldValue::Bytes(Slice::from("k"))])?.is_none());

    env.close();
    Ok(())
}
