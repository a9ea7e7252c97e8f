use test_log::test;
use tundra::{
    BranchWriter, BranchWriterOptions, Config, FieldType, FieldValue, InternalKey, Record,
    Schema, Slice, ValueKind,
};

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

/// Builds the record a compaction would have produced for `(key, v)` at
/// `lsn`.
fn record_for(schema: &Schema, key: &str, v: &str, lsn: u64) -> Record {
    let payload = schema
        .encode_record(&[
            FieldValue::Bytes(Slice::from(key)),
            FieldValue::Bytes(Slice::from(v)),
        ])
        .unwrap();

    let user_key = schema.extract_key(&payload).unwrap();

    Record {
        key: InternalKey::new(user_key, lsn, ValueKind::Value),
        value: payload,
        timestamp: 0,
    }
}

/// Writes a compaction output file (`PPPPP.NNNNN.db.<ext>`) the way a
/// compact task would.
fn craft_output(
    db_dir: &std::path::Path,
    name: &str,
    node_id: u64,
    records: &[Record],
) -> tundra::Result<()> {
    let file = std::fs::File::options()
        .read(true)
        .write(true)
        .create_new(true)
        .open(db_dir.join(name))?;

    let mut writer = BranchWriter::create(&file, node_id, 100, BranchWriterOptions::default())?;

    for record in records {
        writer.write(record.clone())?;
    }

    writer.finish()?;
    Ok(())
}

/// Crash during compaction: the new node was flushed and renamed to
/// `.seal`, the process died before the old node was renamed to `.gc`.
/// Recovery must promote the seal, remove its parent, and end up with
/// the same externally-visible state as a completed compaction.
#[test]
fn seal_is_promoted_and_parent_removed() -> tundra::Result<()> {
    let folder = tempfile::tempdir()?;

    {
        let env = Config::new(&folder).worker_threads(0).open()?;
        let db = env.database(schema())?;

        db.set(&[
            FieldValue::Bytes(Slice::from("a")),
            FieldValue::Bytes(Slice::from("1")),
        ])?;
        db.set(&[
            FieldValue::Bytes(Slice::from("b")),
            FieldValue::Bytes(Slice::from("2")),
        ])?;

        db.flush()?;
        env.close();
    }

    let db_dir = folder.path().join("x");
    assert!(db_dir.join("00001.db").exists());

    // what the interrupted compaction left behind
    craft_output(
        &db_dir,
        "00001.00002.db.seal",
        2,
        &[
            record_for(&schema(), "a", "1", 1),
            record_for(&schema(), "b", "2", 2),
        ],
    )?;

    {
        let env = Config::new(&folder).worker_threads(0).open()?;
        let db = env.database(schema())?;

        assert!(db_dir.join("00002.db").exists());
        assert!(!db_dir.join("00001.db").exists());
        assert!(!db_dir.join("00001.00002.db.seal").exists());

        let payload = db.get(&[FieldValue::Bytes(Slice::from("a"))])?.unwrap();
        assert_eq!(b"1".to_vec(), value_of(&db, &payload));

        let payload = db.get(&[FieldValue::Bytes(Slice::from("b"))])?.unwrap();
        assert_eq!(b"2".to_vec(), value_of(&db, &payload));

        env.close();
    }

    Ok(())
}

/// An `.incomplete` sibling invalidates the whole compaction output:
/// all children are removed and the parent survives untouched.
#[test]
fn incomplete_sibling_invalidates_all_children() -> tundra::Result<()> {
    let folder = tempfile::tempdir()?;

    {
        let env = Config::new(&folder).worker_threads(0).open()?;
        let db = env.database(schema())?;

        db.set(&[
            FieldValue::Bytes(Slice::from("a")),
            FieldValue::Bytes(Slice::from("1")),
        ])?;

        db.flush()?;
        env.close();
    }

    let db_dir = folder.path().join("x");

    craft_output(
        &db_dir,
        "00001.00002.db.seal",
        2,
        &[record_for(&schema(), "a", "1", 1)],
    )?;
    std::fs::write(db_dir.join("00001.00003.db.incomplete"), b"partial")?;

    {
        let env = Config::new(&folder).worker_threads(0).open()?;
        let db = env.database(schema())?;

        // parent intact, children gone
        assert!(db_dir.join("00001.db").exists());
        assert!(!db_dir.join("00002.db").exists());
        assert!(!db_dir.join("00001.00002.db.seal").exists());
        assert!(!db_dir.join("00001.00003.db.incomplete").exists());

        let payload = db.get(&[FieldValue::Bytes(Slice::from("a"))])?.unwrap();
        assert_eq!(b"1".to_vec(), value_of(&db, &payload));

        env.close();
    }

    Ok(())
}

/// `.gc` remnants are deleted at open.
#[test]
fn gc_remnant_is_removed() -> tundra::Result<()> {
    let folder = tempfile::tempdir()?;

    {
        let env = Config::new(&folder).worker_threads(0).open()?;
        let db = env.database(schema())?;

        db.set(&[
            FieldValue::Bytes(Slice::from("a")),
            FieldValue::Bytes(Slice::from("1")),
        ])?;

        db.flush()?;
        env.close();
    }

    let db_dir = folder.path().join("x");
    std::fs::write(db_dir.join("00009.db.gc"), b"obsolete")?;

    {
        let env = Config::new(&folder).worker_threads(0).open()?;
        let db = env.database(schema())?;

        assert!(!db_dir.join("00009.db.gc").exists());
        assert!(db.get(&[FieldValue::Bytes(Slice::from("a"))])?.is_some());

        env.close();
    }

    Ok(())
}

/// A completed compaction followed by a crash leaves no transient files
/// after the next open.
#[test]
fn clean_shutdown_leaves_no_transients() -> tundra::Result<()> {
    let folder = tempfile::tempdir()?;

    {
        let env = Config::new(&folder).worker_threads(0).open()?;
        let db = env.database(schema())?;

        for n in 0..20u32 {
            db.set(&[
                FieldValue::Bytes(Slice::from(format!("k{n:02}"))),
                FieldValue::Bytes(Slice::from("v")),
            ])?;
            if n % 5 == 4 {
                db.flush()?;
            }
        }

        db.compact()?;
        env.close();
    }

    let db_dir = folder.path().join("x");

    for entry in std::fs::read_dir(&db_dir)? {
        let name = entry?.file_name().to_string_lossy().into_owned();

        assert!(
            !name.ends_with(".incomplete") && !name.ends_with(".seal") && !name.ends_with(".gc"),
            "transient file left behind: {name}",
        );
    }

    Ok(())
}
