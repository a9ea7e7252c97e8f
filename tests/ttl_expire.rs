use test_log::test;
use tundra::{Config, FieldType, FieldValue, Schema, Slice};

fn schema() -> Schema {
    Schema::builder("e")
        .key_field("id", FieldType::Bytes, 0)
        .field("v", FieldType::Bytes)
        .build()
        .unwrap()
}

#[test]
fn expired_records_become_absent() -> tundra::Result<()> {
    let folder = tempfile::tempdir()?;

    let env = Config::new(&folder)
        .worker_threads(0)
        .expire_ttl(1)
        .open()?;
    let db = env.database(schema())?;

    db.set(&[
        FieldValue::Bytes(Slice::from("z")),
        FieldValue::Bytes(Slice::from("v")),
    ])?;

    // young enough to survive an expiry pass
    db.expire()?;
    assert!(db.get(&[FieldValue::Bytes(Slice::from("z"))])?.is_some());

    std::thread::sleep(std::time::Duration::from_secs(2));

    db.expire()?;
    assert!(db.get(&[FieldValue::Bytes(Slice::from("z"))])?.is_none());

    env.close();
    Ok(())
}

#[test]
fn expiry_only_touches_old_records() -> tundra::Result<()> {
    let folder = tempfile::tempdir()?;

    let env = Config::new(&folder)
        .worker_threads(0)
        .expire_ttl(2)
        .open()?;
    let db = env.database(schema())?;

    db.set(&[
        FieldValue::Bytes(Slice::from("old")),
        FieldValue::Bytes(Slice::from("v")),
    ])?;

    std::thread::sleep(std::time::Duration::from_secs(3));

    db.set(&[
        FieldValue::Bytes(Slice::from("new")),
        FieldValue::Bytes(Slice::from("v")),
    ])?;

    db.expire()?;

    assert!(db.get(&[FieldValue::Bytes(Slice::from("old"))])?.is_none());
    assert!(db.get(&[FieldValue::Bytes(Slice::from("new"))])?.is_some());

    env.close();
    Ok(())
}

#[test]
fn expired_records_in_branches_are_compacted_away() -> tundra::Result<()> {
    let folder = tempfile::tempdir()?;

    let env = Config::new(&folder)
        .worker_threads(0)
        .expire_ttl(1)
        .open()?;
    let db = env.database(schema())?;

    db.set(&[
        FieldValue::Bytes(Slice::from("z")),
        FieldValue::Bytes(Slice::from("v")),
    ])?;

    db.flush()?;
    assert_eq!(1, db.stats().branch_count);

    std::thread::sleep(std::time::Duration::from_secs(2));

    db.expire()?;
    assert!(db.get(&[FieldValue::Bytes(Slice::from("z"))])?.is_none());

    env.close();
    Ok(())
}
