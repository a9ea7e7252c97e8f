use test_log::test;
use tundra::{Config, FieldType, FieldValue, Order, Schema, Slice};

fn schema() -> Schema {
    Schema::builder("x")
        .key_field("id", FieldType::Bytes, 0)
        .field("v", FieldType::Bytes)
        .build()
        .unwrap()
}

fn key_of(db: &tundra::DatabaseHandle, record: &tundra::Record) -> Vec<u8> {
    match db
        .schema()
        .decode_field_by_name(&record.value, "id")
        .unwrap()
    {
        FieldValue::Bytes(bytes) => bytes.to_vec(),
        other => panic!("unexpected field value {other:?}"),
    }
}

fn seed(db: &tundra::DatabaseHandle, keys: &[&str]) -> tundra::Result<()> {
    for key in keys {
        db.set(&[
            FieldValue::Bytes(Slice::from(*key)),
            FieldValue::Bytes(Slice::from("v")),
        ])?;
    }
    Ok(())
}

#[test]
fn prefix_scan_stops_at_prefix_end() -> tundra::Result<()> {
    let folder = tempfile::tempdir()?;

    let env = Config::new(&folder).worker_threads(0).open()?;
    let db = env.database(schema())?;

    seed(&db, &["aa", "ab", "ac", "b"])?;

    let keys = db
        .cursor(Order::Gte, None, Some(b"a".as_slice()))?
        .map(|item| item.map(|record| key_of(&db, &record)))
        .collect::<tundra::Result<Vec<_>>>()?;

    assert_eq!(
        vec![b"aa".to_vec(), b"ab".to_vec(), b"ac".to_vec()],
        keys,
    );

    env.close();
    Ok(())
}

#[test]
fn prefix_scan_spans_memory_and_branches() -> tundra::Result<()> {
    let folder = tempfile::tempdir()?;

    let env = Config::new(&folder).worker_threads(0).open()?;
    let db = env.database(schema())?;

    seed(&db, &["aa", "b"])?;
    db.flush()?;
    seed(&db, &["ab", "ac"])?;

    let keys = db
        .cursor(Order::Gte, None, Some(b"a".as_slice()))?
        .map(|item| item.map(|record| key_of(&db, &record)))
        .collect::<tundra::Result<Vec<_>>>()?;

    assert_eq!(
        vec![b"aa".to_vec(), b"ab".to_vec(), b"ac".to_vec()],
        keys,
    );

    env.close();
    Ok(())
}

#[test]
fn empty_prefix_is_an_unconstrained_scan() -> tundra::Result<()> {
    let folder = tempfile::tempdir()?;

    let env = Config::new(&folder).worker_threads(0).open()?;
    let db = env.database(schema())?;

    seed(&db, &["aa", "ab", "b"])?;

    let all = db
        .cursor(Order::Gte, None, Some(b"".as_slice()))?
        .collect::<tundra::Result<Vec<_>>>()?;

    assert_eq!(3, all.len());

    env.close();
    Ok(())
}

#[test]
fn cursor_orders_and_positioning() -> tundra::Result<()> {
    let folder = tempfile::tempdir()?;

    let env = Config::new(&folder).worker_threads(0).open()?;
    let db = env.database(schema())?;

    seed(&db, &["a", "b", "c", "d"])?;

    let collect = |order, key: Option<&str>| -> tundra::Result<Vec<Vec<u8>>> {
        let key_values = key.map(|key| [FieldValue::Bytes(Slice::from(key))]);

        db.cursor(order, key_values.as_ref().map(<[_; 1]>::as_slice), None)?
            .map(|item| item.map(|record| key_of(&db, &record)))
            .collect()
    };

    assert_eq!(
        vec![b"b".to_vec(), b"c".to_vec(), b"d".to_vec()],
        collect(Order::Gte, Some("b"))?,
    );
    assert_eq!(
        vec![b"c".to_vec(), b"d".to_vec()],
        collect(Order::Gt, Some("b"))?,
    );
    assert_eq!(
        vec![b"c".to_vec(), b"b".to_vec(), b"a".to_vec()],
        collect(Order::Lte, Some("c"))?,
    );
    assert_eq!(
        vec![b"b".to_vec(), b"a".to_vec()],
        collect(Order::Lt, Some("c"))?,
    );

    env.close();
    Ok(())
}

#[test]
fn cursor_past_the_last_key_yields_nothing() -> tundra::Result<()> {
    let folder = tempfile::tempdir()?;

    let env = Config::new(&folder).worker_threads(0).open()?;
    let db = env.database(schema())?;

    seed(&db, &["a", "b"])?;

    let mut cursor = db.cursor(
        Order::Gt,
        Some(&[FieldValue::Bytes(Slice::from("z"))]),
        None,
    )?;

    assert!(cursor.next().is_none());

    env.close();
    Ok(())
}

#[test]
fn cursor_skips_deleted_keys() -> tundra::Result<()> {
    let folder = tempfile::tempdir()?;

    let env = Config::new(&folder).worker_threads(0).open()?;
    let db = env.database(schema())?;

    seed(&db, &["a", "b", "c"])?;
    db.flush()?;
    db.delete(&[FieldValue::Bytes(Slice::from("b"))])?;

    let keys = db
        .cursor(Order::Gte, None, None)?
        .map(|item| item.map(|record| key_of(&db, &record)))
        .collect::<tundra::Result<Vec<_>>>()?;

    assert_eq!(vec![b"a".to_vec(), b"c".to_vec()], keys);

    env.close();
    Ok(())
}
