use test_log::test;
use tundra::{Config, Durability, FieldType, FieldValue, RecoveryMode, Schema, Slice};

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

#[test]
fn unflushed_writes_survive_via_wal() -> tundra::Result<()> {
    let folder = tempfile::tempdir()?;

    {
        let env = Config::new(&folder)
            .worker_threads(0)
            .durability(Durability::Fsync)
            .open()?;
        let db = env.database(schema())?;

        for n in 0..10u32 {
            db.set(&kv(&format!("k{n}"), &n.to_string()))?;
        }

        // no flush; the memory index dies with the process
        env.close();
    }

    {
        let env = Config::new(&folder).worker_threads(0).open()?;
        let db = env.database(schema())?;

        for n in 0..10u32 {
            assert!(
                db.get(&[FieldValue::Bytes(Slice::from(format!("k{n}")))])?.is_some(),
                "k{n} lost",
            );
        }

        env.close();
    }

    Ok(())
}

#[test]
fn replay_is_idempotent_over_flushed_data() -> tundra::Result<()> {
    let folder = tempfile::tempdir()?;

    {
        let env = Config::new(&folder).worker_threads(0).open()?;
        let db = env.database(schema())?;

        db.set(&kv("flushed", "1"))?;
        db.flush()?;
        db.set(&kv("buffered", "2"))?;

        env.close();
    }

    // two consecutive recoveries must converge to the same state
    for _ in 0..2 {
        let env = Config::new(&folder).worker_threads(0).open()?;
        let db = env.database(schema())?;

        assert!(db.get(&[FieldValue::Bytes(Slice::from("flushed"))])?.is_some());
        assert!(db.get(&[FieldValue::Bytes(Slice::from("buffered"))])?.is_some());

        env.close();
    }

    Ok(())
}

#[test]
fn recovery_mode_none_discards_the_log() -> tundra::Result<()> {
    let folder = tempfile::tempdir()?;

    {
        let env = Config::new(&folder).worker_threads(0).open()?;
        let db = env.database(schema())?;

        db.set(&kv("flushed", "1"))?;
        db.flush()?;
        db.set(&kv("buffered", "2"))?;

        env.close();
    }

    {
        let env = Config::new(&folder)
            .worker_threads(0)
            .recovery(RecoveryMode::None)
            .open()?;
        let db = env.database(schema())?;

        // branch data survives, the unflushed tail is gone
        assert!(db.get(&[FieldValue::Bytes(Slice::from("flushed"))])?.is_some());
        assert!(db.get(&[FieldValue::Bytes(Slice::from("buffered"))])?.is_none());

        env.close();
    }

    Ok(())
}

#[test]
fn lsn_is_monotonic_across_restarts() -> tundra::Result<()> {
    let folder = tempfile::tempdir()?;

    let committed = {
        let env = Config::new(&folder).worker_threads(0).open()?;
        let db = env.database(schema())?;

        db.set(&kv("a", "1"))?;
        let lsn = db.set(&kv("b", "2"))?;

        env.close();
        lsn
    };

    {
        let env = Config::new(&folder).worker_threads(0).open()?;
        assert!(env.lsn() >= committed);

        // new writes get strictly newer LSNs
        let db = env.database(schema())?;
        let next = db.set(&kv("c", "3"))?;
        assert!(next > committed);

        env.close();
    }

    Ok(())
}

#[test]
fn wal_disabled_loses_unflushed_writes() -> tundra::Result<()> {
    let folder = tempfile::tempdir()?;

    {
        let env = Config::new(&folder).worker_threads(0).wal(false).open()?;
        let db = env.database(schema())?;

        db.set(&kv("flushed", "1"))?;
        db.flush()?;
        db.set(&kv("buffered", "2"))?;

        env.close();
    }

    {
        let env = Config::new(&folder).worker_threads(0).wal(false).open()?;
        let db = env.database(schema())?;

        assert!(db.get(&[FieldValue::Bytes(Slice::from("flushed"))])?.is_some());
        assert!(db.get(&[FieldValue::Bytes(Slice::from("buffered"))])?.is_none());

        env.close();
    }

    Ok(())
}
