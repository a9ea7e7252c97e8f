use test_log::test;
use tundra::{Config, FieldType, FieldValue, Schema, Slice};

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
fn backup_can_be_opened_as_environment() -> tundra::Result<()> {
    let folder = tempfile::tempdir()?;
    let backups = tempfile::tempdir()?;

    {
        let env = Config::new(&folder)
            .worker_threads(0)
            .backup_path(backups.path())
            .open()?;
        let db = env.database(schema())?;

        for n in 0..20u32 {
            db.set(&kv(&format!("k{n:02}"), &n.to_string()))?;
        }

        db.flush()?;

        // buffered tail, only in the WAL at backup time
        db.set(&kv("tail", "t"))?;

        let bsn = env.backup()?;
        assert_eq!(1, bsn);

        env.close();
    }

    let backup_dir = backups.path().join("1");
    assert!(backup_dir.join("x").join("scheme").exists());
    assert!(backup_dir.join("log").exists());
    assert!(!backups.path().join("1.incomplete").exists());

    // a backup is a complete environment directory
    {
        let env = Config::new(&backup_dir).worker_threads(0).open()?;
        let db = env.database(schema())?;

        for n in 0..20u32 {
            assert!(
                db.get(&[FieldValue::Bytes(Slice::from(format!("k{n:02}")))])?.is_some(),
                "k{n:02} missing from backup",
            );
        }

        assert!(db.get(&[FieldValue::Bytes(Slice::from("tail"))])?.is_some());

        env.close();
    }

    Ok(())
}

#[test]
fn backup_ids_are_monotonic() -> tundra::Result<()> {
    let folder = tempfile::tempdir()?;
    let backups = tempfile::tempdir()?;

    {
        let env = Config::new(&folder)
            .worker_threads(0)
            .backup_path(backups.path())
            .open()?;
        let db = env.database(schema())?;

        db.set(&kv("a", "1"))?;

        assert_eq!(1, env.backup()?);
        assert_eq!(2, env.backup()?);

        env.close();
    }

    // a reopened environment continues the sequence
    {
        let env = Config::new(&folder)
            .worker_threads(0)
            .backup_path(backups.path())
            .open()?;

        assert_eq!(3, env.backup()?);

        env.close();
    }

    assert!(backups.path().join("3").exists());

    Ok(())
}

#[test]
fn backup_without_configured_path_is_rejected() -> tundra::Result<()> {
    let folder = tempfile::tempdir()?;

    let env = Config::new(&folder).worker_threads(0).open()?;

    assert!(matches!(env.backup(), Err(tundra::Error::BadRequest(_))));

    env.close();
    Ok(())
}

#[test]
fn restored_backup_is_independent() -> tundra::Result<()> {
    let folder = tempfile::tempdir()?;
    let backups = tempfile::tempdir()?;
    let restore = tempfile::tempdir()?;

    {
        let env = Config::new(&folder)
            .worker_threads(0)
            .backup_path(backups.path())
            .open()?;
        let db = env.database(schema())?;

        db.set(&kv("k", "1"))?;
        db.flush()?;
        env.backup()?;

        // mutate the original after the backup
        db.set(&kv("k", "2"))?;

        env.close();
    }

    // restore = copy the backup directory somewhere else and open it
    let options = fs_extra::dir::CopyOptions::new().content_only(true);
    fs_extra::dir::copy(backups.path().join("1"), restore.path(), &options)
        .map_err(|e| std::io::Error::other(e.to_string()))?;

    {
        let env = Config::new(&restore).worker_threads(0).open()?;
        let db = env.database(schema())?;

        let payload = db.get(&[FieldValue::Bytes(Slice::from("k"))])?.unwrap();

        let v = db.schema().decode_field_by_name(&payload, "v")?;
        assert_eq!(FieldValue::Bytes(Slice::from("1")), v);

        env.close();
    }

    Ok(())
}
