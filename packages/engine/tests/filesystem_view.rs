mod support;

use lix_engine::Value;
use support::{blob, integer, open_engine, text};

#[tokio::test]
async fn nested_insert_creates_ancestor_directories_atomically() {
    let engine = open_engine().await;
    engine
        .execute(
            "INSERT INTO lix_file (path, data) VALUES ('/docs/readme.md', ?1)",
            &[Value::Blob(b"hello".to_vec())],
        )
        .await
        .expect("insert nested file");

    let files = engine
        .execute("SELECT path FROM lix_file", &[])
        .await
        .expect("list files");
    let paths: Vec<String> = files.rows.iter().map(|row| text(&row[0])).collect();
    assert_eq!(paths, vec!["/docs/readme.md".to_string()]);

    let dirs = engine
        .execute("SELECT path FROM lix_directory", &[])
        .await
        .expect("list directories");
    let dir_paths: Vec<String> = dirs.rows.iter().map(|row| text(&row[0])).collect();
    assert_eq!(dir_paths, vec!["/docs/".to_string()]);

    // A root-level file with the same name does not collide with the nested
    // one.
    engine
        .execute(
            "INSERT INTO lix_file (path, data) VALUES ('/readme.md', ?1)",
            &[Value::Blob(b"root".to_vec())],
        )
        .await
        .expect("insert root-level file");
}

#[tokio::test]
async fn duplicate_paths_collide_per_version() {
    let engine = open_engine().await;
    engine
        .execute(
            "INSERT INTO lix_file (path, data) VALUES ('/a.bin', ?1)",
            &[Value::Blob(b"one".to_vec())],
        )
        .await
        .expect("first insert");

    let err = engine
        .execute(
            "INSERT INTO lix_file (path, data) VALUES ('/a.bin', ?1)",
            &[Value::Blob(b"two".to_vec())],
        )
        .await
        .expect_err("duplicate path must collide");
    assert_eq!(err.kind, lix_engine::ErrorKind::Constraint);
}

#[tokio::test]
async fn data_round_trips_through_the_binary_fallback() {
    let engine = open_engine().await;
    let payload = b"opaque-bytes-without-a-plugin".to_vec();
    engine
        .execute(
            "INSERT INTO lix_file (path, data) VALUES ('/blob.bin', ?1)",
            &[Value::Blob(payload.clone())],
        )
        .await
        .expect("insert binary file");

    let rows = engine
        .execute("SELECT data FROM lix_file WHERE path = '/blob.bin'", &[])
        .await
        .expect("read bytes");
    assert_eq!(blob(&rows.rows[0][0]), payload);
}

#[tokio::test]
async fn delete_with_missing_ids_is_a_no_op() {
    let engine = open_engine().await;
    let result = engine
        .execute(
            "DELETE FROM lix_file WHERE id IN ('missing-1', 'missing-2')",
            &[],
        )
        .await
        .expect("delete of absent ids");
    assert_eq!(result.affected, 0);
}

#[tokio::test]
async fn deleting_a_file_hides_it_and_keeps_history() {
    let engine = open_engine().await;
    engine
        .execute(
            "INSERT INTO lix_file (path, data) VALUES ('/gone.bin', ?1)",
            &[Value::Blob(b"bytes".to_vec())],
        )
        .await
        .expect("insert");
    let id_rows = engine
        .execute("SELECT id FROM lix_file WHERE path = '/gone.bin'", &[])
        .await
        .expect("lookup id");
    let file_id = text(&id_rows.rows[0][0]);

    let deleted = engine
        .execute(
            "DELETE FROM lix_file WHERE path IN ('/gone.bin')",
            &[],
        )
        .await
        .expect("delete file");
    assert_eq!(deleted.affected, 1);

    let listed = engine
        .execute("SELECT path FROM lix_file", &[])
        .await
        .expect("list");
    assert!(listed.rows.is_empty());

    // The descriptor's create and tombstone changes survive in the log.
    let changes = engine
        .execute(
            "SELECT COUNT(*) FROM lix_internal_change \
             WHERE schema_key = 'lix_file_descriptor' AND entity_id = ?1",
            &[Value::Text(file_id)],
        )
        .await
        .expect("count descriptor changes");
    assert_eq!(integer(&changes.rows[0][0]), 2);
}

#[tokio::test]
async fn renames_update_the_computed_path() {
    let engine = open_engine().await;
    engine
        .execute(
            "INSERT INTO lix_file (path, data) VALUES ('/old.bin', ?1)",
            &[Value::Blob(b"bytes".to_vec())],
        )
        .await
        .expect("insert");

    engine
        .execute(
            "UPDATE lix_file SET path = '/moved/new.bin' WHERE path = '/old.bin'",
            &[],
        )
        .await
        .expect("rename");

    let rows = engine
        .execute("SELECT path FROM lix_file", &[])
        .await
        .expect("list");
    assert_eq!(text(&rows.rows[0][0]), "/moved/new.bin");

    let bytes = engine
        .execute("SELECT data FROM lix_file WHERE path = '/moved/new.bin'", &[])
        .await
        .expect("read after rename");
    assert_eq!(blob(&bytes.rows[0][0]), b"bytes".to_vec());
}

#[tokio::test]
async fn file_writes_are_isolated_per_version() {
    let engine = open_engine().await;
    engine
        .execute(
            "INSERT INTO lix_file (path, data) VALUES ('/readme.md', ?1)",
            &[Value::Blob(b"v1".to_vec())],
        )
        .await
        .expect("insert in main");

    engine
        .execute(
            "INSERT INTO lix_version (id, name, inherits_from_version_id) \
             VALUES ('kid', 'kid', 'main')",
            &[],
        )
        .await
        .expect("create child version");
    engine
        .execute("UPDATE lix_active_version SET version_id = 'kid'", &[])
        .await
        .expect("switch to child");

    engine
        .execute("DELETE FROM lix_file WHERE path IN ('/readme.md')", &[])
        .await
        .expect("inherited delete");
    engine
        .execute(
            "INSERT INTO lix_file (path, data) VALUES ('/readme.md', ?1)",
            &[Value::Blob(b"v2".to_vec())],
        )
        .await
        .expect("re-insert in child");

    let kid = engine
        .execute("SELECT data FROM lix_file WHERE path = '/readme.md'", &[])
        .await
        .expect("read child bytes");
    assert_eq!(blob(&kid.rows[0][0]), b"v2".to_vec());

    let main = engine
        .execute(
            "SELECT data FROM lix_file_by_version \
             WHERE version_id = 'main' AND path = '/readme.md'",
            &[],
        )
        .await
        .expect("read parent bytes");
    assert_eq!(blob(&main.rows[0][0]), b"v1".to_vec());
}
