mod support;

use support::{insert_demo_item, integer, open_engine, register_demo_schema, text};

#[tokio::test]
async fn explicit_transactions_commit_atomically() {
    let engine = open_engine().await;
    register_demo_schema(&engine).await;

    let mut tx = engine.begin_transaction().await.expect("begin");
    tx.execute(
        "INSERT INTO lix_state (entity_id, schema_key, snapshot_content) \
         VALUES ('t1', 'demo_item', '{\"id\":\"t1\",\"value\":\"a\"}')",
        &[],
    )
    .await
    .expect("insert in tx");
    tx.execute(
        "INSERT INTO lix_state (entity_id, schema_key, snapshot_content) \
         VALUES ('t2', 'demo_item', '{\"id\":\"t2\",\"value\":\"b\"}')",
        &[],
    )
    .await
    .expect("second insert in tx");

    // Reads inside the transaction observe the uncommitted rows.
    let inside = tx
        .execute(
            "SELECT COUNT(*) FROM lix_state WHERE schema_key = 'demo_item'",
            &[],
        )
        .await
        .expect("read inside tx");
    assert_eq!(integer(&inside.rows[0][0]), 2);

    tx.commit().await.expect("commit");

    let rows = engine
        .execute(
            "SELECT COUNT(*) FROM lix_state WHERE schema_key = 'demo_item'",
            &[],
        )
        .await
        .expect("read after commit");
    assert_eq!(integer(&rows.rows[0][0]), 2);
}

#[tokio::test]
async fn rollback_discards_writes_and_queued_effects() {
    let engine = open_engine().await;
    register_demo_schema(&engine).await;
    engine
        .execute(
            "INSERT INTO lix_version (id, name, inherits_from_version_id) \
             VALUES ('kid', 'kid', 'main')",
            &[],
        )
        .await
        .expect("create version");

    let mut tx = engine.begin_transaction().await.expect("begin");
    tx.execute(
        "INSERT INTO lix_state (entity_id, schema_key, snapshot_content) \
         VALUES ('t1', 'demo_item', '{\"id\":\"t1\",\"value\":\"a\"}')",
        &[],
    )
    .await
    .expect("insert in tx");
    tx.execute("UPDATE lix_active_version SET version_id = 'kid'", &[])
        .await
        .expect("switch inside tx");
    tx.rollback().await.expect("rollback");

    let rows = engine
        .execute(
            "SELECT COUNT(*) FROM lix_state WHERE schema_key = 'demo_item'",
            &[],
        )
        .await
        .expect("read after rollback");
    assert_eq!(integer(&rows.rows[0][0]), 0);

    // The queued active-version effect was dropped with the transaction.
    assert_eq!(engine.active_version_id(), "main");
    let active = engine
        .execute("SELECT version_id FROM lix_active_version", &[])
        .await
        .expect("read active version");
    assert_eq!(text(&active.rows[0][0]), "main");
}

#[tokio::test]
async fn committed_switch_updates_the_cached_active_version() {
    let engine = open_engine().await;
    engine
        .execute(
            "INSERT INTO lix_version (id, name, inherits_from_version_id) \
             VALUES ('kid', 'kid', 'main')",
            &[],
        )
        .await
        .expect("create version");

    let mut tx = engine.begin_transaction().await.expect("begin");
    tx.execute("UPDATE lix_active_version SET version_id = 'kid'", &[])
        .await
        .expect("switch inside tx");
    tx.commit().await.expect("commit");

    assert_eq!(engine.active_version_id(), "kid");
}

#[tokio::test]
async fn switching_to_a_missing_version_fails() {
    let engine = open_engine().await;
    let err = engine
        .execute("UPDATE lix_active_version SET version_id = 'nope'", &[])
        .await
        .expect_err("missing version must be rejected");
    assert_eq!(err.kind, lix_engine::ErrorKind::NotFound);
}

#[tokio::test]
async fn scripts_share_one_transaction_and_parameter_list() {
    let engine = open_engine().await;
    register_demo_schema(&engine).await;

    engine
        .execute(
            "INSERT INTO lix_state (entity_id, schema_key, snapshot_content) \
             VALUES (?, 'demo_item', ?); \
             INSERT INTO lix_state (entity_id, schema_key, snapshot_content) \
             VALUES (?, 'demo_item', ?)",
            &[
                lix_engine::Value::Text("s1".to_string()),
                lix_engine::Value::Text("{\"id\":\"s1\",\"value\":\"a\"}".to_string()),
                lix_engine::Value::Text("s2".to_string()),
                lix_engine::Value::Text("{\"id\":\"s2\",\"value\":\"b\"}".to_string()),
            ],
        )
        .await
        .expect("script insert");

    let rows = engine
        .execute(
            "SELECT COUNT(*) FROM lix_state WHERE schema_key = 'demo_item'",
            &[],
        )
        .await
        .expect("count");
    assert_eq!(integer(&rows.rows[0][0]), 2);

    insert_demo_item(&engine, "s3", "c").await;
    let rows = engine
        .execute(
            "SELECT COUNT(*) FROM lix_state WHERE schema_key = 'demo_item'",
            &[],
        )
        .await
        .expect("count again");
    assert_eq!(integer(&rows.rows[0][0]), 3);
}
