mod support;

use lix_engine::Value;
use support::{insert_demo_item, integer, open_engine, register_demo_schema, text};

#[tokio::test]
async fn insert_and_read_back_effective_state() {
    let engine = open_engine().await;
    register_demo_schema(&engine).await;
    insert_demo_item(&engine, "e1", "first").await;

    let rows = engine
        .execute(
            "SELECT entity_id, snapshot_content, version_id FROM lix_state \
             WHERE schema_key = 'demo_item'",
            &[],
        )
        .await
        .expect("select state");
    assert_eq!(rows.rows.len(), 1);
    assert_eq!(text(&rows.rows[0][0]), "e1");
    let snapshot: serde_json::Value =
        serde_json::from_str(&text(&rows.rows[0][1])).expect("snapshot JSON");
    assert_eq!(snapshot["value"], "first");
    assert_eq!(text(&rows.rows[0][2]), engine.active_version_id());
}

#[tokio::test]
async fn update_replaces_the_snapshot_and_appends_one_change() {
    let engine = open_engine().await;
    register_demo_schema(&engine).await;
    insert_demo_item(&engine, "e1", "first").await;

    let before = change_count(&engine, "demo_item").await;
    engine
        .execute(
            "UPDATE lix_state SET snapshot_content = ?1 \
             WHERE schema_key = 'demo_item' AND entity_id = 'e1'",
            &[Value::Text("{\"id\":\"e1\",\"value\":\"second\"}".to_string())],
        )
        .await
        .expect("update state");

    let rows = engine
        .execute(
            "SELECT snapshot_content FROM lix_state \
             WHERE schema_key = 'demo_item' AND entity_id = 'e1'",
            &[],
        )
        .await
        .expect("select state");
    let snapshot: serde_json::Value =
        serde_json::from_str(&text(&rows.rows[0][0])).expect("snapshot JSON");
    assert_eq!(snapshot["value"], "second");
    assert_eq!(change_count(&engine, "demo_item").await, before + 1);
}

#[tokio::test]
async fn empty_update_appends_no_change() {
    let engine = open_engine().await;
    register_demo_schema(&engine).await;
    insert_demo_item(&engine, "e1", "first").await;

    let before = change_count(&engine, "demo_item").await;
    engine
        .execute(
            "UPDATE lix_state SET snapshot_content = ?1 \
             WHERE schema_key = 'demo_item' AND entity_id = 'e1'",
            &[Value::Text("{\"id\":\"e1\",\"value\":\"first\"}".to_string())],
        )
        .await
        .expect("no-op update");
    assert_eq!(change_count(&engine, "demo_item").await, before);
}

#[tokio::test]
async fn delete_masks_the_row_with_a_tombstone() {
    let engine = open_engine().await;
    register_demo_schema(&engine).await;
    insert_demo_item(&engine, "e1", "first").await;

    engine
        .execute(
            "DELETE FROM lix_state WHERE schema_key = 'demo_item' AND entity_id = 'e1'",
            &[],
        )
        .await
        .expect("delete state");

    let rows = engine
        .execute(
            "SELECT entity_id FROM lix_state WHERE schema_key = 'demo_item'",
            &[],
        )
        .await
        .expect("select state");
    assert!(rows.rows.is_empty());

    // The change log keeps the full story: create plus tombstone.
    assert_eq!(change_count(&engine, "demo_item").await, 2);
}

#[tokio::test]
async fn count_star_matches_the_ranked_row_count() {
    let engine = open_engine().await;
    register_demo_schema(&engine).await;
    for index in 0..7 {
        insert_demo_item(&engine, &format!("e{index}"), "x").await;
    }
    engine
        .execute(
            "DELETE FROM lix_state WHERE schema_key = 'demo_item' AND entity_id = 'e3'",
            &[],
        )
        .await
        .expect("delete one");

    let count = engine
        .execute(
            "SELECT COUNT(*) FROM lix_state WHERE schema_key = 'demo_item'",
            &[],
        )
        .await
        .expect("count");
    assert_eq!(integer(&count.rows[0][0]), 6);

    let rows = engine
        .execute(
            "SELECT entity_id FROM lix_state WHERE schema_key = 'demo_item'",
            &[],
        )
        .await
        .expect("select");
    assert_eq!(rows.rows.len(), 6);
}

#[tokio::test]
async fn state_rows_expose_a_commit_id() {
    let engine = open_engine().await;
    register_demo_schema(&engine).await;
    insert_demo_item(&engine, "e1", "first").await;

    let rows = engine
        .execute(
            "SELECT commit_id FROM lix_state \
             WHERE schema_key = 'demo_item' AND entity_id = 'e1'",
            &[],
        )
        .await
        .expect("select commit id");
    let commit_id = text(&rows.rows[0][0]);
    assert!(!commit_id.is_empty());
    assert_ne!(commit_id, "untracked");
}

#[tokio::test]
async fn failed_validation_leaves_no_partial_state() {
    let engine = open_engine().await;
    register_demo_schema(&engine).await;

    let changes_before = total_change_count(&engine).await;
    let snapshots_before = snapshot_count(&engine).await;

    let err = engine
        .execute(
            "INSERT INTO lix_state (entity_id, schema_key, snapshot_content) \
             VALUES ('bad', 'demo_item', '{\"id\":\"bad\",\"value\":7}')",
            &[],
        )
        .await
        .expect_err("integer value must fail schema validation");
    assert_eq!(err.kind, lix_engine::ErrorKind::Validation);

    assert_eq!(total_change_count(&engine).await, changes_before);
    assert_eq!(snapshot_count(&engine).await, snapshots_before);
    let rows = engine
        .execute(
            "SELECT entity_id FROM lix_state WHERE schema_key = 'demo_item'",
            &[],
        )
        .await
        .expect("select");
    assert!(rows.rows.is_empty());
}

#[tokio::test]
async fn identical_content_is_stored_as_one_snapshot_row() {
    let engine = open_engine().await;
    support::register_json_property_schema(&engine).await;

    // Two different entities carrying byte-identical content share one
    // content-addressed snapshot.
    for entity_id in ["a", "b"] {
        engine
            .execute(
                "INSERT INTO lix_state (entity_id, schema_key, snapshot_content) \
                 VALUES (?1, 'json_property', '{\"path\":\"p\",\"value\":1}')",
                &[Value::Text(entity_id.to_string())],
            )
            .await
            .expect("insert shared content");
    }

    let rows = engine
        .execute(
            "SELECT COUNT(*) FROM lix_internal_snapshot \
             WHERE content = '{\"path\":\"p\",\"value\":1}'",
            &[],
        )
        .await
        .expect("count snapshots");
    assert_eq!(integer(&rows.rows[0][0]), 1);

    // Both changes reference that snapshot.
    assert_eq!(change_count(&engine, "json_property").await, 2);
}

async fn change_count(engine: &lix_engine::Engine, schema_key: &str) -> i64 {
    let rows = engine
        .execute(
            "SELECT COUNT(*) FROM lix_internal_change WHERE schema_key = ?1",
            &[Value::Text(schema_key.to_string())],
        )
        .await
        .expect("count changes");
    integer(&rows.rows[0][0])
}

async fn total_change_count(engine: &lix_engine::Engine) -> i64 {
    let rows = engine
        .execute("SELECT COUNT(*) FROM lix_internal_change", &[])
        .await
        .expect("count changes");
    integer(&rows.rows[0][0])
}

async fn snapshot_count(engine: &lix_engine::Engine) -> i64 {
    let rows = engine
        .execute("SELECT COUNT(*) FROM lix_internal_snapshot", &[])
        .await
        .expect("count snapshots");
    integer(&rows.rows[0][0])
}
