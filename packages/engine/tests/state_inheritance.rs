mod support;

use lix_engine::Value;
use support::{insert_demo_item, open_engine, register_demo_schema, text};

async fn create_child_version(engine: &lix_engine::Engine, id: &str, parent: &str) {
    engine
        .execute(
            "INSERT INTO lix_version (id, name, inherits_from_version_id) VALUES (?1, ?1, ?2)",
            &[Value::Text(id.to_string()), Value::Text(parent.to_string())],
        )
        .await
        .expect("create version");
}

async fn switch_active(engine: &lix_engine::Engine, version_id: &str) {
    engine
        .execute(
            "UPDATE lix_active_version SET version_id = ?1",
            &[Value::Text(version_id.to_string())],
        )
        .await
        .expect("switch active version");
}

#[tokio::test]
async fn child_versions_inherit_parent_rows() {
    let engine = open_engine().await;
    register_demo_schema(&engine).await;
    insert_demo_item(&engine, "e1", "from-main").await;

    create_child_version(&engine, "kid", "main").await;
    switch_active(&engine, "kid").await;

    let rows = engine
        .execute(
            "SELECT snapshot_content, inherited_from_version_id FROM lix_state \
             WHERE schema_key = 'demo_item' AND entity_id = 'e1'",
            &[],
        )
        .await
        .expect("select inherited");
    assert_eq!(rows.rows.len(), 1);
    let snapshot: serde_json::Value =
        serde_json::from_str(&text(&rows.rows[0][0])).expect("snapshot JSON");
    assert_eq!(snapshot["value"], "from-main");
    assert_eq!(text(&rows.rows[0][1]), "main");
}

#[tokio::test]
async fn child_writes_shadow_without_touching_the_parent() {
    let engine = open_engine().await;
    register_demo_schema(&engine).await;
    insert_demo_item(&engine, "e1", "from-main").await;
    create_child_version(&engine, "kid", "main").await;
    switch_active(&engine, "kid").await;

    engine
        .execute(
            "UPDATE lix_state SET snapshot_content = '{\"id\":\"e1\",\"value\":\"from-kid\"}' \
             WHERE schema_key = 'demo_item' AND entity_id = 'e1'",
            &[],
        )
        .await
        .expect("shadowing update");

    let kid_rows = engine
        .execute(
            "SELECT snapshot_content FROM lix_state_by_version \
             WHERE version_id = 'kid' AND schema_key = 'demo_item' AND entity_id = 'e1'",
            &[],
        )
        .await
        .expect("kid read");
    let kid_snapshot: serde_json::Value =
        serde_json::from_str(&text(&kid_rows.rows[0][0])).expect("snapshot JSON");
    assert_eq!(kid_snapshot["value"], "from-kid");

    let main_rows = engine
        .execute(
            "SELECT snapshot_content FROM lix_state_by_version \
             WHERE version_id = 'main' AND schema_key = 'demo_item' AND entity_id = 'e1'",
            &[],
        )
        .await
        .expect("main read");
    let main_snapshot: serde_json::Value =
        serde_json::from_str(&text(&main_rows.rows[0][0])).expect("snapshot JSON");
    assert_eq!(main_snapshot["value"], "from-main");
}

#[tokio::test]
async fn inherited_delete_tombstones_the_child_only() {
    let engine = open_engine().await;
    register_demo_schema(&engine).await;
    insert_demo_item(&engine, "e1", "from-main").await;
    create_child_version(&engine, "kid", "main").await;
    switch_active(&engine, "kid").await;

    engine
        .execute(
            "DELETE FROM lix_state WHERE schema_key = 'demo_item' AND entity_id = 'e1'",
            &[],
        )
        .await
        .expect("inherited delete");

    let kid_rows = engine
        .execute(
            "SELECT entity_id FROM lix_state_by_version \
             WHERE version_id = 'kid' AND schema_key = 'demo_item'",
            &[],
        )
        .await
        .expect("kid read");
    assert!(kid_rows.rows.is_empty());

    let main_rows = engine
        .execute(
            "SELECT entity_id FROM lix_state_by_version \
             WHERE version_id = 'main' AND schema_key = 'demo_item'",
            &[],
        )
        .await
        .expect("main read");
    assert_eq!(main_rows.rows.len(), 1);
}

#[tokio::test]
async fn tombstoned_entities_can_be_reinserted_in_the_child() {
    let engine = open_engine().await;
    register_demo_schema(&engine).await;
    insert_demo_item(&engine, "e1", "from-main").await;
    create_child_version(&engine, "kid", "main").await;
    switch_active(&engine, "kid").await;

    engine
        .execute(
            "DELETE FROM lix_state WHERE schema_key = 'demo_item' AND entity_id = 'e1'",
            &[],
        )
        .await
        .expect("delete");
    insert_demo_item(&engine, "e1", "reborn").await;

    let rows = engine
        .execute(
            "SELECT snapshot_content FROM lix_state \
             WHERE schema_key = 'demo_item' AND entity_id = 'e1'",
            &[],
        )
        .await
        .expect("select");
    let snapshot: serde_json::Value =
        serde_json::from_str(&text(&rows.rows[0][0])).expect("snapshot JSON");
    assert_eq!(snapshot["value"], "reborn");
}

#[tokio::test]
async fn version_view_lists_descriptors_with_tips() {
    let engine = open_engine().await;
    create_child_version(&engine, "kid", "main").await;

    let rows = engine
        .execute(
            "SELECT id, inherits_from_version_id, commit_id FROM lix_version \
             WHERE id = 'kid'",
            &[],
        )
        .await
        .expect("select version");
    assert_eq!(rows.rows.len(), 1);
    assert_eq!(text(&rows.rows[0][1]), "main");
    // New versions start at their parent's tip.
    assert!(!text(&rows.rows[0][2]).is_empty());
}
