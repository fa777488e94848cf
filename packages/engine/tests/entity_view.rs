mod support;

use support::{insert_demo_item, open_engine, register_demo_schema, text};

#[tokio::test]
async fn entity_view_filters_by_entity_id() {
    let engine = open_engine().await;
    register_demo_schema(&engine).await;
    insert_demo_item(&engine, "e1", "one").await;
    insert_demo_item(&engine, "e2", "two").await;

    let rows = engine
        .execute(
            "SELECT entity_id, snapshot_content FROM entity WHERE entity_id = 'e1'",
            &[],
        )
        .await
        .expect("entity read");
    assert_eq!(rows.rows.len(), 1);
    assert_eq!(text(&rows.rows[0][0]), "e1");
}

#[tokio::test]
async fn entity_by_version_scopes_explicitly() {
    let engine = open_engine().await;
    register_demo_schema(&engine).await;
    insert_demo_item(&engine, "e1", "one").await;

    engine
        .execute(
            "INSERT INTO lix_version (id, name, inherits_from_version_id) \
             VALUES ('kid', 'kid', 'main')",
            &[],
        )
        .await
        .expect("create version");

    let rows = engine
        .execute(
            "SELECT entity_id, version_id FROM entity_by_version \
             WHERE entity_id = 'e1' AND version_id = 'kid'",
            &[],
        )
        .await
        .expect("entity by version read");
    assert_eq!(rows.rows.len(), 1);
    assert_eq!(text(&rows.rows[0][1]), "kid");
}

#[tokio::test]
async fn entity_history_tracks_one_entity() {
    let engine = open_engine().await;
    register_demo_schema(&engine).await;
    insert_demo_item(&engine, "e1", "one").await;
    insert_demo_item(&engine, "e2", "two").await;
    engine
        .execute(
            "UPDATE lix_state SET snapshot_content = '{\"id\":\"e1\",\"value\":\"three\"}' \
             WHERE schema_key = 'demo_item' AND entity_id = 'e1'",
            &[],
        )
        .await
        .expect("update e1");

    let tip_rows = engine
        .execute("SELECT commit_id FROM lix_version WHERE id = 'main'", &[])
        .await
        .expect("read tip");
    let tip = text(&tip_rows.rows[0][0]);

    let rows = engine
        .execute(
            "SELECT entity_id FROM entity_history \
             WHERE entity_id = 'e1' AND root_commit_id = ?1",
            &[lix_engine::Value::Text(tip)],
        )
        .await
        .expect("entity history read");
    assert_eq!(rows.rows.len(), 2);
    for row in &rows.rows {
        assert_eq!(text(&row[0]), "e1");
    }
}
