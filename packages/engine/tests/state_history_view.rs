mod support;

use lix_engine::Value;
use support::{
    insert_demo_item, integer, open_deterministic_engine, register_demo_schema, text,
};

async fn update_demo_item(engine: &lix_engine::Engine, entity_id: &str, value: &str) {
    engine
        .execute(
            "UPDATE lix_state SET snapshot_content = ?1 \
             WHERE schema_key = 'demo_item' AND entity_id = ?2",
            &[
                Value::Text(format!("{{\"id\":\"{entity_id}\",\"value\":\"{value}\"}}")),
                Value::Text(entity_id.to_string()),
            ],
        )
        .await
        .expect("update demo item");
}

async fn active_tip(engine: &lix_engine::Engine) -> String {
    let rows = engine
        .execute("SELECT commit_id FROM lix_version WHERE id = 'main'", &[])
        .await
        .expect("read main tip");
    text(&rows.rows[0][0])
}

#[tokio::test]
async fn point_lookup_returns_the_latest_change_under_the_root() {
    let engine = open_deterministic_engine().await;
    register_demo_schema(&engine).await;

    insert_demo_item(&engine, "e", "v1").await;
    update_demo_item(&engine, "e", "v2").await;
    update_demo_item(&engine, "e", "v3").await;
    let tip = active_tip(&engine).await;

    let rows = engine
        .execute(
            "SELECT snapshot_content FROM lix_state_history \
             WHERE entity_id = 'e' AND root_commit_id = ?1 \
             ORDER BY created_at DESC LIMIT 1",
            &[Value::Text(tip.clone())],
        )
        .await
        .expect("history point lookup");
    assert_eq!(rows.rows.len(), 1);
    let snapshot: serde_json::Value =
        serde_json::from_str(&text(&rows.rows[0][0])).expect("snapshot JSON");
    assert_eq!(snapshot["value"], "v3");
}

#[tokio::test]
async fn history_returns_every_change_not_deduplicated() {
    let engine = open_deterministic_engine().await;
    register_demo_schema(&engine).await;

    insert_demo_item(&engine, "e", "v1").await;
    update_demo_item(&engine, "e", "v2").await;
    update_demo_item(&engine, "e", "v3").await;
    let tip = active_tip(&engine).await;

    let rows = engine
        .execute(
            "SELECT snapshot_content, depth FROM lix_state_history \
             WHERE entity_id = 'e' AND root_commit_id = ?1 \
             ORDER BY created_at ASC",
            &[Value::Text(tip)],
        )
        .await
        .expect("full history");
    assert_eq!(rows.rows.len(), 3);
    let first: serde_json::Value =
        serde_json::from_str(&text(&rows.rows[0][0])).expect("snapshot JSON");
    assert_eq!(first["value"], "v1");
    // The oldest change sits deepest in the ancestry.
    assert!(integer(&rows.rows[0][1]) > integer(&rows.rows[2][1]));
}

#[tokio::test]
async fn maintenance_is_idempotent_for_a_fixed_root() {
    let engine = open_deterministic_engine().await;
    register_demo_schema(&engine).await;
    insert_demo_item(&engine, "e", "v1").await;
    update_demo_item(&engine, "e", "v2").await;
    let tip = active_tip(&engine).await;

    let sql = "SELECT change_id FROM lix_state_history \
               WHERE entity_id = 'e' AND root_commit_id = ?1";
    engine
        .execute(sql, &[Value::Text(tip.clone())])
        .await
        .expect("first history read");
    let graph_rows_after_first = graph_row_count(&engine).await;

    engine
        .execute(sql, &[Value::Text(tip)])
        .await
        .expect("second history read");
    assert_eq!(graph_row_count(&engine).await, graph_rows_after_first);
}

#[tokio::test]
async fn depth_bound_filters_older_commits() {
    let engine = open_deterministic_engine().await;
    register_demo_schema(&engine).await;
    insert_demo_item(&engine, "e", "v1").await;
    update_demo_item(&engine, "e", "v2").await;
    update_demo_item(&engine, "e", "v3").await;
    let tip = active_tip(&engine).await;

    let bounded = engine
        .execute(
            "SELECT snapshot_content FROM lix_state_history \
             WHERE entity_id = 'e' AND root_commit_id = ?1 AND depth <= 0",
            &[Value::Text(tip)],
        )
        .await
        .expect("bounded history");
    assert_eq!(bounded.rows.len(), 1);
    let snapshot: serde_json::Value =
        serde_json::from_str(&text(&bounded.rows[0][0])).expect("snapshot JSON");
    assert_eq!(snapshot["value"], "v3");
}

#[tokio::test]
async fn missing_root_defaults_to_the_active_tip() {
    let engine = open_deterministic_engine().await;
    register_demo_schema(&engine).await;
    insert_demo_item(&engine, "e", "v1").await;
    update_demo_item(&engine, "e", "v2").await;

    let rows = engine
        .execute(
            "SELECT snapshot_content FROM lix_state_history \
             WHERE entity_id = 'e' ORDER BY created_at DESC LIMIT 1",
            &[],
        )
        .await
        .expect("history without explicit root");
    assert_eq!(rows.rows.len(), 1);
    let snapshot: serde_json::Value =
        serde_json::from_str(&text(&rows.rows[0][0])).expect("snapshot JSON");
    assert_eq!(snapshot["value"], "v2");
}

async fn graph_row_count(engine: &lix_engine::Engine) -> i64 {
    let rows = engine
        .execute(
            "SELECT COUNT(*) FROM lix_internal_materialization_commit_graph",
            &[],
        )
        .await
        .expect("count graph rows");
    integer(&rows.rows[0][0])
}
