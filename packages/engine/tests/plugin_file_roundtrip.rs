mod support;

use lix_engine::Value;
use support::{blob, install_json_plugin, integer, open_engine, text};

const INITIAL: &[u8] = br#"{"theme":"light","lang":"en"}"#;
const UPDATED: &[u8] = br#"{"theme":"dark","lang":"en"}"#;

#[tokio::test]
async fn json_property_edit_emits_per_property_changes() {
    let engine = open_engine().await;
    install_json_plugin(&engine).await;

    engine
        .execute(
            "INSERT INTO lix_file (path, data) VALUES ('/settings.json', ?1)",
            &[Value::Blob(INITIAL.to_vec())],
        )
        .await
        .expect("insert settings file");
    engine
        .execute(
            "UPDATE lix_file SET data = ?1 WHERE path = '/settings.json'",
            &[Value::Blob(UPDATED.to_vec())],
        )
        .await
        .expect("update settings file");

    // One create per observed property plus one update for theme; nothing
    // for the untouched lang property.
    let theme_changes = property_change_count(&engine, "settings.theme").await;
    let lang_changes = property_change_count(&engine, "settings.lang").await;
    assert_eq!(theme_changes, 2);
    assert_eq!(lang_changes, 1);

    let bytes = engine
        .execute("SELECT data FROM lix_file WHERE path = '/settings.json'", &[])
        .await
        .expect("read bytes back");
    let stored: serde_json::Value =
        serde_json::from_slice(&blob(&bytes.rows[0][0])).expect("bytes are JSON");
    assert_eq!(
        stored,
        serde_json::json!({"theme": "dark", "lang": "en"})
    );

    let theme = engine
        .execute(
            "SELECT snapshot_content FROM lix_state WHERE entity_id = 'settings.theme'",
            &[],
        )
        .await
        .expect("read theme entity");
    let snapshot: serde_json::Value =
        serde_json::from_str(&text(&theme.rows[0][0])).expect("snapshot JSON");
    assert_eq!(snapshot["value"], "dark");
}

#[tokio::test]
async fn apply_changes_reconstructs_bytes_without_a_cache_row() {
    let engine = open_engine().await;
    install_json_plugin(&engine).await;

    engine
        .execute(
            "INSERT INTO lix_file (path, data) VALUES ('/settings.json', ?1)",
            &[Value::Blob(INITIAL.to_vec())],
        )
        .await
        .expect("insert settings file");

    // Drop the cache so the next read has to re-run apply_changes.
    engine
        .execute("DELETE FROM lix_internal_file_data_cache", &[])
        .await
        .expect("clear data cache");

    let bytes = engine
        .execute("SELECT data FROM lix_file WHERE path = '/settings.json'", &[])
        .await
        .expect("read bytes");
    let stored: serde_json::Value =
        serde_json::from_slice(&blob(&bytes.rows[0][0])).expect("bytes are JSON");
    assert_eq!(
        stored,
        serde_json::json!({"theme": "light", "lang": "en"})
    );
}

#[tokio::test]
async fn more_specific_globs_win_plugin_selection() {
    let engine = open_engine().await;
    install_json_plugin(&engine).await;

    // A second manifest with a catch-all glob must not steal JSON files;
    // installation itself is deduplicated by key.
    engine
        .install_plugin(support::json_plugin::manifest(), Vec::new())
        .await
        .expect("re-install is a no-op upgrade");

    engine
        .execute(
            "INSERT INTO lix_file (path, data) VALUES ('/config.json', ?1)",
            &[Value::Blob(br#"{"a":1}"#.to_vec())],
        )
        .await
        .expect("insert");

    let entities = engine
        .execute(
            "SELECT COUNT(*) FROM lix_state WHERE schema_key = 'json_property'",
            &[],
        )
        .await
        .expect("count plugin entities");
    assert_eq!(integer(&entities.rows[0][0]), 1);
}

async fn property_change_count(engine: &lix_engine::Engine, entity_id: &str) -> i64 {
    let rows = engine
        .execute(
            "SELECT COUNT(*) FROM lix_internal_change \
             WHERE schema_key = 'json_property' AND entity_id = ?1",
            &[Value::Text(entity_id.to_string())],
        )
        .await
        .expect("count property changes");
    integer(&rows.rows[0][0])
}
