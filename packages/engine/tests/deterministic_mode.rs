mod support;

use support::{
    insert_demo_item, open_deterministic_engine, open_engine, register_demo_schema, text,
};

#[tokio::test]
async fn seeded_engines_mint_identical_ids_for_identical_inputs() {
    let first = open_deterministic_engine().await;
    let second = open_deterministic_engine().await;

    register_demo_schema(&first).await;
    register_demo_schema(&second).await;
    insert_demo_item(&first, "e1", "x").await;
    insert_demo_item(&second, "e1", "x").await;

    let sql = "SELECT change_id, created_at FROM lix_state \
               WHERE schema_key = 'demo_item' AND entity_id = 'e1'";
    let first_rows = first.execute(sql, &[]).await.expect("first read");
    let second_rows = second.execute(sql, &[]).await.expect("second read");
    assert_eq!(first_rows.rows, second_rows.rows);
}

#[tokio::test]
async fn inline_functions_follow_the_seeded_sequence() {
    let engine = open_deterministic_engine().await;
    let rows = engine
        .execute("SELECT lix_uuid_v7(), lix_timestamp()", &[])
        .await
        .expect("inline functions");
    let uuid = text(&rows.rows[0][0]);
    let timestamp = text(&rows.rows[0][1]);
    assert!(uuid.starts_with("01920000-"));
    assert!(timestamp.starts_with("1970-01-01T00:00:"));
}

#[tokio::test]
async fn sequence_numbers_never_repeat_within_a_handle() {
    let engine = open_deterministic_engine().await;
    let first = engine
        .execute("SELECT lix_uuid_v7()", &[])
        .await
        .expect("first uuid");
    let second = engine
        .execute("SELECT lix_uuid_v7()", &[])
        .await
        .expect("second uuid");
    assert_ne!(text(&first.rows[0][0]), text(&second.rows[0][0]));
}

#[tokio::test]
async fn disabled_mode_mints_system_identifiers() {
    let engine = open_engine().await;
    let rows = engine
        .execute("SELECT lix_uuid_v7()", &[])
        .await
        .expect("system uuid");
    let uuid = text(&rows.rows[0][0]);
    assert_eq!(uuid.len(), 36);
    assert!(!uuid.starts_with("01920000-0000"));
}

#[tokio::test]
async fn timestamps_are_strictly_increasing_in_deterministic_mode() {
    let engine = open_deterministic_engine().await;
    register_demo_schema(&engine).await;
    insert_demo_item(&engine, "a", "1").await;
    insert_demo_item(&engine, "b", "2").await;

    let rows = engine
        .execute(
            "SELECT created_at FROM lix_state WHERE schema_key = 'demo_item' \
             ORDER BY entity_id",
            &[],
        )
        .await
        .expect("read timestamps");
    let first = text(&rows.rows[0][0]);
    let second = text(&rows.rows[1][0]);
    assert!(second > first);
}
