mod support;

use lix_engine::Value;
use support::{blob, integer, open_engine};

fn pseudo_random_bytes(len: usize, seed: u32) -> Vec<u8> {
    let mut state = seed;
    (0..len)
        .map(|_| {
            state = state.wrapping_mul(1664525).wrapping_add(1013904223);
            (state >> 24) as u8
        })
        .collect()
}

async fn chunk_count(engine: &lix_engine::Engine) -> i64 {
    let rows = engine
        .execute("SELECT COUNT(*) FROM lix_internal_binary_chunk_store", &[])
        .await
        .expect("count chunks");
    integer(&rows.rows[0][0])
}

async fn ref_count(engine: &lix_engine::Engine) -> i64 {
    let rows = engine
        .execute(
            "SELECT COUNT(*) FROM lix_internal_binary_file_version_ref",
            &[],
        )
        .await
        .expect("count refs");
    integer(&rows.rows[0][0])
}

#[tokio::test]
async fn identical_bytes_share_chunks_across_files() {
    let engine = open_engine().await;
    let payload = pseudo_random_bytes(200 * 1024, 7);

    engine
        .execute(
            "INSERT INTO lix_file (path, data) VALUES ('/a.bin', ?1)",
            &[Value::Blob(payload.clone())],
        )
        .await
        .expect("insert /a.bin");
    let after_first = chunk_count(&engine).await;
    assert!(after_first > 0);

    engine
        .execute(
            "INSERT INTO lix_file (path, data) VALUES ('/b.bin', ?1)",
            &[Value::Blob(payload.clone())],
        )
        .await
        .expect("insert /b.bin");

    // Same bytes, same blob: only a second reference appears.
    assert_eq!(chunk_count(&engine).await, after_first);
    assert_eq!(ref_count(&engine).await, 2);
}

#[tokio::test]
async fn rewriting_identical_bytes_adds_nothing() {
    let engine = open_engine().await;
    let payload = pseudo_random_bytes(64 * 1024, 3);

    engine
        .execute(
            "INSERT INTO lix_file (path, data) VALUES ('/a.bin', ?1)",
            &[Value::Blob(payload.clone())],
        )
        .await
        .expect("insert");
    let chunks_before = chunk_count(&engine).await;
    let changes_before = blob_ref_change_count(&engine).await;

    engine
        .execute(
            "UPDATE lix_file SET data = ?1 WHERE path = '/a.bin'",
            &[Value::Blob(payload)],
        )
        .await
        .expect("identical rewrite");

    assert_eq!(chunk_count(&engine).await, chunks_before);
    assert_eq!(blob_ref_change_count(&engine).await, changes_before);
}

#[tokio::test]
async fn small_edits_reuse_most_chunks() {
    let engine = open_engine().await;
    let original = pseudo_random_bytes(512 * 1024, 11);

    engine
        .execute(
            "INSERT INTO lix_file (path, data) VALUES ('/big.bin', ?1)",
            &[Value::Blob(original.clone())],
        )
        .await
        .expect("insert");
    let chunks_before = chunk_count(&engine).await;

    // Replace the first 4 KiB; content-defined boundaries keep the tail
    // chunks stable.
    let mut edited = original.clone();
    let replacement = pseudo_random_bytes(4096, 99);
    edited[..4096].copy_from_slice(&replacement);
    engine
        .execute(
            "UPDATE lix_file SET data = ?1 WHERE path = '/big.bin'",
            &[Value::Blob(edited.clone())],
        )
        .await
        .expect("edited rewrite");

    let chunks_after = chunk_count(&engine).await;
    assert!(chunks_after > chunks_before);
    assert!(
        chunks_after - chunks_before <= 3,
        "a 4 KiB edit should add at most a few chunks, added {}",
        chunks_after - chunks_before
    );

    let bytes = engine
        .execute("SELECT data FROM lix_file WHERE path = '/big.bin'", &[])
        .await
        .expect("read back");
    assert_eq!(blob(&bytes.rows[0][0]), edited);
}

#[tokio::test]
async fn compressible_payloads_store_compressed_chunks() {
    let engine = open_engine().await;
    let payload = vec![0x41u8; 128 * 1024];
    engine
        .execute(
            "INSERT INTO lix_file (path, data) VALUES ('/zeros.bin', ?1)",
            &[Value::Blob(payload.clone())],
        )
        .await
        .expect("insert");

    let rows = engine
        .execute(
            "SELECT codec, size_bytes FROM lix_internal_binary_chunk_store",
            &[],
        )
        .await
        .expect("inspect chunks");
    assert!(!rows.rows.is_empty());
    for row in &rows.rows {
        assert_eq!(support::text(&row[0]), "zstd");
    }

    let bytes = engine
        .execute("SELECT data FROM lix_file WHERE path = '/zeros.bin'", &[])
        .await
        .expect("read back");
    assert_eq!(blob(&bytes.rows[0][0]), payload);
}

async fn blob_ref_change_count(engine: &lix_engine::Engine) -> i64 {
    let rows = engine
        .execute(
            "SELECT COUNT(*) FROM lix_internal_change WHERE schema_key = 'lix_binary_blob_ref'",
            &[],
        )
        .await
        .expect("count blob ref changes");
    integer(&rows.rows[0][0])
}
