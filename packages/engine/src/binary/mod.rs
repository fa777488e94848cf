use crate::exec::Executor;
use crate::hash::content_hash_hex;
use crate::schema_registry::{json_text_extract_expr, materialized_table_name, quote_ident};
use crate::storage::{
    BINARY_BLOB_MANIFEST_CHUNK_TABLE, BINARY_BLOB_MANIFEST_TABLE, BINARY_CHUNK_STORE_TABLE,
    BINARY_FILE_VERSION_REF_TABLE,
};
use crate::{LixError, SqlDialect, Value};

/// FastCDC parameters for the binary fallback: boundaries stay robust under
/// inserts and deletes at these sizes.
const FASTCDC_MIN_CHUNK_BYTES: u32 = 16 * 1024;
const FASTCDC_AVG_CHUNK_BYTES: u32 = 64 * 1024;
const FASTCDC_MAX_CHUNK_BYTES: u32 = 256 * 1024;

const CHUNK_CODEC_RAW: &str = "raw";
const CHUNK_CODEC_ZSTD: &str = "zstd";
const ZSTD_LEVEL: i32 = 3;

pub(crate) struct PersistedBlob {
    pub(crate) blob_hash: String,
    pub(crate) size_bytes: i64,
}

/// Persists file bytes into the content-addressed store: FastCDC chunks,
/// BLAKE3 dedup keys, zstd per chunk when it actually shrinks the payload,
/// one manifest per blob, and a `(file_id, version_id)` reference. Writing
/// bytes whose blob already exists only moves the reference.
pub(crate) async fn persist_blob(
    exec: &mut Executor<'_>,
    file_id: &str,
    version_id: &str,
    data: &[u8],
    now: &str,
) -> Result<PersistedBlob, LixError> {
    let blob_hash = content_hash_hex(data);
    let size_bytes = i64::try_from(data.len())
        .map_err(|_| LixError::validation("binary blob size exceeds supported range"))?;

    let exists = exec
        .execute_internal(
            &format!("SELECT 1 FROM {BINARY_BLOB_MANIFEST_TABLE} WHERE blob_hash = $1 LIMIT 1"),
            &[Value::Text(blob_hash.clone())],
        )
        .await?;

    if exists.rows.is_empty() {
        let chunk_ranges = chunk_ranges(data);
        let chunk_count = i64::try_from(chunk_ranges.len())
            .map_err(|_| LixError::validation("binary chunk count exceeds supported range"))?;

        exec.execute_internal(
            &format!(
                "INSERT INTO {BINARY_BLOB_MANIFEST_TABLE} \
                 (blob_hash, size_bytes, chunk_count, created_at) VALUES ($1, $2, $3, $4)"
            ),
            &[
                Value::Text(blob_hash.clone()),
                Value::Integer(size_bytes),
                Value::Integer(chunk_count),
                Value::Text(now.to_string()),
            ],
        )
        .await?;

        for (ordinal, (start, end)) in chunk_ranges.iter().copied().enumerate() {
            let chunk_data = &data[start..end];
            let chunk_hash = content_hash_hex(chunk_data);
            let chunk_size = (end - start) as i64;
            let (codec, payload) = encode_chunk(chunk_data)?;

            exec.execute_internal(
                &format!(
                    "INSERT INTO {BINARY_CHUNK_STORE_TABLE} \
                     (chunk_hash, codec, payload, size_bytes, created_at) \
                     VALUES ($1, $2, $3, $4, $5) \
                     ON CONFLICT (chunk_hash) DO NOTHING"
                ),
                &[
                    Value::Text(chunk_hash.clone()),
                    Value::Text(codec.to_string()),
                    Value::Blob(payload),
                    Value::Integer(chunk_size),
                    Value::Text(now.to_string()),
                ],
            )
            .await?;

            exec.execute_internal(
                &format!(
                    "INSERT INTO {BINARY_BLOB_MANIFEST_CHUNK_TABLE} \
                     (blob_hash, ordinal, chunk_hash, size_bytes) VALUES ($1, $2, $3, $4)"
                ),
                &[
                    Value::Text(blob_hash.clone()),
                    Value::Integer(ordinal as i64),
                    Value::Text(chunk_hash),
                    Value::Integer(chunk_size),
                ],
            )
            .await?;
        }
    }

    exec.execute_internal(
        &format!(
            "INSERT INTO {BINARY_FILE_VERSION_REF_TABLE} \
             (file_id, version_id, blob_hash, size_bytes, updated_at) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (file_id, version_id) DO UPDATE SET \
               blob_hash = excluded.blob_hash, \
               size_bytes = excluded.size_bytes, \
               updated_at = excluded.updated_at"
        ),
        &[
            Value::Text(file_id.to_string()),
            Value::Text(version_id.to_string()),
            Value::Text(blob_hash.clone()),
            Value::Integer(size_bytes),
            Value::Text(now.to_string()),
        ],
    )
    .await?;

    Ok(PersistedBlob {
        blob_hash,
        size_bytes,
    })
}

/// Reassembles a blob from its manifest, decoding each chunk per its codec
/// flag and verifying the total size.
pub(crate) async fn read_blob(
    exec: &mut Executor<'_>,
    blob_hash: &str,
) -> Result<Vec<u8>, LixError> {
    let manifest = exec
        .execute_internal(
            &format!(
                "SELECT size_bytes FROM {BINARY_BLOB_MANIFEST_TABLE} WHERE blob_hash = $1 LIMIT 1"
            ),
            &[Value::Text(blob_hash.to_string())],
        )
        .await?;
    let expected_size = manifest
        .rows
        .first()
        .and_then(|row| row.first())
        .and_then(Value::as_integer)
        .ok_or_else(|| {
            LixError::not_found(format!("binary blob '{blob_hash}' has no manifest"))
        })?;

    let chunks = exec
        .execute_internal(
            &format!(
                "SELECT cs.codec, cs.payload \
                 FROM {BINARY_BLOB_MANIFEST_CHUNK_TABLE} mc \
                 JOIN {BINARY_CHUNK_STORE_TABLE} cs ON cs.chunk_hash = mc.chunk_hash \
                 WHERE mc.blob_hash = $1 \
                 ORDER BY mc.ordinal"
            ),
            &[Value::Text(blob_hash.to_string())],
        )
        .await?;

    let mut data = Vec::with_capacity(expected_size.max(0) as usize);
    for row in &chunks.rows {
        let codec = row
            .first()
            .and_then(|value| value.as_text())
            .ok_or_else(|| LixError::io("chunk row missing codec"))?;
        let payload = match row.get(1) {
            Some(Value::Blob(bytes)) => bytes.as_slice(),
            _ => return Err(LixError::io("chunk row missing payload")),
        };
        match codec {
            CHUNK_CODEC_RAW => data.extend_from_slice(payload),
            CHUNK_CODEC_ZSTD => {
                let decoded = zstd::bulk::decompress(payload, FASTCDC_MAX_CHUNK_BYTES as usize)
                    .map_err(|error| {
                        LixError::io(format!("binary chunk decompression failed: {error}"))
                    })?;
                data.extend_from_slice(&decoded);
            }
            other => {
                return Err(LixError::io(format!("unknown binary chunk codec '{other}'")));
            }
        }
    }

    if data.len() as i64 != expected_size {
        return Err(LixError::io(format!(
            "binary blob '{blob_hash}' reassembled to {} bytes, manifest says {expected_size}",
            data.len()
        )));
    }
    Ok(data)
}

/// The blob currently referenced by `(file_id, version_id)`, if any.
pub(crate) async fn current_blob_hash(
    exec: &mut Executor<'_>,
    file_id: &str,
    version_id: &str,
) -> Result<Option<String>, LixError> {
    let result = exec
        .execute_internal(
            &format!(
                "SELECT blob_hash FROM {BINARY_FILE_VERSION_REF_TABLE} \
                 WHERE file_id = $1 AND version_id = $2 LIMIT 1"
            ),
            &[
                Value::Text(file_id.to_string()),
                Value::Text(version_id.to_string()),
            ],
        )
        .await?;
    Ok(result
        .rows
        .first()
        .and_then(|row| row.first())
        .and_then(|value| value.as_text())
        .map(|text| text.to_string()))
}

/// Strict referential garbage collection, child rows first. A blob survives
/// while any file-version reference or any live `lix_binary_blob_ref` state
/// row names it; chunks survive while any surviving manifest names them.
pub(crate) async fn garbage_collect(
    exec: &mut Executor<'_>,
    dialect: SqlDialect,
) -> Result<(), LixError> {
    let blob_ref_table = quote_ident(&materialized_table_name(
        crate::builtin_schema::BINARY_BLOB_REF_SCHEMA_KEY,
    ));
    let state_blob_hash = json_text_extract_expr(dialect, "blob_hash");

    let live_blobs = format!(
        "SELECT blob_hash FROM {BINARY_FILE_VERSION_REF_TABLE} \
         UNION SELECT {state_blob_hash} FROM {blob_ref_table} \
         WHERE is_tombstone = 0 AND snapshot_content IS NOT NULL"
    );

    exec.execute(
        &format!(
            "DELETE FROM {BINARY_BLOB_MANIFEST_CHUNK_TABLE} \
             WHERE blob_hash NOT IN ({live_blobs})"
        ),
        &[],
    )
    .await?;
    exec.execute(
        &format!(
            "DELETE FROM {BINARY_CHUNK_STORE_TABLE} \
             WHERE chunk_hash NOT IN \
               (SELECT chunk_hash FROM {BINARY_BLOB_MANIFEST_CHUNK_TABLE})"
        ),
        &[],
    )
    .await?;
    exec.execute(
        &format!(
            "DELETE FROM {BINARY_BLOB_MANIFEST_TABLE} \
             WHERE blob_hash NOT IN ({live_blobs})"
        ),
        &[],
    )
    .await?;
    Ok(())
}

fn chunk_ranges(data: &[u8]) -> Vec<(usize, usize)> {
    if data.is_empty() {
        return Vec::new();
    }

    fastcdc::v2020::FastCDC::new(
        data,
        FASTCDC_MIN_CHUNK_BYTES,
        FASTCDC_AVG_CHUNK_BYTES,
        FASTCDC_MAX_CHUNK_BYTES,
    )
    .map(|chunk| {
        let start = chunk.offset as usize;
        let end = start + (chunk.length as usize);
        (start, end)
    })
    .collect()
}

/// zstd only when it actually shrinks the chunk; the codec flag records the
/// decision per chunk.
fn encode_chunk(chunk_data: &[u8]) -> Result<(&'static str, Vec<u8>), LixError> {
    let compressed = zstd::bulk::compress(chunk_data, ZSTD_LEVEL)
        .map_err(|error| LixError::io(format!("binary chunk compression failed: {error}")))?;
    if compressed.len() < chunk_data.len() {
        Ok((CHUNK_CODEC_ZSTD, compressed))
    } else {
        Ok((CHUNK_CODEC_RAW, chunk_data.to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::{chunk_ranges, encode_chunk};

    #[test]
    fn chunk_ranges_cover_the_input_exactly() {
        let data = vec![0x5au8; 300 * 1024];
        let ranges = chunk_ranges(&data);
        assert!(!ranges.is_empty());
        assert_eq!(ranges.first().unwrap().0, 0);
        assert_eq!(ranges.last().unwrap().1, data.len());
        for window in ranges.windows(2) {
            assert_eq!(window[0].1, window[1].0);
        }
    }

    #[test]
    fn empty_input_produces_no_chunks() {
        assert!(chunk_ranges(&[]).is_empty());
    }

    #[test]
    fn compressible_chunks_use_zstd() {
        let data = vec![0u8; 64 * 1024];
        let (codec, payload) = encode_chunk(&data).expect("encode");
        assert_eq!(codec, "zstd");
        assert!(payload.len() < data.len());
    }

    #[test]
    fn incompressible_chunks_stay_raw() {
        // A short pseudo-random buffer that zstd cannot shrink.
        let mut state = 0x12345678u32;
        let data: Vec<u8> = (0..4096)
            .map(|_| {
                state = state.wrapping_mul(1664525).wrapping_add(1013904223);
                (state >> 24) as u8
            })
            .collect();
        let (codec, payload) = encode_chunk(&data).expect("encode");
        assert_eq!(codec, "raw");
        assert_eq!(payload, data);
    }
}
