//! Names of the engine-owned internal tables. The DDL lives in `init`.

pub const CHANGE_TABLE: &str = "lix_internal_change";
pub const SNAPSHOT_TABLE: &str = "lix_internal_snapshot";
/// Sentinel snapshot referenced by tombstone changes.
pub const NO_CONTENT_SNAPSHOT_ID: &str = "no-content";

pub const COMMIT_GRAPH_TABLE: &str = "lix_internal_materialization_commit_graph";
pub const MATERIALIZATION_ROOT_TABLE: &str = "lix_internal_materialization_root";

pub const FILE_DATA_CACHE_TABLE: &str = "lix_internal_file_data_cache";
pub const FILE_PATH_CACHE_TABLE: &str = "lix_internal_file_path_cache";
pub const FILE_HISTORY_CACHE_TABLE: &str = "lix_internal_file_history_cache";

pub const PLUGIN_TABLE: &str = "lix_internal_plugin";

pub const BINARY_CHUNK_STORE_TABLE: &str = "lix_internal_binary_chunk_store";
pub const BINARY_BLOB_MANIFEST_TABLE: &str = "lix_internal_binary_blob_manifest";
pub const BINARY_BLOB_MANIFEST_CHUNK_TABLE: &str = "lix_internal_binary_blob_manifest_chunk";
pub const BINARY_FILE_VERSION_REF_TABLE: &str = "lix_internal_binary_file_version_ref";
