use std::collections::BTreeMap;

use serde_json::Value as JsonValue;

/// A resolved, validated domain mutation entering commit generation.
#[derive(Debug, Clone, PartialEq)]
pub struct DomainChangeInput {
    pub id: String,
    pub entity_id: String,
    pub schema_key: String,
    pub schema_version: String,
    pub file_id: String,
    pub plugin_key: String,
    pub snapshot_content: Option<JsonValue>,
    pub metadata: Option<JsonValue>,
    pub created_at: String,
    pub version_id: String,
}

/// Tip state of one version at the commit boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionContext {
    pub parent_commit_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerateCommitArgs {
    pub timestamp: String,
    pub active_accounts: Vec<String>,
    pub changes: Vec<DomainChangeInput>,
    pub versions: BTreeMap<String, VersionContext>,
}

/// One row appended to the change log.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeRow {
    pub id: String,
    pub entity_id: String,
    pub schema_key: String,
    pub schema_version: String,
    pub file_id: String,
    pub plugin_key: String,
    pub snapshot_content: Option<JsonValue>,
    pub metadata: Option<JsonValue>,
    pub created_at: String,
}

/// One upsert into a per-schema materialized table.
#[derive(Debug, Clone, PartialEq)]
pub struct MaterializedRow {
    pub change: ChangeRow,
    pub version_id: String,
    pub commit_id: String,
    pub is_tombstone: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerateCommitResult {
    pub changes: Vec<ChangeRow>,
    pub materialized: Vec<MaterializedRow>,
    /// Commit id per committed version, for callers that need the new tips.
    pub commit_ids: BTreeMap<String, String>,
}
