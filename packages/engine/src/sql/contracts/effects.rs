use serde_json::Value as JsonValue;

/// One semantic entity change reported by a plugin's `detect_changes` (or by
/// the binary fallback), fed through the tracked write flow.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct DetectedFileDomainChange {
    pub(crate) entity_id: String,
    pub(crate) schema_key: String,
    pub(crate) schema_version: String,
    pub(crate) snapshot_content: Option<JsonValue>,
}

/// In-transaction SQL follow-up emitted by the write flow, run before the
/// commit boundary in plan order.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum PostprocessAction {
    Sql { sql: String },
}

/// Runtime effect gated on a successful commit. Effects must be idempotent:
/// they re-run on retry and their failures are reported without touching the
/// committed state.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum PostCommitEffect {
    InvalidateSchemaCache,
    InvalidatePluginCaches,
    SetActiveVersion { version_id: String },
    RegisterSchemaKeys { keys: Vec<String> },
}

impl PostCommitEffect {
    pub(crate) fn effect_id(&self) -> String {
        match self {
            PostCommitEffect::InvalidateSchemaCache => "invalidate_schema_cache".to_string(),
            PostCommitEffect::InvalidatePluginCaches => "invalidate_plugin_caches".to_string(),
            PostCommitEffect::SetActiveVersion { version_id } => {
                format!("set_active_version:{version_id}")
            }
            PostCommitEffect::RegisterSchemaKeys { keys } => {
                format!("register_schema_keys:{}", keys.join(","))
            }
        }
    }
}
