mod effects;
mod errors;

pub(crate) use effects::{DetectedFileDomainChange, PostCommitEffect, PostprocessAction};
pub(crate) use errors::{ExecutorError, PlannerError};

use serde_json::Value as JsonValue;

/// How a read scopes versions: the cached active version, or an explicit
/// list of version ids. Explicit scope always originates from equality
/// predicates, never from string inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum VersionScope {
    Active,
    Versions(Vec<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MutationOperation {
    Insert,
    Update,
    Delete,
}

/// Root scope of a history read, used to drive timeline materialization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum HistoryRootScope {
    Commit(String),
    ActiveVersionTip,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct HistoryRequirements {
    pub(crate) root_scope: Option<HistoryRootScope>,
    pub(crate) max_depth: Option<i64>,
    pub(crate) refresh_file_history: bool,
    /// File scope of a file-history read; empty means every file in the
    /// timeline.
    pub(crate) file_ids: Vec<String>,
}

impl HistoryRequirements {
    pub(crate) fn is_empty(&self) -> bool {
        self.root_scope.is_none() && !self.refresh_file_history
    }
}

/// Which file bytes must be present in the file-data cache before the
/// statement runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FileDataRequirement {
    pub(crate) version: VersionScope,
    pub(crate) file_id_equals: Option<String>,
    pub(crate) path_equals: Option<String>,
}

/// A statement after bind-once: dialect-native placeholders and the exact
/// host values they consume, in backend order.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PreparedStatement {
    pub(crate) sql: String,
    pub(crate) params: Vec<crate::Value>,
}

#[derive(Debug, Clone)]
pub(crate) struct ReadPlan {
    /// Canonical lowered SQL; placeholders are normalized `?N` tokens.
    pub(crate) sql: String,
    pub(crate) history: HistoryRequirements,
    pub(crate) file_data: Option<FileDataRequirement>,
}

#[derive(Debug, Clone)]
pub(crate) struct PassthroughPlan {
    pub(crate) sql: String,
    pub(crate) is_query: bool,
}

/// One tracked or untracked row extracted from an INSERT against a state
/// surface. All host placeholders were resolved at extraction time.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct StateInsertRow {
    pub(crate) entity_id: Option<String>,
    pub(crate) schema_key: String,
    pub(crate) schema_version: Option<String>,
    pub(crate) file_id: Option<String>,
    pub(crate) version_id: Option<String>,
    pub(crate) plugin_key: Option<String>,
    pub(crate) snapshot_content: Option<JsonValue>,
    pub(crate) metadata: Option<JsonValue>,
    pub(crate) untracked: bool,
}

/// UPDATE/DELETE against a state surface: the filter is a rendered WHERE
/// clause over the effective-state projection with every placeholder already
/// substituted, so expansion queries carry no parameters.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct StateMutation {
    pub(crate) operation: MutationOperation,
    pub(crate) scope: VersionScope,
    pub(crate) rows: Vec<StateInsertRow>,
    pub(crate) filter: Option<String>,
    pub(crate) assignments: Vec<(String, JsonValue)>,
    pub(crate) untracked_filter: Option<bool>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct FileInsertRow {
    pub(crate) id: Option<String>,
    pub(crate) path: String,
    pub(crate) data: Option<Vec<u8>>,
    pub(crate) metadata: Option<JsonValue>,
    pub(crate) hidden: bool,
    pub(crate) version_id: Option<String>,
    pub(crate) untracked: bool,
}

/// Filters accepted on filesystem writes. Richer predicates are rejected at
/// plan time rather than silently mis-scoped.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct FileFilter {
    pub(crate) id_in: Option<Vec<String>>,
    pub(crate) path_in: Option<Vec<String>>,
}

impl FileFilter {
    pub(crate) fn is_empty(&self) -> bool {
        self.id_in.is_none() && self.path_in.is_none()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum FileMutation {
    Insert {
        rows: Vec<FileInsertRow>,
    },
    Update {
        scope: VersionScope,
        filter: FileFilter,
        set_path: Option<String>,
        set_data: Option<Vec<u8>>,
        set_metadata: Option<Option<JsonValue>>,
        set_hidden: Option<bool>,
    },
    Delete {
        scope: VersionScope,
        filter: FileFilter,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum DirectoryMutation {
    Insert {
        rows: Vec<DirectoryInsertRow>,
    },
    Delete {
        scope: VersionScope,
        filter: FileFilter,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct DirectoryInsertRow {
    pub(crate) id: Option<String>,
    pub(crate) path: String,
    pub(crate) version_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct VersionInsertRow {
    pub(crate) id: Option<String>,
    pub(crate) name: Option<String>,
    pub(crate) inherits_from_version_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum MutationPlan {
    State(StateMutation),
    File(FileMutation),
    Directory(DirectoryMutation),
    VersionInsert { rows: Vec<VersionInsertRow> },
    ActiveVersionUpdate { version_id: String },
}

#[derive(Debug, Clone)]
pub(crate) enum StatementPlan {
    Read(ReadPlan),
    Passthrough(PassthroughPlan),
    Mutation(MutationPlan),
}

impl StatementPlan {
    /// Canonical text entering the plan fingerprint.
    pub(crate) fn fingerprint_text(&self) -> String {
        match self {
            StatementPlan::Read(plan) => format!("read:{}", plan.sql),
            StatementPlan::Passthrough(plan) => format!("passthrough:{}", plan.sql),
            StatementPlan::Mutation(plan) => format!("mutation:{plan:?}"),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct ExecutionPlan {
    pub(crate) statements: Vec<StatementPlan>,
    pub(crate) fingerprint: String,
    pub(crate) requires_transaction: bool,
}
