use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, RwLock};

use serde_json::{json, Value as JsonValue};

use crate::builtin_schema::{
    builtin_schema_keys, builtin_schema_version, ACCOUNT_SCHEMA_KEY, ACTIVE_ACCOUNT_SCHEMA_KEY,
    ACTIVE_VERSION_SCHEMA_KEY, BUILTIN_FILE_ID, BUILTIN_PLUGIN_KEY, KEY_VALUE_SCHEMA_KEY,
    STORED_SCHEMA_KEY, VERSION_DESCRIPTOR_SCHEMA_KEY, VERSION_TIP_SCHEMA_KEY,
};
use crate::cel::CelEvaluator;
use crate::commit::DomainChangeInput;
use crate::deterministic::{
    DeterministicSettings, RuntimeFunctionProvider, DETERMINISTIC_MODE_KEY, SEQUENCE_KEY,
};
use crate::exec::Executor;
use crate::filesystem::data::ensure_file_data;
use crate::filesystem::writes::{apply_directory_mutation, apply_file_mutation};
use crate::functions::SharedFunctionProvider;
use crate::history::{ensure_timeline, refresh_file_history, MaintenanceLocks};
use crate::init::init_backend;
use crate::plugin::{NoopPluginHost, PluginHost, PluginManifest, PluginRegistry};
use crate::schema::{parse_stored_schema_snapshot, SchemaCache, StoredSchema};
use crate::schema_registry::{
    materialized_table_name, quote_ident, rebuild_vtable_view_sql, register_schema_sql_statements,
};
use crate::sql::contracts::{
    ExecutionPlan, ExecutorError, MutationPlan, PostCommitEffect, PostprocessAction,
    StatementPlan,
};
use crate::sql::params::bind_sql;
use crate::sql::parse::{inline_runtime_functions, normalize_placeholders, parse_sql_statements};
use crate::sql::planner::{plan_statements, CatalogSnapshot};
use crate::schema_registry::UNTRACKED_TABLE;
use crate::version::{
    active_version_snapshot, parse_active_version_snapshot, version_descriptor_snapshot,
    version_tip_snapshot, ACTIVE_VERSION_ENTITY_ID, ACTIVE_VERSION_STORAGE_VERSION_ID,
    GLOBAL_VERSION_ID, MAIN_VERSION_ID, MAIN_VERSION_NAME,
};
use crate::vtable_write::{
    apply_active_version_update, apply_state_mutation, apply_version_insert, commit_pending,
    PendingCommit, WriteContext,
};
use crate::{
    LixBackend, LixError, LixTransaction, QueryResult, SnapshotChunkWriter, Value,
};

const EPOCH_TIMESTAMP: &str = "1970-01-01T00:00:00.000Z";
const ANONYMOUS_ACCOUNT_NAME: &str = "anonymous";

/// One engine handle: serializes statements, owns the per-handle caches, and
/// drives parse → plan → bind → maintain → execute → postprocess → effects.
pub struct Engine {
    backend: Box<dyn LixBackend + Send + Sync>,
    plugins: PluginRegistry,
    cel: CelEvaluator,
    schema_cache: SchemaCache,
    maintenance_locks: MaintenanceLocks,
    deterministic: DeterministicSettings,
    next_sequence: Mutex<i64>,
    active_version_id: RwLock<String>,
    active_account_id: RwLock<Option<String>>,
    registered_schema_keys: RwLock<BTreeSet<String>>,
}

impl Engine {
    pub(crate) async fn open(
        backend: Box<dyn LixBackend + Send + Sync>,
        plugin_host: Option<Arc<dyn PluginHost>>,
        boot_key_values: Vec<(String, JsonValue)>,
    ) -> Result<Engine, LixError> {
        init_backend(backend.as_ref()).await?;

        let mut engine = Engine {
            plugins: PluginRegistry::new(
                plugin_host.unwrap_or_else(|| Arc::new(NoopPluginHost)),
            ),
            cel: CelEvaluator::new(),
            schema_cache: SchemaCache::new(),
            maintenance_locks: MaintenanceLocks::default(),
            deterministic: DeterministicSettings::disabled(),
            next_sequence: Mutex::new(0),
            active_version_id: RwLock::new(MAIN_VERSION_ID.to_string()),
            active_account_id: RwLock::new(None),
            registered_schema_keys: RwLock::new(
                builtin_schema_keys().map(|key| key.to_string()).collect(),
            ),
            backend,
        };

        engine.write_boot_key_values(&boot_key_values).await?;
        engine.load_deterministic_state().await?;
        engine.ensure_seeded().await?;
        engine.load_active_state().await?;
        engine.reload_registered_schemas().await?;
        Ok(engine)
    }

    pub fn active_version_id(&self) -> String {
        self.active_version_id.read().unwrap().clone()
    }

    pub async fn execute(&self, sql: &str, params: &[Value]) -> Result<QueryResult, LixError> {
        let plan = self.plan(sql, params)?;
        let provider = self.function_provider();

        if !plan.requires_transaction {
            let mut exec = Executor::Backend(self.backend.as_ref());
            let mut effects = Vec::new();
            let mut active = self.active_version_id();
            let result = self
                .run_plan(&mut exec, &plan, params, &provider, &mut effects, &mut active)
                .await
                .map_err(|error| error.with_plan_fingerprint(plan.fingerprint.clone()))?;
            let _reported = self.flush_effects(effects);
            self.persist_sequence(&provider).await;
            return Ok(result);
        }

        let transaction = self.backend.begin_transaction().await?;
        let mut transaction = scopeguard(transaction);
        let mut effects = Vec::new();
        let mut active = self.active_version_id();

        let outcome = {
            let mut exec = Executor::Transaction(transaction.inner.as_deref_mut().unwrap());
            self.run_plan(&mut exec, &plan, params, &provider, &mut effects, &mut active)
                .await
        };

        match outcome {
            Ok(result) => {
                transaction.take().commit().await?;
                let _reported = self.flush_effects(effects);
                self.persist_sequence(&provider).await;
                Ok(result)
            }
            Err(error) => {
                let _ = transaction.take().rollback().await;
                Err(error.with_plan_fingerprint(plan.fingerprint.clone()))
            }
        }
    }

    pub async fn begin_transaction(&self) -> Result<EngineTransaction<'_>, LixError> {
        let transaction = self.backend.begin_transaction().await?;
        Ok(EngineTransaction {
            engine: self,
            transaction: Some(transaction),
            effects: Vec::new(),
            active_version_id: self.active_version_id(),
        })
    }

    pub async fn install_plugin(
        &self,
        manifest: PluginManifest,
        code: Vec<u8>,
    ) -> Result<(), LixError> {
        let provider = self.function_provider();
        let installed_at = provider.timestamp();
        let mut exec = Executor::Backend(self.backend.as_ref());
        self.plugins
            .install(&mut exec, &manifest, &code, &installed_at)
            .await?;
        self.apply_effect(&PostCommitEffect::InvalidatePluginCaches)?;
        self.persist_sequence(&provider).await;
        Ok(())
    }

    pub async fn export_snapshot(
        &self,
        writer: &mut dyn SnapshotChunkWriter,
    ) -> Result<(), LixError> {
        self.backend.export_snapshot(writer).await
    }

    /// Strict referential garbage collection of the binary CAS: blobs and
    /// chunks survive while any file-version reference or live blob-ref
    /// state row names them. Runs in its own transaction.
    pub async fn garbage_collect_binary(&self) -> Result<(), LixError> {
        let transaction = self.backend.begin_transaction().await?;
        let mut transaction = scopeguard(transaction);
        let outcome = {
            let mut exec = Executor::Transaction(transaction.inner.as_deref_mut().unwrap());
            crate::binary::garbage_collect(&mut exec, self.backend.dialect()).await
        };
        match outcome {
            Ok(()) => transaction.take().commit().await,
            Err(error) => {
                let _ = transaction.take().rollback().await;
                Err(error)
            }
        }
    }

    fn plan(&self, sql: &str, params: &[Value]) -> Result<ExecutionPlan, LixError> {
        let mut statements = parse_sql_statements(sql)?;
        normalize_placeholders(&mut statements)?;
        {
            let mut provider = RuntimeFunctionProvider::new(
                self.deterministic,
                *self.next_sequence.lock().unwrap(),
            );
            inline_runtime_functions(&mut statements, &mut provider);
            *self.next_sequence.lock().unwrap() = provider.next_sequence();
        }
        let catalog = self.catalog_snapshot();
        plan_statements(&statements, params, &catalog).map_err(LixError::from)
    }

    fn catalog_snapshot(&self) -> CatalogSnapshot {
        CatalogSnapshot {
            dialect: self.backend.dialect(),
            registered_schema_keys: self.registered_schema_keys.read().unwrap().clone(),
        }
    }

    fn function_provider(&self) -> SharedFunctionProvider<RuntimeFunctionProvider> {
        SharedFunctionProvider::new(RuntimeFunctionProvider::new(
            self.deterministic,
            *self.next_sequence.lock().unwrap(),
        ))
    }

    fn write_context(
        &self,
        provider: &SharedFunctionProvider<RuntimeFunctionProvider>,
        active_version_id: &str,
    ) -> WriteContext<'_> {
        WriteContext {
            schema_cache: &self.schema_cache,
            cel: &self.cel,
            functions: provider.clone(),
            catalog: self.catalog_snapshot(),
            active_version_id: active_version_id.to_string(),
            active_account_id: self.active_account_id.read().unwrap().clone(),
        }
    }

    /// Executes a plan: maintenance before reads, typed mutation application,
    /// commit generation at the end. `postprocess_sql` runs in-transaction;
    /// runtime effects queue for the commit boundary.
    async fn run_plan(
        &self,
        exec: &mut Executor<'_>,
        plan: &ExecutionPlan,
        params: &[Value],
        provider: &SharedFunctionProvider<RuntimeFunctionProvider>,
        effects: &mut Vec<PostCommitEffect>,
        active_version_id: &mut String,
    ) -> Result<QueryResult, LixError> {
        let mut pending = PendingCommit::default();
        let mut result = QueryResult::empty();
        let mut catalog_keys = self.registered_schema_keys.read().unwrap().clone();

        for statement in &plan.statements {
            match statement {
                StatementPlan::Read(read) => {
                    let ctx = self.write_context(provider, active_version_id);
                    if let Some(root_scope) = &read.history.root_scope {
                        let root = ensure_timeline(
                            exec,
                            &ctx,
                            &self.maintenance_locks,
                            root_scope,
                            read.history.max_depth,
                        )
                        .await?;
                        if read.history.refresh_file_history {
                            if let Some(root) = root {
                                refresh_file_history(
                                    exec,
                                    &ctx,
                                    &self.plugins,
                                    &root,
                                    read.history.max_depth,
                                    &read.history.file_ids,
                                )
                                .await?;
                            }
                        }
                    }
                    if let Some(requirement) = &read.file_data {
                        ensure_file_data(exec, &ctx, &self.plugins, requirement).await?;
                    }
                    let prepared = bind_sql(&read.sql, params, exec.dialect())?.into_prepared();
                    result = exec.execute(&prepared.sql, &prepared.params).await?;
                }
                StatementPlan::Passthrough(passthrough) => {
                    let prepared =
                        bind_sql(&passthrough.sql, params, exec.dialect())?.into_prepared();
                    result = exec.execute(&prepared.sql, &prepared.params).await?;
                }
                StatementPlan::Mutation(mutation) => {
                    let ctx = self.write_context(provider, active_version_id);
                    let affected = match mutation {
                        MutationPlan::State(state) => {
                            apply_state_mutation(exec, &ctx, state, &mut pending).await?
                        }
                        MutationPlan::File(file) => {
                            apply_file_mutation(exec, &ctx, &self.plugins, file, &mut pending)
                                .await?
                        }
                        MutationPlan::Directory(directory) => {
                            apply_directory_mutation(exec, &ctx, directory, &mut pending).await?
                        }
                        MutationPlan::VersionInsert { rows } => {
                            apply_version_insert(exec, &ctx, rows, &mut pending).await?
                        }
                        MutationPlan::ActiveVersionUpdate { version_id } => {
                            let affected =
                                apply_active_version_update(exec, &ctx, version_id).await?;
                            *active_version_id = version_id.clone();
                            effects.push(PostCommitEffect::SetActiveVersion {
                                version_id: version_id.clone(),
                            });
                            affected
                        }
                    };
                    result = QueryResult {
                        columns: Vec::new(),
                        rows: Vec::new(),
                        affected,
                    };

                    if !pending.registered_schemas.is_empty() {
                        let schemas = std::mem::take(&mut pending.registered_schemas);
                        self.register_schemas(exec, &schemas, &mut catalog_keys).await?;
                        effects.push(PostCommitEffect::RegisterSchemaKeys {
                            keys: schemas.iter().map(|schema| schema.key.clone()).collect(),
                        });
                        effects.push(PostCommitEffect::InvalidateSchemaCache);
                    }
                }
            }
        }

        commit_pending(exec, &self.write_context(provider, active_version_id), pending).await?;
        Ok(result)
    }

    /// Creates the materialized table for each newly stored schema and
    /// rebuilds the vtable view: in-transaction SQL follow-ups, run before
    /// the commit boundary in plan order.
    async fn register_schemas(
        &self,
        exec: &mut Executor<'_>,
        schemas: &[StoredSchema],
        catalog_keys: &mut BTreeSet<String>,
    ) -> Result<(), LixError> {
        let mut actions = Vec::new();
        for schema in schemas {
            for sql in register_schema_sql_statements(schema, exec.dialect())? {
                actions.push(PostprocessAction::Sql { sql });
            }
            catalog_keys.insert(schema.key.clone());
            self.schema_cache.remember(schema.clone());
        }
        let keys: Vec<String> = catalog_keys.iter().cloned().collect();
        for sql in rebuild_vtable_view_sql(&keys) {
            actions.push(PostprocessAction::Sql { sql });
        }
        for action in actions {
            match action {
                PostprocessAction::Sql { sql } => {
                    exec.execute(&sql, &[]).await?;
                }
            }
        }
        Ok(())
    }

    /// Commit-gated runtime effects, applied serially in enqueue order.
    /// Effects are idempotent; a failure is reported on the error channel
    /// without invalidating the committed transaction.
    fn flush_effects(&self, effects: Vec<PostCommitEffect>) -> Vec<LixError> {
        let mut reported = Vec::new();
        for effect in effects {
            if let Err(error) = self.apply_effect(&effect) {
                reported.push(
                    ExecutorError::PostCommit {
                        effect_id: effect.effect_id(),
                        error,
                    }
                    .into(),
                );
            }
        }
        reported
    }

    fn apply_effect(&self, effect: &PostCommitEffect) -> Result<(), LixError> {
        match effect {
            PostCommitEffect::InvalidateSchemaCache => self.schema_cache.invalidate(),
            PostCommitEffect::InvalidatePluginCaches => self.plugins.invalidate(),
            PostCommitEffect::SetActiveVersion { version_id } => {
                *self.active_version_id.write().unwrap() = version_id.clone();
            }
            PostCommitEffect::RegisterSchemaKeys { keys } => {
                let mut registered = self.registered_schema_keys.write().unwrap();
                for key in keys {
                    registered.insert(key.clone());
                }
            }
        }
        Ok(())
    }

    async fn persist_sequence(&self, provider: &SharedFunctionProvider<RuntimeFunctionProvider>) {
        let highest = provider.sequence_snapshot();
        {
            let mut next = self.next_sequence.lock().unwrap();
            if highest > *next {
                *next = highest;
            }
        }
        if !self.deterministic.enabled {
            return;
        }
        let snapshot = json!({ "key": SEQUENCE_KEY, "value": highest });
        let _ = self
            .upsert_untracked_key_value(SEQUENCE_KEY, &snapshot)
            .await;
    }

    async fn write_boot_key_values(
        &self,
        key_values: &[(String, JsonValue)],
    ) -> Result<(), LixError> {
        for (key, value) in key_values {
            let snapshot = json!({ "key": key, "value": value });
            self.upsert_untracked_key_value(key, &snapshot).await?;
        }
        Ok(())
    }

    async fn upsert_untracked_key_value(
        &self,
        key: &str,
        snapshot: &JsonValue,
    ) -> Result<(), LixError> {
        let mut exec = Executor::Backend(self.backend.as_ref());
        exec.execute_internal(
            &format!(
                "INSERT INTO {UNTRACKED_TABLE} \
                 (entity_id, schema_key, file_id, version_id, plugin_key, schema_version, \
                  snapshot_content, created_at, updated_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
                 ON CONFLICT (entity_id, schema_key, file_id, version_id) DO UPDATE SET \
                   snapshot_content = excluded.snapshot_content, \
                   updated_at = excluded.updated_at"
            ),
            &[
                Value::Text(key.to_string()),
                Value::Text(KEY_VALUE_SCHEMA_KEY.to_string()),
                Value::Text(BUILTIN_FILE_ID.to_string()),
                Value::Text(GLOBAL_VERSION_ID.to_string()),
                Value::Text(BUILTIN_PLUGIN_KEY.to_string()),
                Value::Text(
                    builtin_schema_version(KEY_VALUE_SCHEMA_KEY)
                        .unwrap_or("1")
                        .to_string(),
                ),
                Value::Text(snapshot.to_string()),
                Value::Text(EPOCH_TIMESTAMP.to_string()),
                Value::Text(EPOCH_TIMESTAMP.to_string()),
            ],
        )
        .await?;
        Ok(())
    }

    async fn load_untracked_key_value(&self, key: &str) -> Result<Option<JsonValue>, LixError> {
        let mut exec = Executor::Backend(self.backend.as_ref());
        let result = exec
            .execute_internal(
                &format!(
                    "SELECT snapshot_content FROM {UNTRACKED_TABLE} \
                     WHERE entity_id = $1 AND schema_key = $2 AND version_id = $3 \
                       AND snapshot_content IS NOT NULL \
                     LIMIT 1"
                ),
                &[
                    Value::Text(key.to_string()),
                    Value::Text(KEY_VALUE_SCHEMA_KEY.to_string()),
                    Value::Text(GLOBAL_VERSION_ID.to_string()),
                ],
            )
            .await?;
        let Some(raw) = result
            .rows
            .first()
            .and_then(|row| row.first())
            .and_then(|value| value.as_text())
        else {
            return Ok(None);
        };
        let parsed: JsonValue = serde_json::from_str(raw).map_err(|error| {
            LixError::validation(format!("key-value snapshot invalid JSON: {error}"))
        })?;
        Ok(parsed.get("value").cloned())
    }

    async fn load_deterministic_state(&mut self) -> Result<(), LixError> {
        if let Some(mode) = self.load_untracked_key_value(DETERMINISTIC_MODE_KEY).await? {
            self.deterministic = DeterministicSettings::from_payload(&mode);
        }
        if let Some(sequence) = self.load_untracked_key_value(SEQUENCE_KEY).await? {
            let next = match &sequence {
                JsonValue::Number(number) => number.as_i64().map(|highest| highest + 1),
                JsonValue::String(text) => text.parse::<i64>().ok().map(|highest| highest + 1),
                _ => None,
            };
            if let Some(next) = next {
                *self.next_sequence.lock().unwrap() = next;
            }
        }
        Ok(())
    }

    /// First-open seed: builtin stored schemas, the global and main version
    /// descriptors, the anonymous account, and the active singletons, all
    /// captured in genesis commits.
    async fn ensure_seeded(&self) -> Result<(), LixError> {
        let descriptor_table = quote_ident(&materialized_table_name(
            VERSION_DESCRIPTOR_SCHEMA_KEY,
        ));
        let mut exec = Executor::Backend(self.backend.as_ref());
        let existing = exec
            .execute_internal(
                &format!(
                    "SELECT 1 FROM {descriptor_table} \
                     WHERE entity_id = $1 AND version_id = $2 LIMIT 1"
                ),
                &[
                    Value::Text(GLOBAL_VERSION_ID.to_string()),
                    Value::Text(GLOBAL_VERSION_ID.to_string()),
                ],
            )
            .await?;
        if !existing.rows.is_empty() {
            return Ok(());
        }

        let provider = self.function_provider();
        let transaction = self.backend.begin_transaction().await?;
        let mut transaction = scopeguard(transaction);
        let seed_result = {
            let mut exec = Executor::Transaction(transaction.inner.as_deref_mut().unwrap());
            self.seed_in_transaction(&mut exec, &provider).await
        };
        match seed_result {
            Ok(()) => {
                transaction.take().commit().await?;
                self.persist_sequence(&provider).await;
                Ok(())
            }
            Err(error) => {
                let _ = transaction.take().rollback().await;
                Err(error)
            }
        }
    }

    async fn seed_in_transaction(
        &self,
        exec: &mut Executor<'_>,
        provider: &SharedFunctionProvider<RuntimeFunctionProvider>,
    ) -> Result<(), LixError> {
        let ctx = self.write_context(provider, GLOBAL_VERSION_ID);
        let now = ctx.functions.timestamp();
        let mut pending = PendingCommit::default();

        for schema_key in builtin_schema_keys() {
            let definition = crate::builtin_schema::builtin_schema_definition(schema_key)
                .expect("builtin schema keys enumerate existing definitions");
            let version = builtin_schema_version(schema_key).unwrap_or("1");
            pending.domain_changes.push(DomainChangeInput {
                id: ctx.functions.uuid_v7(),
                entity_id: format!("{schema_key}~{version}"),
                schema_key: STORED_SCHEMA_KEY.to_string(),
                schema_version: builtin_schema_version(STORED_SCHEMA_KEY)
                    .unwrap_or("1")
                    .to_string(),
                file_id: BUILTIN_FILE_ID.to_string(),
                plugin_key: BUILTIN_PLUGIN_KEY.to_string(),
                snapshot_content: Some(json!({ "value": definition })),
                metadata: None,
                created_at: now.clone(),
                version_id: GLOBAL_VERSION_ID.to_string(),
            });
        }

        pending.domain_changes.push(DomainChangeInput {
            id: ctx.functions.uuid_v7(),
            entity_id: GLOBAL_VERSION_ID.to_string(),
            schema_key: VERSION_DESCRIPTOR_SCHEMA_KEY.to_string(),
            schema_version: builtin_schema_version(VERSION_DESCRIPTOR_SCHEMA_KEY)
                .unwrap_or("1")
                .to_string(),
            file_id: BUILTIN_FILE_ID.to_string(),
            plugin_key: BUILTIN_PLUGIN_KEY.to_string(),
            snapshot_content: Some(version_descriptor_snapshot(
                GLOBAL_VERSION_ID,
                GLOBAL_VERSION_ID,
                None,
            )),
            metadata: None,
            created_at: now.clone(),
            version_id: GLOBAL_VERSION_ID.to_string(),
        });
        pending.domain_changes.push(DomainChangeInput {
            id: ctx.functions.uuid_v7(),
            entity_id: MAIN_VERSION_ID.to_string(),
            schema_key: VERSION_DESCRIPTOR_SCHEMA_KEY.to_string(),
            schema_version: builtin_schema_version(VERSION_DESCRIPTOR_SCHEMA_KEY)
                .unwrap_or("1")
                .to_string(),
            file_id: BUILTIN_FILE_ID.to_string(),
            plugin_key: BUILTIN_PLUGIN_KEY.to_string(),
            snapshot_content: Some(version_descriptor_snapshot(
                MAIN_VERSION_ID,
                MAIN_VERSION_NAME,
                Some(GLOBAL_VERSION_ID),
            )),
            metadata: None,
            created_at: now.clone(),
            version_id: GLOBAL_VERSION_ID.to_string(),
        });

        let account_id = ctx.functions.uuid_v7();
        pending.domain_changes.push(DomainChangeInput {
            id: ctx.functions.uuid_v7(),
            entity_id: account_id.clone(),
            schema_key: ACCOUNT_SCHEMA_KEY.to_string(),
            schema_version: builtin_schema_version(ACCOUNT_SCHEMA_KEY)
                .unwrap_or("1")
                .to_string(),
            file_id: BUILTIN_FILE_ID.to_string(),
            plugin_key: BUILTIN_PLUGIN_KEY.to_string(),
            snapshot_content: Some(json!({ "id": account_id, "name": ANONYMOUS_ACCOUNT_NAME })),
            metadata: None,
            created_at: now.clone(),
            version_id: GLOBAL_VERSION_ID.to_string(),
        });

        let commit_ids = commit_pending(exec, &ctx, pending).await?;
        let genesis_commit = commit_ids
            .get(GLOBAL_VERSION_ID)
            .cloned()
            .ok_or_else(|| LixError::planner_invariant("seed produced no genesis commit"))?;

        // Main starts at the genesis commit; seeding its tip is itself a
        // commit on the global timeline.
        let mut tip_pending = PendingCommit::default();
        tip_pending.domain_changes.push(DomainChangeInput {
            id: ctx.functions.uuid_v7(),
            entity_id: MAIN_VERSION_ID.to_string(),
            schema_key: VERSION_TIP_SCHEMA_KEY.to_string(),
            schema_version: builtin_schema_version(VERSION_TIP_SCHEMA_KEY)
                .unwrap_or("1")
                .to_string(),
            file_id: BUILTIN_FILE_ID.to_string(),
            plugin_key: BUILTIN_PLUGIN_KEY.to_string(),
            snapshot_content: Some(version_tip_snapshot(MAIN_VERSION_ID, &genesis_commit)),
            metadata: None,
            created_at: ctx.functions.timestamp(),
            version_id: GLOBAL_VERSION_ID.to_string(),
        });
        commit_pending(exec, &ctx, tip_pending).await?;

        crate::vtable_write::upsert_untracked_row(
            exec,
            &ctx,
            ACTIVE_VERSION_ENTITY_ID,
            ACTIVE_VERSION_SCHEMA_KEY,
            builtin_schema_version(ACTIVE_VERSION_SCHEMA_KEY).unwrap_or("1"),
            BUILTIN_FILE_ID,
            ACTIVE_VERSION_STORAGE_VERSION_ID,
            BUILTIN_PLUGIN_KEY,
            Some(&active_version_snapshot(MAIN_VERSION_ID)),
        )
        .await?;
        crate::vtable_write::upsert_untracked_row(
            exec,
            &ctx,
            ACTIVE_VERSION_ENTITY_ID,
            ACTIVE_ACCOUNT_SCHEMA_KEY,
            builtin_schema_version(ACTIVE_ACCOUNT_SCHEMA_KEY).unwrap_or("1"),
            BUILTIN_FILE_ID,
            ACTIVE_VERSION_STORAGE_VERSION_ID,
            BUILTIN_PLUGIN_KEY,
            Some(&json!({ "account_id": account_id })),
        )
        .await?;

        Ok(())
    }

    async fn load_active_state(&self) -> Result<(), LixError> {
        let mut exec = Executor::Backend(self.backend.as_ref());
        let result = exec
            .execute_internal(
                &format!(
                    "SELECT snapshot_content FROM {UNTRACKED_TABLE} \
                     WHERE entity_id = $1 AND schema_key = $2 AND version_id = $3 \
                       AND snapshot_content IS NOT NULL \
                     ORDER BY updated_at DESC LIMIT 1"
                ),
                &[
                    Value::Text(ACTIVE_VERSION_ENTITY_ID.to_string()),
                    Value::Text(ACTIVE_VERSION_SCHEMA_KEY.to_string()),
                    Value::Text(ACTIVE_VERSION_STORAGE_VERSION_ID.to_string()),
                ],
            )
            .await?;
        if let Some(raw) = result
            .rows
            .first()
            .and_then(|row| row.first())
            .and_then(|value| value.as_text())
        {
            let snapshot: JsonValue = serde_json::from_str(raw).map_err(|error| {
                LixError::validation(format!("active version snapshot invalid JSON: {error}"))
            })?;
            *self.active_version_id.write().unwrap() = parse_active_version_snapshot(&snapshot)?;
        }

        let account = exec
            .execute_internal(
                &format!(
                    "SELECT snapshot_content FROM {UNTRACKED_TABLE} \
                     WHERE entity_id = $1 AND schema_key = $2 AND version_id = $3 \
                       AND snapshot_content IS NOT NULL \
                     LIMIT 1"
                ),
                &[
                    Value::Text(ACTIVE_VERSION_ENTITY_ID.to_string()),
                    Value::Text(ACTIVE_ACCOUNT_SCHEMA_KEY.to_string()),
                    Value::Text(ACTIVE_VERSION_STORAGE_VERSION_ID.to_string()),
                ],
            )
            .await?;
        if let Some(raw) = account
            .rows
            .first()
            .and_then(|row| row.first())
            .and_then(|value| value.as_text())
        {
            let snapshot: JsonValue = serde_json::from_str(raw).map_err(|error| {
                LixError::validation(format!("active account snapshot invalid JSON: {error}"))
            })?;
            *self.active_account_id.write().unwrap() = snapshot
                .get("account_id")
                .and_then(|value| value.as_str())
                .map(|text| text.to_string());
        }
        Ok(())
    }

    /// Loads user schema registrations into the catalog and rebuilds the
    /// vtable view to include them, so reopened databases expose everything.
    async fn reload_registered_schemas(&self) -> Result<(), LixError> {
        let stored_table = quote_ident(&materialized_table_name(STORED_SCHEMA_KEY));
        let mut exec = Executor::Backend(self.backend.as_ref());
        let result = exec
            .execute(
                &format!(
                    "SELECT snapshot_content FROM {stored_table} \
                     WHERE version_id = '{GLOBAL_VERSION_ID}' AND is_tombstone = 0 \
                       AND snapshot_content IS NOT NULL"
                ),
                &[],
            )
            .await?;

        let mut keys = self.registered_schema_keys.write().unwrap();
        let mut user_schemas = Vec::new();
        for row in &result.rows {
            let Some(raw) = row.first().and_then(|value| value.as_text()) else {
                continue;
            };
            let snapshot: JsonValue = serde_json::from_str(raw).map_err(|error| {
                LixError::validation(format!("stored schema snapshot invalid JSON: {error}"))
            })?;
            let schema = parse_stored_schema_snapshot(&snapshot)?;
            if keys.insert(schema.key.clone()) {
                user_schemas.push(schema);
            }
        }
        let all_keys: Vec<String> = keys.iter().cloned().collect();
        drop(keys);

        for schema in &user_schemas {
            for statement in register_schema_sql_statements(schema, self.backend.dialect())? {
                self.backend.execute(&statement, &[]).await?;
            }
        }
        for statement in rebuild_vtable_view_sql(&all_keys) {
            self.backend.execute(&statement, &[]).await?;
        }
        Ok(())
    }
}

/// Explicit user transaction: the commit boundary extends to the outer
/// `commit()`, which flushes queued effects exactly once; `rollback()` drops
/// them.
#[must_use = "EngineTransaction must be committed or rolled back"]
pub struct EngineTransaction<'a> {
    engine: &'a Engine,
    transaction: Option<Box<dyn LixTransaction + 'a>>,
    effects: Vec<PostCommitEffect>,
    active_version_id: String,
}

impl EngineTransaction<'_> {
    pub async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<QueryResult, LixError> {
        let plan = self.engine.plan(sql, params)?;
        let provider = self.engine.function_provider();
        let transaction = self
            .transaction
            .as_deref_mut()
            .ok_or_else(|| LixError::io("transaction is no longer active"))?;
        let mut exec = Executor::Transaction(transaction);
        let result = self
            .engine
            .run_plan(
                &mut exec,
                &plan,
                params,
                &provider,
                &mut self.effects,
                &mut self.active_version_id,
            )
            .await
            .map_err(|error| error.with_plan_fingerprint(plan.fingerprint.clone()))?;
        self.engine.persist_sequence_sync(&provider);
        Ok(result)
    }

    pub async fn commit(mut self) -> Result<(), LixError> {
        let transaction = self
            .transaction
            .take()
            .ok_or_else(|| LixError::io("transaction is no longer active"))?;
        transaction.commit().await?;
        let effects = std::mem::take(&mut self.effects);
        let _reported = self.engine.flush_effects(effects);
        Ok(())
    }

    pub async fn rollback(mut self) -> Result<(), LixError> {
        let transaction = self
            .transaction
            .take()
            .ok_or_else(|| LixError::io("transaction is no longer active"))?;
        transaction.rollback().await
    }
}

impl Drop for EngineTransaction<'_> {
    fn drop(&mut self) {
        if self.transaction.is_some() && !std::thread::panicking() {
            panic!("EngineTransaction dropped without commit() or rollback()");
        }
    }
}

impl Engine {
    /// In-memory sequence sync for paths that cannot write the untracked
    /// sequence row (inside a user transaction, where the write belongs to
    /// the transaction anyway).
    fn persist_sequence_sync(&self, provider: &SharedFunctionProvider<RuntimeFunctionProvider>) {
        let highest = provider.sequence_snapshot();
        let mut next = self.next_sequence.lock().unwrap();
        if highest > *next {
            *next = highest;
        }
    }
}

/// Minimal drop-time ownership helper: callers must `take()` the transaction
/// to finish it; dropping the guard with the transaction still inside only
/// happens on early error paths, where the backend rolls back on disconnect.
struct TransactionGuard<'a> {
    inner: Option<Box<dyn LixTransaction + 'a>>,
}

fn scopeguard(transaction: Box<dyn LixTransaction + '_>) -> TransactionGuard<'_> {
    TransactionGuard {
        inner: Some(transaction),
    }
}

impl<'a> TransactionGuard<'a> {
    fn take(&mut self) -> Box<dyn LixTransaction + 'a> {
        self.inner.take().expect("transaction already finished")
    }
}
