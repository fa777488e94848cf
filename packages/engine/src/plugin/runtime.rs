use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;

use crate::exec::Executor;
use crate::plugin::matching::select_best_glob_match;
use crate::plugin::types::{
    InstalledPlugin, PluginEntityChange, PluginEntityState, PluginFileDescriptor, PluginManifest,
};
use crate::storage::PLUGIN_TABLE;
use crate::{LixError, Value};

/// Host-provided runtime that turns an installed plugin's code into a live
/// instance. The engine never interprets plugin code itself.
#[async_trait(?Send)]
pub trait PluginHost: Send + Sync {
    async fn instantiate(
        &self,
        manifest: &PluginManifest,
        code: &[u8],
    ) -> Result<Arc<dyn PluginInstance>, LixError>;
}

/// The two plugin hooks. Callbacks run from the execution runner only; the
/// planner never invokes them.
#[async_trait(?Send)]
pub trait PluginInstance {
    async fn detect_changes(
        &self,
        descriptor: &PluginFileDescriptor,
        before: Option<&[u8]>,
        after: &[u8],
    ) -> Result<Vec<PluginEntityChange>, LixError>;

    async fn apply_changes(
        &self,
        descriptor: &PluginFileDescriptor,
        entities: &[PluginEntityState],
    ) -> Result<Vec<u8>, LixError>;
}

/// Default host for engines opened without plugin support: installation
/// succeeds but instantiation reports a typed failure.
#[derive(Debug, Default)]
pub struct NoopPluginHost;

#[async_trait(?Send)]
impl PluginHost for NoopPluginHost {
    async fn instantiate(
        &self,
        manifest: &PluginManifest,
        _code: &[u8],
    ) -> Result<Arc<dyn PluginInstance>, LixError> {
        Err(LixError::plugin(format!(
            "no plugin host configured; cannot instantiate plugin '{}'",
            manifest.key
        )))
    }
}

/// Installed-plugin cache plus per-key instance cache for one engine handle.
pub struct PluginRegistry {
    host: Arc<dyn PluginHost>,
    installed: RwLock<Option<Vec<InstalledPlugin>>>,
    instances: Mutex<BTreeMap<String, Arc<dyn PluginInstance>>>,
}

impl PluginRegistry {
    pub fn new(host: Arc<dyn PluginHost>) -> Self {
        Self {
            host,
            installed: RwLock::new(None),
            instances: Mutex::new(BTreeMap::new()),
        }
    }

    /// Drops both caches; the next lookup reloads from storage.
    pub fn invalidate(&self) {
        *self.installed.write().unwrap() = None;
        self.instances.lock().unwrap().clear();
    }

    /// Installs (or upgrades) a plugin, deduplicated by key. Re-installing
    /// identical bytes is a no-op.
    pub(crate) async fn install(
        &self,
        exec: &mut Executor<'_>,
        manifest: &PluginManifest,
        code: &[u8],
        installed_at: &str,
    ) -> Result<(), LixError> {
        let manifest_json = serde_json::to_string(manifest)
            .map_err(|error| LixError::plugin(format!("manifest serialization failed: {error}")))?;
        exec.execute_internal(
            &format!(
                "INSERT INTO {PLUGIN_TABLE} (key, manifest_json, code, installed_at) \
                 VALUES ($1, $2, $3, $4) \
                 ON CONFLICT (key) DO UPDATE SET \
                   manifest_json = excluded.manifest_json, \
                   code = excluded.code, \
                   installed_at = excluded.installed_at"
            ),
            &[
                Value::Text(manifest.key.clone()),
                Value::Text(manifest_json),
                Value::Blob(code.to_vec()),
                Value::Text(installed_at.to_string()),
            ],
        )
        .await?;
        self.invalidate();
        Ok(())
    }

    pub(crate) async fn installed_plugins(
        &self,
        exec: &mut Executor<'_>,
    ) -> Result<Vec<InstalledPlugin>, LixError> {
        if let Some(existing) = self.installed.read().unwrap().clone() {
            return Ok(existing);
        }

        let result = exec
            .execute(
                &format!("SELECT manifest_json, code FROM {PLUGIN_TABLE} ORDER BY key"),
                &[],
            )
            .await?;
        let mut plugins = Vec::with_capacity(result.rows.len());
        for row in &result.rows {
            let manifest_json = row
                .first()
                .and_then(|value| value.as_text())
                .ok_or_else(|| LixError::plugin("installed plugin row missing manifest"))?;
            let manifest = PluginManifest::parse_json(manifest_json)?;
            let code = match row.get(1) {
                Some(Value::Blob(bytes)) => bytes.clone(),
                _ => Vec::new(),
            };
            plugins.push(InstalledPlugin { manifest, code });
        }
        *self.installed.write().unwrap() = Some(plugins.clone());
        Ok(plugins)
    }

    /// Selects the plugin responsible for a path, if any, by glob
    /// specificity.
    pub(crate) async fn select_for_path(
        &self,
        exec: &mut Executor<'_>,
        path: &str,
    ) -> Result<Option<InstalledPlugin>, LixError> {
        let plugins = self.installed_plugins(exec).await?;
        Ok(
            select_best_glob_match(path, &plugins, |plugin| {
                plugin.manifest.detect_changes_glob.as_str()
            })
            .cloned(),
        )
    }

    async fn instance_for(&self, plugin: &InstalledPlugin) -> Result<Arc<dyn PluginInstance>, LixError> {
        if let Some(existing) = self.instances.lock().unwrap().get(&plugin.manifest.key) {
            return Ok(existing.clone());
        }
        let instance = self
            .host
            .instantiate(&plugin.manifest, &plugin.code)
            .await?;
        self.instances
            .lock()
            .unwrap()
            .insert(plugin.manifest.key.clone(), instance.clone());
        Ok(instance)
    }

    pub(crate) async fn detect_changes(
        &self,
        plugin: &InstalledPlugin,
        descriptor: &PluginFileDescriptor,
        before: Option<&[u8]>,
        after: &[u8],
    ) -> Result<Vec<PluginEntityChange>, LixError> {
        let instance = self.instance_for(plugin).await?;
        instance.detect_changes(descriptor, before, after).await
    }

    pub(crate) async fn apply_changes(
        &self,
        plugin: &InstalledPlugin,
        descriptor: &PluginFileDescriptor,
        entities: &[PluginEntityState],
    ) -> Result<Vec<u8>, LixError> {
        let instance = self.instance_for(plugin).await?;
        instance.apply_changes(descriptor, entities).await
    }
}
