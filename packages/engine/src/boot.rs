use std::sync::Arc;

use serde_json::Value as JsonValue;

use crate::plugin::PluginHost;
use crate::{Engine, LixBackend, LixError};

/// An initial key-value written as an untracked row before anything else
/// runs, e.g. `lix_deterministic_mode`.
#[derive(Debug, Clone)]
pub struct BootKeyValue {
    pub key: String,
    pub value: JsonValue,
}

pub struct BootArgs {
    pub backend: Box<dyn LixBackend + Send + Sync>,
    pub plugin_host: Option<Arc<dyn PluginHost>>,
    pub key_values: Vec<BootKeyValue>,
}

impl BootArgs {
    pub fn new(backend: Box<dyn LixBackend + Send + Sync>) -> Self {
        Self {
            backend,
            plugin_host: None,
            key_values: Vec::new(),
        }
    }

    pub fn with_plugin_host(mut self, host: Arc<dyn PluginHost>) -> Self {
        self.plugin_host = Some(host);
        self
    }

    pub fn with_key_value(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        self.key_values.push(BootKeyValue {
            key: key.into(),
            value,
        });
        self
    }
}

/// Opens an engine over the given backend: runs the internal DDL, writes the
/// boot key-values, seeds first-open state, and loads the per-handle caches.
pub async fn boot(args: BootArgs) -> Result<Engine, LixError> {
    let key_values = args
        .key_values
        .into_iter()
        .map(|kv| (kv.key, kv.value))
        .collect();
    Engine::open(args.backend, args.plugin_host, key_values).await
}
