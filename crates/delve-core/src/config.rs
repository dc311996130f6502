use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::fs;
use tokio::sync::RwLock;

use delve_providers::{ProviderConfig, ProvidersConfig};
use delve_tools::SearchConfig;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkflowConfig {
    /// Maximum tool-invoking transitions per run.
    pub step_cap: u32,
    pub context_turns: usize,
    pub max_parallel_searches: usize,
    pub summary_line_budget: usize,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            step_cap: 10,
            context_turns: 10,
            max_parallel_searches: 4,
            summary_line_budget: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StreamConfig {
    /// Seconds a finished stream stays resumable.
    pub retention_secs: u64,
    pub channel_capacity: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            retention_secs: 86_400,
            channel_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub providers: HashMap<String, ProviderConfig>,
    pub default_provider: Option<String>,
    pub search: SearchConfig,
    pub workflow: WorkflowConfig,
    pub streams: StreamConfig,
}

impl EngineConfig {
    pub fn providers_config(&self) -> ProvidersConfig {
        ProvidersConfig {
            providers: self.providers.clone(),
            default_provider: self.default_provider.clone(),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct ConfigLayers {
    defaults: Value,
    file: Value,
    env: Value,
    cli: Value,
}

/// Layered configuration: defaults, config file, environment, CLI.
#[derive(Clone)]
pub struct ConfigStore {
    path: PathBuf,
    layers: Arc<RwLock<ConfigLayers>>,
}

impl ConfigStore {
    pub async fn new(path: impl AsRef<Path>, cli_overrides: Option<Value>) -> anyhow::Result<Self> {
        Self::with_env(path, cli_overrides, env_layer(|key| std::env::var(key).ok())).await
    }

    async fn with_env(
        path: impl AsRef<Path>,
        cli_overrides: Option<Value>,
        env: Value,
    ) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let layers = ConfigLayers {
            defaults: serde_json::to_value(EngineConfig::default())?,
            file: read_json_file(&path).await?,
            env,
            cli: cli_overrides.unwrap_or_else(empty_object),
        };
        Ok(Self {
            path,
            layers: Arc::new(RwLock::new(layers)),
        })
    }

    pub async fn get(&self) -> EngineConfig {
        let merged = self.get_effective_value().await;
        match serde_json::from_value(merged) {
            Ok(config) => config,
            Err(err) => {
                tracing::warn!("invalid engine config, using defaults: {}", err);
                EngineConfig::default()
            }
        }
    }

    pub async fn get_effective_value(&self) -> Value {
        let layers = self.layers.read().await.clone();
        let mut merged = empty_object();
        deep_merge(&mut merged, &layers.defaults);
        deep_merge(&mut merged, &layers.file);
        deep_merge(&mut merged, &layers.env);
        deep_merge(&mut merged, &layers.cli);
        merged
    }

    /// Merges `patch` into the file layer and persists it without secrets.
    pub async fn patch_file(&self, patch: Value) -> anyhow::Result<Value> {
        let file = {
            let mut layers = self.layers.write().await;
            deep_merge(&mut layers.file, &patch);
            layers.file.clone()
        };
        write_json_file(&self.path, &file).await?;
        Ok(self.get_effective_value().await)
    }
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

async fn read_json_file(path: &Path) -> anyhow::Result<Value> {
    if !path.exists() {
        return Ok(empty_object());
    }
    let raw = fs::read_to_string(path).await?;
    Ok(serde_json::from_str::<Value>(&raw).unwrap_or_else(|_| empty_object()))
}

async fn write_json_file(path: &Path, value: &Value) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let mut to_write = value.clone();
    strip_persisted_secrets(&mut to_write);
    let raw = serde_json::to_string_pretty(&to_write)?;
    fs::write(path, raw).await?;
    Ok(())
}

fn strip_persisted_secrets(value: &mut Value) {
    let Value::Object(root) = value else {
        return;
    };
    if let Some(providers) = root.get_mut("providers").and_then(|v| v.as_object_mut()) {
        for provider in providers.values_mut() {
            if let Some(obj) = provider.as_object_mut() {
                obj.remove("api_key");
            }
        }
    }
    if let Some(search) = root.get_mut("search").and_then(|v| v.as_object_mut()) {
        search.remove("api_key");
    }
}

fn env_layer(lookup: impl Fn(&str) -> Option<String>) -> Value {
    let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
    let mut root = empty_object();

    add_openai_env(&mut root, get("OPENAI_API_KEY"), "openai");
    add_openai_env(&mut root, get("OPENROUTER_API_KEY"), "openrouter");
    add_openai_env(&mut root, get("GROQ_API_KEY"), "groq");

    if let Some(provider) = get("DELVE_DEFAULT_PROVIDER") {
        deep_merge(&mut root, &json!({ "default_provider": provider }));
    }
    if let Some(api_key) = get("EXA_API_KEY") {
        deep_merge(&mut root, &json!({ "search": { "api_key": api_key } }));
    }
    if let Some(url) = get("DELVE_SEARCH_URL") {
        deep_merge(&mut root, &json!({ "search": { "url": url } }));
    }
    if let Some(cap) = get("DELVE_STEP_CAP").and_then(|v| v.trim().parse::<u32>().ok()) {
        deep_merge(&mut root, &json!({ "workflow": { "step_cap": cap } }));
    }
    if let Some(n) = get("DELVE_MAX_PARALLEL_SEARCHES").and_then(|v| v.trim().parse::<usize>().ok()) {
        deep_merge(&mut root, &json!({ "workflow": { "max_parallel_searches": n } }));
    }
    if let Some(secs) = get("DELVE_STREAM_RETENTION_SECS").and_then(|v| v.trim().parse::<u64>().ok())
    {
        deep_merge(&mut root, &json!({ "streams": { "retention_secs": secs } }));
    }

    root
}

fn add_openai_env(root: &mut Value, api_key: Option<String>, provider: &str) {
    if let Some(api_key) = api_key {
        deep_merge(
            root,
            &json!({
                "providers": {
                    provider: { "api_key": api_key }
                }
            }),
        );
    }
}

pub(crate) fn deep_merge(base: &mut Value, overlay: &Value) {
    if overlay.is_null() {
        return;
    }
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                if value.is_null() {
                    continue;
                }
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base_value, overlay_value) => {
            *base_value = overlay_value.clone();
        }
    }
}
