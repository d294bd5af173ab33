use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::fs;
use tokio::sync::RwLock;

use skiff_relay::RelayConfig;
use skiff_runtime::{HttpConfig, RetryPolicy};
use skiff_sandbox::{HealthPollConfig, SandboxSettings};

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ControllerConfig {
    pub url: Option<String>,
    pub token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct StorageConfig {
    /// Session records persist under this directory; in memory when unset.
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub dir: Option<PathBuf>,
    pub retention_days: u64,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: None,
            retention_days: 14,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct SkiffConfig {
    pub controller: ControllerConfig,
    pub sandbox: SandboxSettings,
    pub health: HealthPollConfig,
    pub retry: RetryPolicy,
    pub http: HttpConfig,
    pub relay: RelayConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Default)]
struct ConfigLayers {
    file: Value,
    env: Value,
    cli: Value,
}

/// Layered JSON configuration: defaults, then the config file, then `SKIFF_*`
/// environment variables, then CLI overrides.
#[derive(Clone)]
pub struct ConfigStore {
    file_path: Option<PathBuf>,
    layers: Arc<RwLock<ConfigLayers>>,
}

impl ConfigStore {
    pub async fn new(path: Option<PathBuf>, cli_overrides: Option<Value>) -> anyhow::Result<Self> {
        Self::with_env(path, cli_overrides, |key| std::env::var(key).ok()).await
    }

    pub async fn with_env<F>(
        path: Option<PathBuf>,
        cli_overrides: Option<Value>,
        lookup: F,
    ) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let file = match &path {
            Some(path) => read_json_file(path).await?,
            None => empty_object(),
        };
        let layers = ConfigLayers {
            file,
            env: env_layer_from(lookup),
            cli: cli_overrides.unwrap_or_else(empty_object),
        };
        Ok(Self {
            file_path: path,
            layers: Arc::new(RwLock::new(layers)),
        })
    }

    pub async fn get(&self) -> SkiffConfig {
        let merged = self.get_effective_value().await;
        match serde_json::from_value(merged) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Invalid configuration, falling back to defaults: {}", e);
                SkiffConfig::default()
            }
        }
    }

    pub async fn get_effective_value(&self) -> Value {
        let layers = self.layers.read().await.clone();
        let mut merged = serde_json::to_value(SkiffConfig::default()).unwrap_or_else(|_| empty_object());
        deep_merge(&mut merged, &layers.file);
        deep_merge(&mut merged, &layers.env);
        deep_merge(&mut merged, &layers.cli);
        merged
    }

    pub async fn get_layers_value(&self) -> Value {
        let layers = self.layers.read().await;
        json!({
            "file": layers.file,
            "env": layers.env,
            "cli": layers.cli
        })
    }

    /// Merges `patch` into the file layer and writes it back, without secrets.
    pub async fn patch_file(&self, patch: Value) -> anyhow::Result<Value> {
        {
            let mut layers = self.layers.write().await;
            deep_merge(&mut layers.file, &patch);
        }
        if let Some(path) = &self.file_path {
            let snapshot = self.layers.read().await.file.clone();
            write_json_file(path, &snapshot).await?;
        }
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
    match serde_json::from_str::<Value>(&raw) {
        Ok(value) => Ok(value),
        Err(e) => {
            tracing::warn!("Ignoring unreadable config file {:?}: {}", path, e);
            Ok(empty_object())
        }
    }
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

const SECRET_KEYS: [&str; 4] = ["token", "api_key", "apiKey", "secret"];

fn strip_persisted_secrets(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for key in SECRET_KEYS {
                map.remove(key);
            }
            for nested in map.values_mut() {
                strip_persisted_secrets(nested);
            }
        }
        Value::Array(items) => items.iter_mut().for_each(strip_persisted_secrets),
        _ => {}
    }
}

fn env_layer_from<F>(lookup: F) -> Value
where
    F: Fn(&str) -> Option<String>,
{
    let mut root = empty_object();
    let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

    if let Some(url) = get("SKIFF_CONTROLLER_URL") {
        deep_merge(&mut root, &json!({ "controller": { "url": url } }));
    }
    if let Some(token) = get("SKIFF_CONTROLLER_TOKEN") {
        deep_merge(&mut root, &json!({ "controller": { "token": token } }));
    }
    if let Some(image) = get("SKIFF_SANDBOX_IMAGE") {
        deep_merge(&mut root, &json!({ "sandbox": { "image": image } }));
    }
    if let Some(port) = get("SKIFF_AGENT_PORT").and_then(|v| v.trim().parse::<u16>().ok()) {
        deep_merge(&mut root, &json!({ "sandbox": { "agent_port": port } }));
    }
    if let Some(attempts) = get("SKIFF_HEALTH_MAX_ATTEMPTS").and_then(|v| v.trim().parse::<u32>().ok()) {
        deep_merge(&mut root, &json!({ "health": { "max_attempts": attempts } }));
    }
    if let Some(interval) = get("SKIFF_HEALTH_INTERVAL_MS").and_then(|v| v.trim().parse::<u64>().ok()) {
        deep_merge(&mut root, &json!({ "health": { "interval_ms": interval } }));
    }
    if let Some(attempts) = get("SKIFF_RETRY_MAX_ATTEMPTS").and_then(|v| v.trim().parse::<u32>().ok()) {
        deep_merge(&mut root, &json!({ "retry": { "max_attempts": attempts } }));
    }
    if let Some(jitter) = get("SKIFF_RETRY_JITTER").and_then(|v| parse_bool_like(&v)) {
        deep_merge(&mut root, &json!({ "retry": { "jitter": jitter } }));
    }
    if let Some(dir) = get("SKIFF_STORAGE_DIR") {
        deep_merge(&mut root, &json!({ "storage": { "dir": dir } }));
    }
    if let Some(dir) = get("SKIFF_LOG_DIR") {
        deep_merge(&mut root, &json!({ "logging": { "dir": dir } }));
    }
    root
}

fn parse_bool_like(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn deep_merge(base: &mut Value, overlay: &Value) {
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[tokio::test]
    async fn defaults_when_nothing_is_configured() {
        let store = ConfigStore::with_env(None, None, lookup(&[])).await.unwrap();
        let config = store.get().await;
        assert_eq!(config, SkiffConfig::default());
        assert_eq!(config.health.max_attempts, 30);
        assert_eq!(config.sandbox.agent_port, 4096);
        assert_eq!(config.logging.retention_days, 14);
    }

    #[tokio::test]
    async fn layers_apply_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("skiff.json");
        std::fs::write(
            &path,
            r#"{"sandbox":{"image":"file/image:1","agent_port":5000},"health":{"interval_ms":100}}"#,
        )
        .unwrap();

        let store = ConfigStore::with_env(
            Some(path),
            Some(json!({ "health": { "max_attempts": 3 } })),
            lookup(&[
                ("SKIFF_AGENT_PORT", "6000"),
                ("SKIFF_HEALTH_MAX_ATTEMPTS", "9"),
                ("SKIFF_CONTROLLER_URL", "https://controller.test"),
                ("SKIFF_RETRY_JITTER", "off"),
            ]),
        )
        .await
        .unwrap();
        let config = store.get().await;

        assert_eq!(config.sandbox.image, "file/image:1");
        assert_eq!(config.sandbox.agent_port, 6000);
        assert_eq!(config.health.interval_ms, 100);
        assert_eq!(config.health.max_attempts, 3);
        assert_eq!(config.controller.url.as_deref(), Some("https://controller.test"));
        assert!(!config.retry.jitter);
        assert_eq!(config.sandbox.workspace_dir, "/workspace");
    }

    #[tokio::test]
    async fn unparsable_env_values_are_ignored() {
        let store = ConfigStore::with_env(
            None,
            None,
            lookup(&[("SKIFF_AGENT_PORT", "not-a-port"), ("SKIFF_SANDBOX_IMAGE", "  ")]),
        )
        .await
        .unwrap();
        let layers = store.get_layers_value().await;
        assert_eq!(layers["env"], json!({}));
    }

    #[tokio::test]
    async fn patched_file_never_persists_secrets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("skiff.json");
        let store = ConfigStore::with_env(Some(path.clone()), None, lookup(&[]))
            .await
            .unwrap();

        let effective = store
            .patch_file(json!({
                "controller": { "url": "https://controller.test", "token": "ctl-secret" },
                "relay": { "channel_capacity": 8 }
            }))
            .await
            .unwrap();
        assert_eq!(effective["controller"]["token"], "ctl-secret");

        let on_disk = std::fs::read_to_string(&path).unwrap();
        assert!(!on_disk.contains("ctl-secret"));
        assert!(on_disk.contains("https://controller.test"));
        assert_eq!(store.get().await.relay.channel_capacity, 8);
    }

    #[test]
    fn deep_merge_skips_nulls() {
        let mut base = json!({ "a": { "b": 1, "c": 2 } });
        deep_merge(&mut base, &json!({ "a": { "b": null, "c": 3 }, "d": 4 }));
        assert_eq!(base, json!({ "a": { "b": 1, "c": 3 }, "d": 4 }));
    }
}
