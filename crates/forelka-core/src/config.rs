use std::{
    collections::BTreeMap,
    env, fs,
    path::{Path, PathBuf},
    sync::RwLock,
    time::Duration,
};

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::warn;

use crate::{errors::Error, Result};

pub const DEFAULT_CONFIG_PATH: &str = "config.json";

/// Nested JSON configuration persisted next to the process.
///
/// Defaults are merged under the user's values on every load and the merged
/// document is written back, so new keys show up in old files. Unknown keys
/// are kept as-is.
pub struct ConfigStore {
    path: PathBuf,
    doc: RwLock<Value>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ModulesConfig {
    pub auto_load: bool,
    pub modules_dir: PathBuf,
    pub loaded_modules_dir: PathBuf,
    /// File extensions eligible as plugin modules.
    pub extensions: Vec<String>,
    /// Interpreter per extension used to launch a plugin process.
    pub interpreters: BTreeMap<String, String>,
    /// Command prefix used to install a missing requirement (the requirement is appended).
    pub install_command: Vec<String>,
    pub request_timeout_secs: u64,
}

impl Default for ModulesConfig {
    fn default() -> Self {
        Self {
            auto_load: true,
            modules_dir: PathBuf::from("modules"),
            loaded_modules_dir: PathBuf::from("loaded_modules"),
            extensions: vec!["py".to_string(), "sh".to_string()],
            interpreters: BTreeMap::from([
                ("py".to_string(), "python3".to_string()),
                ("sh".to_string(), "sh".to_string()),
            ]),
            install_command: vec![
                "pip".to_string(),
                "install".to_string(),
                "--quiet".to_string(),
            ],
            request_timeout_secs: 30,
        }
    }
}

impl ModulesConfig {
    /// Search order: first directory wins on duplicate module names.
    pub fn directories(&self) -> Vec<PathBuf> {
        vec![self.modules_dir.clone(), self.loaded_modules_dir.clone()]
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct InlineBotConfig {
    pub enabled: bool,
    pub token: String,
    pub owner_id: i64,
}

impl Default for InlineBotConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            token: String::new(),
            owner_id: 0,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct TransportConfig {
    pub throttle: bool,
    pub global_min_interval_ms: u64,
    pub per_chat_min_interval_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            throttle: true,
            global_min_interval_ms: 40,
            per_chat_min_interval_ms: 1050,
        }
    }
}

fn default_document() -> Value {
    json!({
        "database_path": "forelka.db",
        "log_level": "info",
        "log_file": "forelka.log",
        "inline_bot": InlineBotConfig::default(),
        "modules": ModulesConfig::default(),
        "transport": TransportConfig::default(),
    })
}

impl ConfigStore {
    /// Load (or create) the config file, merge defaults, persist the result.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));

        let path = path.into();
        let user = read_user_document(&path);

        let mut doc = default_document();
        if let Some(user) = user {
            merge_into(&mut doc, user);
        }

        let store = Self {
            path,
            doc: RwLock::new(doc),
        };
        store.save()?;
        store.apply_env_overrides();
        Ok(store)
    }

    /// In-memory store; `save` writes to `path` only when called.
    pub fn from_value(path: impl Into<PathBuf>, user: Value) -> Self {
        let mut doc = default_document();
        merge_into(&mut doc, user);
        Self {
            path: path.into(),
            doc: RwLock::new(doc),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Dotted-path lookup (`"modules.modules_dir"`).
    pub fn get(&self, key: &str) -> Option<Value> {
        let doc = self.read();
        let mut cur = &*doc;
        for part in key.split('.') {
            cur = cur.as_object()?.get(part)?;
        }
        Some(cur.clone())
    }

    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get(key).and_then(|v| serde_json::from_value(v).ok())
    }

    /// Dotted-path write; intermediate objects are created. Persists immediately.
    pub fn set(&self, key: &str, value: Value) -> Result<()> {
        self.set_in_memory(key, value)?;
        self.save()
    }

    pub fn update(&self, updates: Map<String, Value>) -> Result<()> {
        for (key, value) in updates {
            self.set_in_memory(&key, value)?;
        }
        self.save()
    }

    pub fn reset_to_defaults(&self) -> Result<()> {
        *self.write() = default_document();
        self.save()
    }

    pub fn save(&self) -> Result<()> {
        let text = serde_json::to_string_pretty(&*self.read())?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(&self.path, text)?;
        Ok(())
    }

    pub fn database_path(&self) -> PathBuf {
        self.get_as::<String>("database_path")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("forelka.db"))
    }

    pub fn log_level(&self) -> String {
        self.get_as::<String>("log_level")
            .unwrap_or_else(|| "info".to_string())
    }

    pub fn log_file(&self) -> Option<PathBuf> {
        self.get_as::<String>("log_file")
            .and_then(non_empty)
            .map(PathBuf::from)
    }

    pub fn modules_config(&self) -> ModulesConfig {
        self.section("modules")
    }

    pub fn inline_bot_config(&self) -> InlineBotConfig {
        self.section("inline_bot")
    }

    pub fn transport_config(&self) -> TransportConfig {
        self.section("transport")
    }

    fn section<T: DeserializeOwned + Default>(&self, key: &str) -> T {
        let Some(v) = self.get(key) else {
            return T::default();
        };
        match serde_json::from_value(v) {
            Ok(t) => t,
            Err(e) => {
                warn!(section = key, error = %e, "invalid config section, using defaults");
                T::default()
            }
        }
    }

    fn set_in_memory(&self, key: &str, value: Value) -> Result<()> {
        let parts: Vec<&str> = key.split('.').collect();
        if parts.iter().any(|p| p.is_empty()) {
            return Err(Error::Config(format!("invalid config key: {key:?}")));
        }

        let mut doc = self.write();
        let mut cur = &mut *doc;
        for part in &parts[..parts.len() - 1] {
            cur = ensure_object(cur, key)?
                .entry(part.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
        }
        let last = parts[parts.len() - 1];
        ensure_object(cur, key)?.insert(last.to_string(), value);
        Ok(())
    }

    // Env overrides are runtime-only; never persisted.
    fn apply_env_overrides(&self) {
        let mut doc = self.write();
        let Some(obj) = doc.as_object_mut() else {
            return;
        };
        if let Some(v) = env_str("FORELKA_DATABASE_PATH").and_then(non_empty) {
            obj.insert("database_path".to_string(), Value::String(v));
        }
        if let Some(v) = env_str("FORELKA_LOG_LEVEL").and_then(non_empty) {
            obj.insert("log_level".to_string(), Value::String(v));
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Value> {
        self.doc.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Value> {
        self.doc.write().unwrap_or_else(|p| p.into_inner())
    }
}

fn read_user_document(path: &Path) -> Option<Value> {
    let text = fs::read_to_string(path).ok()?;
    match serde_json::from_str::<Value>(&text) {
        Ok(v @ Value::Object(_)) => Some(v),
        Ok(_) => {
            warn!(path = %path.display(), "config root is not an object, using defaults");
            None
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to parse config, using defaults");
            None
        }
    }
}

fn ensure_object<'a>(v: &'a mut Value, key: &str) -> Result<&'a mut Map<String, Value>> {
    if !v.is_object() {
        *v = Value::Object(Map::new());
    }
    v.as_object_mut()
        .ok_or_else(|| Error::Config(format!("cannot descend into {key:?}")))
}

/// Deep merge: `user` wins on leaves, objects merge recursively.
fn merge_into(base: &mut Value, user: Value) {
    match (base, user) {
        (Value::Object(b), Value::Object(u)) => {
            for (k, v) in u {
                let nested = v.is_object() && b.get(&k).is_some_and(Value::is_object);
                if !nested {
                    b.insert(k, v);
                } else if let Some(existing) = b.get_mut(&k) {
                    merge_into(existing, v);
                }
            }
        }
        (b, u) => *b = u,
    }
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }
        if env::var_os(key).is_some() {
            continue; // do not override existing env
        }

        let mut val = v.trim().to_string();
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = val[1..val.len() - 1].to_string();
        }

        env::set_var(key, val);
    }
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_creates_file_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let store = ConfigStore::load(&path).unwrap();
        assert!(path.exists());
        assert_eq!(store.modules_config(), ModulesConfig::default());
        assert_eq!(store.get_as::<bool>("inline_bot.enabled"), Some(true));

        let on_disk: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(on_disk["modules"]["modules_dir"], "modules");
    }

    #[test]
    fn load_merges_defaults_under_user_values_and_keeps_unknown_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{"modules": {"modules_dir": "mine"}, "custom": {"x": 1}}"#,
        )
        .unwrap();

        let store = ConfigStore::load(&path).unwrap();
        let modules = store.modules_config();
        assert_eq!(modules.modules_dir, PathBuf::from("mine"));
        assert_eq!(modules.loaded_modules_dir, PathBuf::from("loaded_modules"));
        assert_eq!(store.get("custom.x"), Some(json!(1)));

        let on_disk: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(on_disk["custom"]["x"], 1);
        assert_eq!(on_disk["modules"]["auto_load"], true);
    }

    #[test]
    fn broken_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{ not json").unwrap();

        let store = ConfigStore::load(&path).unwrap();
        assert_eq!(store.inline_bot_config(), InlineBotConfig::default());
    }

    #[test]
    fn dotted_set_creates_intermediate_objects_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let store = ConfigStore::load(&path).unwrap();

        store.set("a.b.c", json!("deep")).unwrap();
        assert_eq!(store.get("a.b.c"), Some(json!("deep")));
        assert_eq!(store.get("a.b.missing"), None);

        let reloaded = ConfigStore::load(&path).unwrap();
        assert_eq!(reloaded.get_as::<String>("a.b.c").as_deref(), Some("deep"));
    }

    #[test]
    fn update_and_reset_persist() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let store = ConfigStore::load(&path).unwrap();

        let mut updates = Map::new();
        updates.insert("log_level".to_string(), json!("debug"));
        updates.insert("transport.throttle".to_string(), json!(false));
        store.update(updates).unwrap();
        assert_eq!(store.log_level(), "debug");
        assert!(!store.transport_config().throttle);
        assert_eq!(store.path(), path.as_path());

        store.reset_to_defaults().unwrap();
        let reloaded = ConfigStore::load(&path).unwrap();
        assert!(reloaded.transport_config().throttle);
        assert_eq!(reloaded.get_as::<String>("log_level").as_deref(), Some("info"));
    }

    #[test]
    fn set_rejects_empty_segments() {
        let store = ConfigStore::from_value("/nonexistent/config.json", json!({}));
        assert!(store.set_in_memory("a..b", json!(1)).is_err());
    }

    #[test]
    fn invalid_section_falls_back_to_defaults() {
        let store = ConfigStore::from_value(
            "/nonexistent/config.json",
            json!({"transport": {"throttle": "yes please"}}),
        );
        assert_eq!(store.transport_config(), TransportConfig::default());
    }
}
