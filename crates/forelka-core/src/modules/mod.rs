//! Module registry: discovery, load/unload lifecycle and metadata.
//!
//! Builtin modules are compiled in; directory modules run as plugin processes
//! (see [`plugin`]). Both go through the same `register`/`unregister`
//! contract. Loads are serialized by one async mutex held for the whole load,
//! so a half-installed module is never visible in the registry.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::{
    commands::CommandTable,
    config::ModulesConfig,
    host::Host,
    repository::ModuleRecordUpdate,
};

pub mod builtin;
pub mod manifest;
pub mod plugin;

use builtin::alias::restore_all_aliases;
use manifest::{ensure_requirements, read_header, scan_dir};
use plugin::PluginModule;

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("module {0:?} is already loaded")]
    AlreadyLoaded(String),
    #[error("module {0:?} not found")]
    NotFound(String),
    #[error("module has no register entry point")]
    MissingEntryPoint,
    #[error("failed to install dependency {requirement:?}: {reason}")]
    Dependency { requirement: String, reason: String },
    #[error("failed to start module: {0}")]
    Spawn(String),
    #[error("module protocol error: {0}")]
    Protocol(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Self-declared identity of a module.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModuleInfo {
    pub developer: String,
    pub version: String,
    pub description: String,
}

impl ModuleInfo {
    pub fn new(developer: &str, version: &str, description: &str) -> Self {
        Self {
            developer: developer.to_string(),
            version: version.to_string(),
            description: description.to_string(),
        }
    }

    pub fn from_parts(
        developer: Option<String>,
        version: Option<String>,
        description: Option<String>,
    ) -> Self {
        Self {
            developer: developer.unwrap_or_else(|| "Unknown".to_string()),
            version: version.unwrap_or_else(|| "1.0".to_string()),
            description: description.unwrap_or_else(|| "No description".to_string()),
        }
    }
}

/// The plugin contract.
#[async_trait]
pub trait Module: Send + Sync {
    fn info(&self) -> ModuleInfo;

    /// Called once on load. Commands must be registered under `name`.
    async fn register(
        &self,
        host: &Arc<Host>,
        table: &CommandTable,
        name: &str,
    ) -> Result<(), LoadError>;

    /// Called once on unload, best-effort.
    async fn unregister(
        &self,
        _host: &Arc<Host>,
        table: &CommandTable,
        name: &str,
    ) -> anyhow::Result<()> {
        table.unregister_module(name);
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ModuleSource {
    Builtin,
    File(PathBuf),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModuleMetadata {
    pub name: String,
    pub developer: String,
    pub version: String,
    pub description: String,
    pub commands: Vec<String>,
    pub requirements: Vec<String>,
    pub source: ModuleSource,
    pub loaded_at: DateTime<Utc>,
}

struct LoadedModule {
    module: Arc<dyn Module>,
    metadata: ModuleMetadata,
}

pub struct ModuleRegistry {
    cfg: ModulesConfig,
    loaded: Mutex<BTreeMap<String, LoadedModule>>,
}

impl ModuleRegistry {
    pub fn new(cfg: ModulesConfig) -> Self {
        Self {
            cfg,
            loaded: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn config(&self) -> &ModulesConfig {
        &self.cfg
    }

    /// Install the compiled-in modules. Returns how many were loaded.
    pub async fn load_builtins(&self, host: &Arc<Host>) -> usize {
        let mut count = 0;
        for (name, module) in builtin::all() {
            let mut loaded = self.loaded.lock().await;
            if loaded.contains_key(name) {
                continue;
            }
            match install(host, &mut loaded, name, module, ModuleSource::Builtin, Vec::new()).await
            {
                Ok(_) => count += 1,
                Err(e) => error!(module = %name, error = %e, "failed to load builtin module"),
            }
        }
        count
    }

    /// Load every eligible file of `dirs` in order; the first directory wins
    /// on duplicate names. Failures are logged and skipped.
    pub async fn discover_and_load_all(&self, host: &Arc<Host>, dirs: &[PathBuf]) -> usize {
        let mut count = 0;
        for dir in dirs {
            if let Err(e) = tokio::fs::create_dir_all(dir).await {
                warn!(dir = %dir.display(), error = %e, "cannot create module directory");
                continue;
            }
            let entries = match scan_dir(dir, &self.cfg.extensions) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(dir = %dir.display(), error = %e, "cannot read module directory");
                    continue;
                }
            };
            for (name, path) in entries {
                if self.is_loaded(&name).await {
                    debug!(module = %name, path = %path.display(), "module already loaded, skipping");
                    continue;
                }
                if self.load(host, &name, &path).await {
                    count += 1;
                }
            }
        }
        info!(count, "modules loaded from directories");
        restore_all_aliases(host.repo().as_ref(), host.commands()).await;
        count
    }

    /// Load one module file. Never fails loudly: errors are logged and
    /// reported as `false`, leaving no partial state behind.
    pub async fn load(&self, host: &Arc<Host>, name: &str, path: &Path) -> bool {
        match self.try_load(host, name, path).await {
            Ok(meta) => {
                info!(module = %meta.name, version = %meta.version, commands = meta.commands.len(), "module loaded");
                true
            }
            Err(LoadError::AlreadyLoaded(name)) => {
                debug!(module = %name, "module already loaded");
                false
            }
            Err(e @ LoadError::MissingEntryPoint) => {
                warn!(module = %name, path = %path.display(), error = %e, "module rejected");
                false
            }
            Err(e) => {
                error!(module = %name, path = %path.display(), error = %e, "failed to load module");
                false
            }
        }
    }

    pub async fn try_load(
        &self,
        host: &Arc<Host>,
        name: &str,
        path: &Path,
    ) -> Result<ModuleMetadata, LoadError> {
        let name = name.to_lowercase();
        let mut loaded = self.loaded.lock().await;
        if loaded.contains_key(&name) {
            return Err(LoadError::AlreadyLoaded(name));
        }

        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        let interpreter = self
            .cfg
            .interpreters
            .get(&ext)
            .ok_or_else(|| LoadError::Spawn(format!("no interpreter configured for .{ext}")))?;

        let header = read_header(path);
        ensure_requirements(
            &header.requirements,
            &ext,
            interpreter,
            &self.cfg.install_command,
        )
        .await?;

        let requirements = header.requirements.clone();
        let module: Arc<dyn Module> = Arc::new(PluginModule::new(
            path.to_path_buf(),
            interpreter.clone(),
            header,
            self.cfg.request_timeout(),
        ));
        install(
            host,
            &mut loaded,
            &name,
            module,
            ModuleSource::File(path.to_path_buf()),
            requirements,
        )
        .await
    }

    /// Find `name` in the configured directories (first wins) and load it.
    pub async fn load_by_name(&self, host: &Arc<Host>, name: &str) -> crate::Result<ModuleMetadata> {
        let name = name.to_lowercase();
        let path = self
            .find_file(&name)
            .ok_or_else(|| LoadError::NotFound(name.clone()))?;
        let meta = self.try_load(host, &name, &path).await?;
        restore_all_aliases(host.repo().as_ref(), host.commands()).await;
        Ok(meta)
    }

    fn find_file(&self, name: &str) -> Option<PathBuf> {
        self.cfg.directories().iter().find_map(|dir| {
            scan_dir(dir, &self.cfg.extensions)
                .ok()?
                .into_iter()
                .find(|(n, _)| n == name)
                .map(|(_, p)| p)
        })
    }

    /// Run the module's `unregister` hook (best-effort) and forget it.
    pub async fn unload(&self, host: &Arc<Host>, name: &str) -> bool {
        let name = name.to_lowercase();
        let mut loaded = self.loaded.lock().await;
        let Some(entry) = loaded.remove(&name) else {
            return false;
        };
        if let Err(e) = entry.module.unregister(host, host.commands(), &name).await {
            warn!(module = %name, error = ?e, "unregister hook failed");
            host.commands().unregister_module(&name);
        }
        info!(module = %name, "module unloaded");
        true
    }

    pub async fn unload_all(&self, host: &Arc<Host>) {
        for name in self.loaded_names().await {
            self.unload(host, &name).await;
        }
    }

    /// Unload everything, then load builtins and the configured directories
    /// again. Persisted aliases are re-registered afterwards. Other accounts
    /// keep dispatching meanwhile.
    pub async fn reload_all(&self, host: &Arc<Host>) -> usize {
        self.unload_all(host).await;
        let builtins = self.load_builtins(host).await;
        builtins
            + self
                .discover_and_load_all(host, &self.cfg.directories())
                .await
    }

    pub async fn info(&self, name: &str) -> Option<ModuleMetadata> {
        self.loaded
            .lock()
            .await
            .get(&name.to_lowercase())
            .map(|m| m.metadata.clone())
    }

    pub async fn all_metadata(&self) -> Vec<ModuleMetadata> {
        self.loaded
            .lock()
            .await
            .values()
            .map(|m| m.metadata.clone())
            .collect()
    }

    pub async fn is_loaded(&self, name: &str) -> bool {
        self.loaded.lock().await.contains_key(&name.to_lowercase())
    }

    pub async fn loaded_names(&self) -> Vec<String> {
        self.loaded.lock().await.keys().cloned().collect()
    }
}

async fn install(
    host: &Arc<Host>,
    loaded: &mut BTreeMap<String, LoadedModule>,
    name: &str,
    module: Arc<dyn Module>,
    source: ModuleSource,
    requirements: Vec<String>,
) -> Result<ModuleMetadata, LoadError> {
    let table = host.commands();
    if let Err(e) = module.register(host, table, name).await {
        table.unregister_module(name);
        return Err(e);
    }

    let info = module.info();
    let metadata = ModuleMetadata {
        name: name.to_string(),
        developer: info.developer,
        version: info.version,
        description: info.description,
        commands: table
            .list(false)
            .iter()
            .filter(|c| c.module() == name)
            .map(|c| c.name().to_string())
            .collect(),
        requirements,
        source,
        loaded_at: Utc::now(),
    };

    record_module(host, &metadata).await;
    loaded.insert(
        name.to_string(),
        LoadedModule {
            module,
            metadata: metadata.clone(),
        },
    );
    Ok(metadata)
}

async fn record_module(host: &Arc<Host>, meta: &ModuleMetadata) {
    let accounts = match host.repo().list_accounts().await {
        Ok(accounts) => accounts,
        Err(e) => {
            warn!(module = %meta.name, error = %e, "cannot list accounts for module record");
            return;
        }
    };
    for account in accounts {
        let update = ModuleRecordUpdate {
            module_name: meta.name.clone(),
            version: meta.version.clone(),
            developer: meta.developer.clone(),
            description: meta.description.clone(),
        };
        if let Err(e) = host.repo().upsert_module_record(account.id, update).await {
            warn!(module = %meta.name, account_id = %account.id, error = %e, "failed to record module");
        }
    }
}
