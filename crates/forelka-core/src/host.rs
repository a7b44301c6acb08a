use std::{sync::Arc, time::Duration};

use tokio::time::Instant;

use crate::{
    commands::CommandTable, config::ConfigStore, modules::ModuleRegistry,
    repository::Repository,
};

/// Process-wide services shared by every session and module.
pub struct Host {
    config: Arc<ConfigStore>,
    repo: Arc<dyn Repository>,
    commands: Arc<CommandTable>,
    modules: ModuleRegistry,
    started_at: Instant,
}

impl Host {
    pub fn new(config: Arc<ConfigStore>, repo: Arc<dyn Repository>) -> Arc<Self> {
        let commands = Arc::new(CommandTable::new(repo.clone()));
        let modules = ModuleRegistry::new(config.modules_config());
        Arc::new(Self {
            config,
            repo,
            commands,
            modules,
            started_at: Instant::now(),
        })
    }

    pub fn config(&self) -> &Arc<ConfigStore> {
        &self.config
    }

    pub fn repo(&self) -> &Arc<dyn Repository> {
        &self.repo
    }

    pub fn commands(&self) -> &Arc<CommandTable> {
        &self.commands
    }

    pub fn modules(&self) -> &ModuleRegistry {
        &self.modules
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }
}
