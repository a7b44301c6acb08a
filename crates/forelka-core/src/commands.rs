//! Command table: name/alias -> handler + metadata, and the permission gate.
//!
//! All entries live behind one lock; every mutation happens under a single
//! write guard so readers see either the old table or the new one.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    future::Future,
    sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    domain::{AccountId, MessageRef, UserId},
    host::Host,
    repository::Repository,
    session::Session,
    transport::{IncomingMessage, TextFormat},
    Result,
};

/// Privilege a command may require.
///
/// Today both tiers are satisfied by owner membership.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Capability {
    Owner,
    Admin,
}

/// Everything a handler needs to act on one invocation.
#[derive(Clone)]
pub struct CommandContext {
    pub host: Arc<Host>,
    pub session: Arc<Session>,
    pub message: IncomingMessage,
    pub command: Arc<Command>,
    pub args: Vec<String>,
}

impl CommandContext {
    pub fn account_id(&self) -> AccountId {
        self.session.account_id()
    }

    /// Reply in the chat the command came from (HTML).
    pub async fn reply(&self, html: &str) -> Result<MessageRef> {
        self.session
            .transport()
            .send(self.message.chat_id, html, TextFormat::Html)
            .await
    }

    pub fn arg(&self, idx: usize) -> Option<&str> {
        self.args.get(idx).map(String::as_str)
    }
}

#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn call(&self, ctx: CommandContext) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> CommandHandler for F
where
    F: Fn(CommandContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn call(&self, ctx: CommandContext) -> anyhow::Result<()> {
        (self)(ctx).await
    }
}

pub struct Command {
    name: String,
    module: String,
    description: String,
    usage: String,
    required: BTreeSet<Capability>,
    registered_at: DateTime<Utc>,
    handler: Arc<dyn CommandHandler>,
}

impl Command {
    pub fn new(
        name: impl AsRef<str>,
        module: impl Into<String>,
        handler: impl CommandHandler + 'static,
    ) -> Self {
        Self::from_handler(name, module, Arc::new(handler))
    }

    pub fn from_handler(
        name: impl AsRef<str>,
        module: impl Into<String>,
        handler: Arc<dyn CommandHandler>,
    ) -> Self {
        Self {
            name: fold(name.as_ref()),
            module: module.into(),
            description: String::new(),
            usage: String::new(),
            required: BTreeSet::new(),
            registered_at: Utc::now(),
            handler,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn usage(mut self, usage: impl Into<String>) -> Self {
        self.usage = usage.into();
        self
    }

    pub fn require(mut self, capability: Capability) -> Self {
        self.required.insert(capability);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn about(&self) -> &str {
        &self.description
    }

    pub fn usage_text(&self) -> &str {
        &self.usage
    }

    pub fn required(&self) -> &BTreeSet<Capability> {
        &self.required
    }

    pub fn is_owner_only(&self) -> bool {
        self.required.contains(&Capability::Owner)
    }

    pub fn is_admin_only(&self) -> bool {
        self.required.contains(&Capability::Admin)
    }

    pub fn registered_at(&self) -> DateTime<Utc> {
        self.registered_at
    }

    pub fn handler(&self) -> Arc<dyn CommandHandler> {
        self.handler.clone()
    }
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Command")
            .field("name", &self.name)
            .field("module", &self.module)
            .field("required", &self.required)
            .finish_non_exhaustive()
    }
}

/// Outcome of [`CommandTable::check_permission`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Permission {
    Allowed,
    Denied(Capability),
}

#[derive(Default)]
struct Entries {
    commands: HashMap<String, Arc<Command>>,
    /// Declared by modules; visible to every account.
    aliases: HashMap<String, String>,
    /// Created by users; visible only to the owning account.
    account_aliases: HashMap<AccountId, HashMap<String, String>>,
}

impl Entries {
    fn drop_aliases_to(&mut self, removed: &[String]) {
        self.aliases.retain(|_, target| !removed.contains(target));
        for aliases in self.account_aliases.values_mut() {
            aliases.retain(|_, target| !removed.contains(target));
        }
        self.account_aliases.retain(|_, aliases| !aliases.is_empty());
    }
}

pub struct CommandTable {
    entries: RwLock<Entries>,
    repo: Arc<dyn Repository>,
}

fn fold(s: &str) -> String {
    s.trim().to_lowercase()
}

impl CommandTable {
    pub fn new(repo: Arc<dyn Repository>) -> Self {
        Self {
            entries: RwLock::new(Entries::default()),
            repo,
        }
    }

    /// Insert or replace; the last registration for a name wins.
    pub fn register(&self, command: Command) -> Option<Arc<Command>> {
        let command = Arc::new(command);
        self.write()
            .commands
            .insert(command.name.clone(), command)
    }

    /// The target is not checked here; a dangling alias simply fails to resolve.
    pub fn register_alias(&self, alias: &str, command: &str) {
        self.write().aliases.insert(fold(alias), fold(command));
    }

    pub fn unregister_alias(&self, alias: &str) -> bool {
        self.write().aliases.remove(&fold(alias)).is_some()
    }

    /// Alias seen only by `account`; it shadows a module alias of the same name.
    pub fn register_account_alias(&self, account: AccountId, alias: &str, command: &str) {
        self.write()
            .account_aliases
            .entry(account)
            .or_default()
            .insert(fold(alias), fold(command));
    }

    pub fn unregister_account_alias(&self, account: AccountId, alias: &str) -> bool {
        let mut entries = self.write();
        let Some(aliases) = entries.account_aliases.get_mut(&account) else {
            return false;
        };
        let removed = aliases.remove(&fold(alias)).is_some();
        if aliases.is_empty() {
            entries.account_aliases.remove(&account);
        }
        removed
    }

    /// Remove a command and every alias pointing at it.
    pub fn unregister(&self, name: &str) -> Option<Arc<Command>> {
        let name = fold(name);
        let mut entries = self.write();
        let removed = entries.commands.remove(&name);
        entries.drop_aliases_to(std::slice::from_ref(&name));
        removed
    }

    /// Remove every command contributed by `module`. Returns the removed names.
    pub fn unregister_module(&self, module: &str) -> Vec<String> {
        let mut entries = self.write();
        let mut removed: Vec<String> = entries
            .commands
            .values()
            .filter(|c| c.module == module)
            .map(|c| c.name.clone())
            .collect();
        removed.sort();
        for name in &removed {
            entries.commands.remove(name);
        }
        entries.drop_aliases_to(&removed);
        removed
    }

    /// Alias (one level) then command lookup.
    pub fn resolve(&self, token: &str) -> Option<Arc<Command>> {
        let token = fold(token);
        let entries = self.read();
        let name = entries.aliases.get(&token).unwrap_or(&token);
        entries.commands.get(name).cloned()
    }

    /// Like [`resolve`](Self::resolve), but the account's own aliases come first.
    pub fn resolve_for(&self, account: AccountId, token: &str) -> Option<Arc<Command>> {
        let token = fold(token);
        let entries = self.read();
        let name = entries
            .account_aliases
            .get(&account)
            .and_then(|aliases| aliases.get(&token))
            .or_else(|| entries.aliases.get(&token))
            .unwrap_or(&token);
        entries.commands.get(name).cloned()
    }

    /// Direct lookup, no alias substitution.
    pub fn info(&self, name: &str) -> Option<Arc<Command>> {
        self.read().commands.get(&fold(name)).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.read().commands.contains_key(&fold(name))
    }

    pub fn aliases(&self) -> BTreeMap<String, String> {
        self.read()
            .aliases
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn account_aliases(&self, account: AccountId) -> BTreeMap<String, String> {
        self.read()
            .account_aliases
            .get(&account)
            .map(|aliases| {
                aliases
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn clear(&self) {
        let mut entries = self.write();
        entries.commands.clear();
        entries.aliases.clear();
        entries.account_aliases.clear();
    }

    pub fn len(&self) -> usize {
        self.read().commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sorted by name. With `filter_owner_only`, owner-only commands are left out.
    pub fn list(&self, filter_owner_only: bool) -> Vec<Arc<Command>> {
        let mut out: Vec<_> = self
            .read()
            .commands
            .values()
            .filter(|c| !(filter_owner_only && c.is_owner_only()))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Case-insensitive substring match against name, description and module.
    pub fn search(&self, query: &str) -> Vec<Arc<Command>> {
        let query = query.to_lowercase();
        let mut out: Vec<_> = self
            .read()
            .commands
            .values()
            .filter(|c| {
                c.name.contains(&query)
                    || c.description.to_lowercase().contains(&query)
                    || c.module.to_lowercase().contains(&query)
            })
            .cloned()
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Owner membership is read from the repository on every call.
    pub async fn check_permission(
        &self,
        command: &Command,
        account_id: AccountId,
        user_id: Option<UserId>,
    ) -> Result<Permission> {
        let Some(&first) = command.required.iter().next() else {
            return Ok(Permission::Allowed);
        };
        let Some(user_id) = user_id else {
            return Ok(Permission::Denied(first));
        };
        if self.repo.is_owner(account_id, user_id).await? {
            Ok(Permission::Allowed)
        } else {
            Ok(Permission::Denied(first))
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Entries> {
        self.entries.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Entries> {
        self.entries.write().unwrap_or_else(|p| p.into_inner())
    }
}
