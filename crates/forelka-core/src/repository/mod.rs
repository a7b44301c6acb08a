//! Durable storage port for accounts, owners, settings and module records.
//!
//! Every operation is one logical unit: it either commits as a whole or leaves
//! no rows behind. Reads are idempotent and safe to retry.

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::{
    domain::{Account, AccountId, ModuleRecord, Owner, Prefix, UserId},
    Result,
};

mod sqlite;

pub use sqlite::SqliteRepository;

/// Input for [`Repository::add_account`].
#[derive(Clone, Debug)]
pub struct NewAccount {
    pub external_user_id: UserId,
    pub api_id: String,
    pub api_hash: String,
    pub prefix: Prefix,
}

/// Metadata written by [`Repository::upsert_module_record`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModuleRecordUpdate {
    pub module_name: String,
    pub version: String,
    pub developer: String,
    pub description: String,
}

#[async_trait]
pub trait Repository: Send + Sync {
    /// Upsert on `external_user_id`; the account's own user id becomes an owner
    /// in the same transaction.
    async fn add_account(&self, account: NewAccount) -> Result<AccountId>;
    async fn get_account_by_external_id(&self, user_id: UserId) -> Result<Option<Account>>;
    async fn get_account_by_id(&self, id: AccountId) -> Result<Option<Account>>;
    async fn list_accounts(&self) -> Result<Vec<Account>>;
    /// Removes the account together with its owners, settings and module records.
    /// Returns `false` when no such account exists.
    async fn remove_account(&self, id: AccountId) -> Result<bool>;

    async fn add_owner(&self, id: AccountId, user_id: UserId, is_admin: bool) -> Result<()>;
    async fn remove_owner(&self, id: AccountId, user_id: UserId) -> Result<bool>;
    async fn list_owners(&self, id: AccountId) -> Result<Vec<Owner>>;
    async fn is_owner(&self, id: AccountId, user_id: UserId) -> Result<bool>;

    async fn set_setting(&self, id: AccountId, key: &str, value: &str) -> Result<()>;
    async fn get_setting(&self, id: AccountId, key: &str) -> Result<Option<String>>;
    async fn delete_setting(&self, id: AccountId, key: &str) -> Result<bool>;
    async fn list_settings(&self, id: AccountId) -> Result<BTreeMap<String, String>>;

    async fn upsert_module_record(&self, id: AccountId, record: ModuleRecordUpdate)
        -> Result<()>;
    async fn enable_module(&self, id: AccountId, module_name: &str) -> Result<bool>;
    async fn disable_module(&self, id: AccountId, module_name: &str) -> Result<bool>;
    async fn list_enabled_modules(&self, id: AccountId) -> Result<Vec<String>>;
    async fn get_module_record(
        &self,
        id: AccountId,
        module_name: &str,
    ) -> Result<Option<ModuleRecord>>;

    /// Release the underlying connection. Later calls fail.
    async fn close(&self) -> Result<()>;
}

pub const PREFIX_SETTING: &str = "prefix";
pub const LOG_CHAT_SETTING: &str = "log_chat_id";
pub const ALIAS_SETTING_PREFIX: &str = "alias_";

/// The prefix currently in force for an account: the `prefix` setting when a
/// valid one is stored, otherwise the prefix on the account row.
pub async fn current_prefix(repo: &dyn Repository, account: &Account) -> Result<Prefix> {
    let stored = repo.get_setting(account.id, PREFIX_SETTING).await?;
    Ok(stored
        .and_then(|raw| Prefix::parse(&raw).ok())
        .unwrap_or_else(|| account.prefix.clone()))
}
