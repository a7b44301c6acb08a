//! SQLite implementation of the repository port.
//!
//! One connection shared by every session, guarded by a mutex. Each public
//! operation runs inside its own transaction on the blocking pool; dropping
//! an uncommitted `Transaction` rolls it back.

use std::{
    collections::BTreeMap,
    path::Path,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};

use crate::{
    domain::{Account, AccountId, ModuleRecord, Owner, Prefix, UserId},
    errors::Error,
    repository::{ModuleRecordUpdate, NewAccount, Repository},
    Result,
};

pub struct SqliteRepository {
    conn: Arc<Mutex<Option<Connection>>>,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS accounts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER UNIQUE NOT NULL,
    api_id TEXT NOT NULL,
    api_hash TEXT NOT NULL,
    prefix TEXT NOT NULL DEFAULT '.',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS owners (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    account_id INTEGER NOT NULL,
    owner_id INTEGER NOT NULL,
    is_admin INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    FOREIGN KEY (account_id) REFERENCES accounts (id) ON DELETE CASCADE,
    UNIQUE(account_id, owner_id)
);

CREATE TABLE IF NOT EXISTS settings (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    account_id INTEGER NOT NULL,
    key TEXT NOT NULL,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    FOREIGN KEY (account_id) REFERENCES accounts (id) ON DELETE CASCADE,
    UNIQUE(account_id, key)
);

CREATE TABLE IF NOT EXISTS modules (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    account_id INTEGER NOT NULL,
    module_name TEXT NOT NULL,
    enabled INTEGER NOT NULL DEFAULT 1,
    version TEXT NOT NULL,
    developer TEXT NOT NULL,
    description TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    FOREIGN KEY (account_id) REFERENCES accounts (id) ON DELETE CASCADE,
    UNIQUE(account_id, module_name)
);
";

impl SqliteRepository {
    /// Open (or create) the database file and make sure the schema exists.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(Some(conn))),
        })
    }

    async fn with_tx<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Transaction<'_>) -> rusqlite::Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || -> Result<T> {
            let mut guard = conn.lock().unwrap_or_else(|p| p.into_inner());
            let conn = guard.as_mut().ok_or(Error::RepositoryClosed)?;
            let tx = conn.transaction()?;
            let out = f(&tx)?;
            tx.commit()?;
            Ok(out)
        })
        .await
        .map_err(|e| Error::External(format!("repository task failed: {e}")))?
    }
}

fn now() -> String {
    Utc::now().to_rfc3339()
}

fn parse_ts(raw: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_default()
}

fn row_to_account(row: &Row<'_>) -> rusqlite::Result<Account> {
    let prefix: String = row.get("prefix")?;
    Ok(Account {
        id: AccountId(row.get("id")?),
        external_user_id: UserId(row.get("user_id")?),
        api_id: row.get("api_id")?,
        api_hash: row.get("api_hash")?,
        prefix: Prefix::parse(&prefix).unwrap_or_default(),
        created_at: parse_ts(row.get("created_at")?),
        updated_at: parse_ts(row.get("updated_at")?),
    })
}

fn row_to_module_record(row: &Row<'_>) -> rusqlite::Result<ModuleRecord> {
    Ok(ModuleRecord {
        account_id: AccountId(row.get("account_id")?),
        module_name: row.get("module_name")?,
        enabled: row.get::<_, i64>("enabled")? != 0,
        version: row.get("version")?,
        developer: row.get("developer")?,
        description: row.get("description")?,
    })
}

const ACCOUNT_COLUMNS: &str = "id, user_id, api_id, api_hash, prefix, created_at, updated_at";

#[async_trait]
impl Repository for SqliteRepository {
    async fn add_account(&self, account: NewAccount) -> Result<AccountId> {
        self.with_tx(move |tx| {
            let ts = now();
            tx.execute(
                "INSERT INTO accounts (user_id, api_id, api_hash, prefix, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)
                 ON CONFLICT(user_id) DO UPDATE SET
                    api_id = excluded.api_id,
                    api_hash = excluded.api_hash,
                    prefix = excluded.prefix,
                    updated_at = excluded.updated_at",
                params![
                    account.external_user_id.0,
                    account.api_id,
                    account.api_hash,
                    account.prefix.as_str(),
                    ts
                ],
            )?;
            let id: i64 = tx.query_row(
                "SELECT id FROM accounts WHERE user_id = ?1",
                params![account.external_user_id.0],
                |row| row.get(0),
            )?;
            tx.execute(
                "INSERT INTO owners (account_id, owner_id, is_admin, created_at)
                 VALUES (?1, ?2, 1, ?3)
                 ON CONFLICT(account_id, owner_id) DO NOTHING",
                params![id, account.external_user_id.0, ts],
            )?;
            Ok(AccountId(id))
        })
        .await
    }

    async fn get_account_by_external_id(&self, user_id: UserId) -> Result<Option<Account>> {
        self.with_tx(move |tx| {
            tx.query_row(
                &format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE user_id = ?1"),
                params![user_id.0],
                row_to_account,
            )
            .optional()
        })
        .await
    }

    async fn get_account_by_id(&self, id: AccountId) -> Result<Option<Account>> {
        self.with_tx(move |tx| {
            tx.query_row(
                &format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = ?1"),
                params![id.0],
                row_to_account,
            )
            .optional()
        })
        .await
    }

    async fn list_accounts(&self) -> Result<Vec<Account>> {
        self.with_tx(move |tx| {
            let mut stmt =
                tx.prepare(&format!("SELECT {ACCOUNT_COLUMNS} FROM accounts ORDER BY id"))?;
            let rows = stmt.query_map([], row_to_account)?;
            rows.collect()
        })
        .await
    }

    async fn remove_account(&self, id: AccountId) -> Result<bool> {
        self.with_tx(move |tx| {
            tx.execute("DELETE FROM owners WHERE account_id = ?1", params![id.0])?;
            tx.execute("DELETE FROM settings WHERE account_id = ?1", params![id.0])?;
            tx.execute("DELETE FROM modules WHERE account_id = ?1", params![id.0])?;
            let n = tx.execute("DELETE FROM accounts WHERE id = ?1", params![id.0])?;
            Ok(n > 0)
        })
        .await
    }

    async fn add_owner(&self, id: AccountId, user_id: UserId, is_admin: bool) -> Result<()> {
        self.with_tx(move |tx| {
            tx.execute(
                "INSERT INTO owners (account_id, owner_id, is_admin, created_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(account_id, owner_id) DO UPDATE SET is_admin = excluded.is_admin",
                params![id.0, user_id.0, is_admin as i64, now()],
            )?;
            Ok(())
        })
        .await
    }

    async fn remove_owner(&self, id: AccountId, user_id: UserId) -> Result<bool> {
        self.with_tx(move |tx| {
            let n = tx.execute(
                "DELETE FROM owners WHERE account_id = ?1 AND owner_id = ?2",
                params![id.0, user_id.0],
            )?;
            Ok(n > 0)
        })
        .await
    }

    async fn list_owners(&self, id: AccountId) -> Result<Vec<Owner>> {
        self.with_tx(move |tx| {
            let mut stmt = tx.prepare(
                "SELECT owner_id, is_admin FROM owners WHERE account_id = ?1 ORDER BY id",
            )?;
            let rows = stmt.query_map(params![id.0], |row| {
                Ok(Owner {
                    account_id: id,
                    owner_user_id: UserId(row.get(0)?),
                    is_admin: row.get::<_, i64>(1)? != 0,
                })
            })?;
            rows.collect()
        })
        .await
    }

    async fn is_owner(&self, id: AccountId, user_id: UserId) -> Result<bool> {
        self.with_tx(move |tx| {
            let hit: Option<i64> = tx
                .query_row(
                    "SELECT 1 FROM owners WHERE account_id = ?1 AND owner_id = ?2",
                    params![id.0, user_id.0],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(hit.is_some())
        })
        .await
    }

    async fn set_setting(&self, id: AccountId, key: &str, value: &str) -> Result<()> {
        let (key, value) = (key.to_string(), value.to_string());
        self.with_tx(move |tx| {
            tx.execute(
                "INSERT INTO settings (account_id, key, value, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(account_id, key) DO UPDATE SET
                    value = excluded.value,
                    updated_at = excluded.updated_at",
                params![id.0, key, value, now()],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_setting(&self, id: AccountId, key: &str) -> Result<Option<String>> {
        let key = key.to_string();
        self.with_tx(move |tx| {
            tx.query_row(
                "SELECT value FROM settings WHERE account_id = ?1 AND key = ?2",
                params![id.0, key],
                |row| row.get(0),
            )
            .optional()
        })
        .await
    }

    async fn delete_setting(&self, id: AccountId, key: &str) -> Result<bool> {
        let key = key.to_string();
        self.with_tx(move |tx| {
            let n = tx.execute(
                "DELETE FROM settings WHERE account_id = ?1 AND key = ?2",
                params![id.0, key],
            )?;
            Ok(n > 0)
        })
        .await
    }

    async fn list_settings(&self, id: AccountId) -> Result<BTreeMap<String, String>> {
        self.with_tx(move |tx| {
            let mut stmt = tx.prepare("SELECT key, value FROM settings WHERE account_id = ?1")?;
            let rows = stmt.query_map(params![id.0], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            rows.collect()
        })
        .await
    }

    async fn upsert_module_record(
        &self,
        id: AccountId,
        record: ModuleRecordUpdate,
    ) -> Result<()> {
        self.with_tx(move |tx| {
            let ts = now();
            tx.execute(
                "INSERT INTO modules
                    (account_id, module_name, enabled, version, developer, description, created_at, updated_at)
                 VALUES (?1, ?2, 1, ?3, ?4, ?5, ?6, ?6)
                 ON CONFLICT(account_id, module_name) DO UPDATE SET
                    version = excluded.version,
                    developer = excluded.developer,
                    description = excluded.description,
                    updated_at = excluded.updated_at",
                params![
                    id.0,
                    record.module_name,
                    record.version,
                    record.developer,
                    record.description,
                    ts
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn enable_module(&self, id: AccountId, module_name: &str) -> Result<bool> {
        set_module_enabled(self, id, module_name, true).await
    }

    async fn disable_module(&self, id: AccountId, module_name: &str) -> Result<bool> {
        set_module_enabled(self, id, module_name, false).await
    }

    async fn list_enabled_modules(&self, id: AccountId) -> Result<Vec<String>> {
        self.with_tx(move |tx| {
            let mut stmt = tx.prepare(
                "SELECT module_name FROM modules
                 WHERE account_id = ?1 AND enabled = 1 ORDER BY module_name",
            )?;
            let rows = stmt.query_map(params![id.0], |row| row.get::<_, String>(0))?;
            rows.collect()
        })
        .await
    }

    async fn get_module_record(
        &self,
        id: AccountId,
        module_name: &str,
    ) -> Result<Option<ModuleRecord>> {
        let module_name = module_name.to_string();
        self.with_tx(move |tx| {
            tx.query_row(
                "SELECT account_id, module_name, enabled, version, developer, description
                 FROM modules WHERE account_id = ?1 AND module_name = ?2",
                params![id.0, module_name],
                row_to_module_record,
            )
            .optional()
        })
        .await
    }

    async fn close(&self) -> Result<()> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let taken = conn.lock().unwrap_or_else(|p| p.into_inner()).take();
            if let Some(conn) = taken {
                conn.close().map_err(|(_, e)| Error::Repository(e))?;
            }
            Ok(())
        })
        .await
        .map_err(|e| Error::External(format!("repository task failed: {e}")))?
    }
}

async fn set_module_enabled(
    repo: &SqliteRepository,
    id: AccountId,
    module_name: &str,
    enabled: bool,
) -> Result<bool> {
    let module_name = module_name.to_string();
    repo.with_tx(move |tx| {
        let n = tx.execute(
            "UPDATE modules SET enabled = ?1, updated_at = ?2
             WHERE account_id = ?3 AND module_name = ?4",
            params![enabled as i64, now(), id.0, module_name],
        )?;
        Ok(n > 0)
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_account(user_id: i64) -> NewAccount {
        NewAccount {
            external_user_id: UserId(user_id),
            api_id: "12345".to_string(),
            api_hash: "hash".to_string(),
            prefix: Prefix::default(),
        }
    }

    fn record(name: &str, version: &str) -> ModuleRecordUpdate {
        ModuleRecordUpdate {
            module_name: name.to_string(),
            version: version.to_string(),
            developer: "dev".to_string(),
            description: "desc".to_string(),
        }
    }

    #[tokio::test]
    async fn add_account_makes_self_owner() {
        let repo = SqliteRepository::open_in_memory().unwrap();
        let id = repo.add_account(new_account(42)).await.unwrap();

        let account = repo.get_account_by_id(id).await.unwrap().unwrap();
        assert_eq!(account.external_user_id, UserId(42));
        assert_eq!(account.prefix.as_str(), ".");
        assert!(repo.is_owner(id, UserId(42)).await.unwrap());
        assert!(!repo.is_owner(id, UserId(7)).await.unwrap());
    }

    #[tokio::test]
    async fn add_account_upserts_on_external_id() {
        let repo = SqliteRepository::open_in_memory().unwrap();
        let first = repo.add_account(new_account(42)).await.unwrap();

        let mut again = new_account(42);
        again.api_hash = "rotated".to_string();
        again.prefix = Prefix::parse("!").unwrap();
        let second = repo.add_account(again).await.unwrap();

        assert_eq!(first, second);
        let accounts = repo.list_accounts().await.unwrap();
        assert_eq!(accounts.len(), 1);
        assert_eq!(accounts[0].api_hash, "rotated");
        assert_eq!(accounts[0].prefix.as_str(), "!");
        assert_eq!(repo.list_owners(first).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn remove_account_cascades() {
        let repo = SqliteRepository::open_in_memory().unwrap();
        let id = repo.add_account(new_account(1)).await.unwrap();
        let other = repo.add_account(new_account(2)).await.unwrap();
        repo.add_owner(id, UserId(99), false).await.unwrap();
        repo.set_setting(id, "prefix", "!").await.unwrap();
        repo.upsert_module_record(id, record("ping", "1.0"))
            .await
            .unwrap();

        assert!(repo.remove_account(id).await.unwrap());

        assert!(repo.list_owners(id).await.unwrap().is_empty());
        assert!(repo.list_settings(id).await.unwrap().is_empty());
        assert!(repo.list_enabled_modules(id).await.unwrap().is_empty());
        let remaining: Vec<_> = repo
            .list_accounts()
            .await
            .unwrap()
            .into_iter()
            .map(|a| a.id)
            .collect();
        assert_eq!(remaining, vec![other]);
        assert!(!repo.remove_account(id).await.unwrap());
    }

    #[tokio::test]
    async fn owners_add_remove() {
        let repo = SqliteRepository::open_in_memory().unwrap();
        let id = repo.add_account(new_account(1)).await.unwrap();

        repo.add_owner(id, UserId(5), false).await.unwrap();
        repo.add_owner(id, UserId(5), true).await.unwrap();
        let owners = repo.list_owners(id).await.unwrap();
        assert_eq!(owners.len(), 2);
        assert!(owners.iter().any(|o| o.owner_user_id == UserId(5) && o.is_admin));

        assert!(repo.remove_owner(id, UserId(5)).await.unwrap());
        assert!(!repo.remove_owner(id, UserId(5)).await.unwrap());
        assert!(!repo.is_owner(id, UserId(5)).await.unwrap());
    }

    #[tokio::test]
    async fn owner_for_unknown_account_is_rejected() {
        let repo = SqliteRepository::open_in_memory().unwrap();
        let err = repo.add_owner(AccountId(404), UserId(1), false).await;
        assert!(matches!(err, Err(Error::Repository(_))));
        assert!(repo.list_owners(AccountId(404)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn settings_last_write_wins() {
        let repo = SqliteRepository::open_in_memory().unwrap();
        let id = repo.add_account(new_account(1)).await.unwrap();

        repo.set_setting(id, "k", "a").await.unwrap();
        repo.set_setting(id, "k", "b").await.unwrap();
        assert_eq!(repo.get_setting(id, "k").await.unwrap().as_deref(), Some("b"));
        assert_eq!(repo.get_setting(id, "missing").await.unwrap(), None);

        assert!(repo.delete_setting(id, "k").await.unwrap());
        assert!(repo.list_settings(id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn module_records_keep_enabled_flag_across_upserts() {
        let repo = SqliteRepository::open_in_memory().unwrap();
        let id = repo.add_account(new_account(1)).await.unwrap();

        repo.upsert_module_record(id, record("ping", "1.0"))
            .await
            .unwrap();
        repo.upsert_module_record(id, record("help", "1.0"))
            .await
            .unwrap();
        assert!(repo.disable_module(id, "ping").await.unwrap());
        repo.upsert_module_record(id, record("ping", "2.0"))
            .await
            .unwrap();

        assert_eq!(repo.list_enabled_modules(id).await.unwrap(), vec!["help"]);
        let ping = repo.get_module_record(id, "ping").await.unwrap().unwrap();
        assert_eq!(ping.version, "2.0");
        assert!(!ping.enabled);

        assert!(repo.enable_module(id, "ping").await.unwrap());
        assert!(!repo.enable_module(id, "nope").await.unwrap());
        assert_eq!(
            repo.list_enabled_modules(id).await.unwrap(),
            vec!["help", "ping"]
        );
    }

    #[tokio::test]
    async fn closed_repository_fails_cleanly() {
        let repo = SqliteRepository::open_in_memory().unwrap();
        repo.close().await.unwrap();
        assert!(matches!(
            repo.list_accounts().await,
            Err(Error::RepositoryClosed)
        ));
        repo.close().await.unwrap();
    }

    #[tokio::test]
    async fn file_database_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/forelka.db");
        {
            let repo = SqliteRepository::open(&path).unwrap();
            repo.add_account(new_account(3)).await.unwrap();
            repo.close().await.unwrap();
        }
        let repo = SqliteRepository::open(&path).unwrap();
        assert!(repo
            .get_account_by_external_id(UserId(3))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn waiting_query_leaves_the_runtime_free() {
        let repo = Arc::new(SqliteRepository::open_in_memory().unwrap());
        let conn = repo.conn.clone();
        let (locked_tx, locked_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let holder = std::thread::spawn(move || {
            let _guard = conn.lock().unwrap();
            locked_tx.send(()).unwrap();
            let _ = release_rx.recv();
        });
        locked_rx.recv().unwrap();

        let pending = tokio::spawn({
            let repo = repo.clone();
            async move { repo.list_accounts().await }
        });
        // Timers keep firing on this single-threaded runtime while the query waits.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!pending.is_finished());

        release_tx.send(()).unwrap();
        holder.join().unwrap();
        assert!(pending.await.unwrap().unwrap().is_empty());
    }
}
