//! Owns the live account sessions.
//!
//! Per account: UNCONFIGURED -> CONNECTING -> ACTIVE -> STOPPING -> STOPPED,
//! or CONNECTING -> FAILED, or ACTIVE -> FAILED when the transport drops its
//! message stream. One failing account never aborts the others.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex as StdMutex},
};

use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    dispatch::dispatch,
    domain::{Account, AccountId, ChatId, Prefix, UserId},
    formatting::code,
    host::Host,
    modules::builtin::alias::restore_aliases,
    repository::{NewAccount, LOG_CHAT_SETTING},
    session::Session,
    transport::{
        throttled::{ThrottleConfig, ThrottledSession},
        IncomingMessage, TextFormat, Transport, TransportSession,
    },
    Error, Result,
};

pub const LOG_CHAT_TITLE: &str = "Forelka Logs";
pub const INLINE_BOT_TOKEN_SETTING: &str = "inline_bot_token";
pub const INLINE_BOT_OWNER_SETTING: &str = "inline_bot_owner_id";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Unconfigured,
    Connecting,
    Active,
    Stopping,
    Stopped,
    Failed,
}

struct SessionHandle {
    session: Arc<Session>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Live handles and per-account states, shared with the receive loops so a
/// loop can release its own session when the stream ends.
///
/// The handle lock is never held across a network await.
#[derive(Default)]
struct LiveSessions {
    handles: Mutex<HashMap<AccountId, SessionHandle>>,
    states: StdMutex<HashMap<AccountId, SessionState>>,
}

impl LiveSessions {
    fn state(&self, account_id: AccountId) -> SessionState {
        self.states_guard()
            .get(&account_id)
            .copied()
            .unwrap_or(SessionState::Unconfigured)
    }

    fn set_state(&self, account_id: AccountId, state: SessionState) {
        debug!(%account_id, ?state, "session state");
        self.states_guard().insert(account_id, state);
    }

    fn states_guard(&self) -> std::sync::MutexGuard<'_, HashMap<AccountId, SessionState>> {
        self.states.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Drop `session` after its stream closed on its own. A concurrent stop
    /// that already took the handle owns the cleanup instead.
    async fn release_closed(&self, session: &Arc<Session>) {
        let account_id = session.account_id();
        let released = {
            let mut handles = self.handles.lock().await;
            let ours = handles
                .get(&account_id)
                .is_some_and(|h| Arc::ptr_eq(&h.session, session));
            if ours {
                handles.remove(&account_id)
            } else {
                None
            }
        };
        if released.is_none() {
            return;
        }
        if let Err(e) = session.transport().disconnect().await {
            warn!(%account_id, error = %e, "disconnect failed");
        }
        self.set_state(account_id, SessionState::Failed);
        warn!(%account_id, "account session lost; start it again to reconnect");
    }
}

pub struct Supervisor {
    host: Arc<Host>,
    transport: Arc<dyn Transport>,
    live: Arc<LiveSessions>,
}

impl Supervisor {
    pub fn new(host: Arc<Host>, transport: Arc<dyn Transport>) -> Self {
        Self {
            host,
            transport,
            live: Arc::new(LiveSessions::default()),
        }
    }

    pub fn host(&self) -> &Arc<Host> {
        &self.host
    }

    pub fn state(&self, account_id: AccountId) -> SessionState {
        self.live.state(account_id)
    }

    fn set_state(&self, account_id: AccountId, state: SessionState) {
        self.live.set_state(account_id, state);
    }

    /// Load modules, connect every account and block until `shutdown` fires.
    ///
    /// Returns early (and cleanly) when there is no account or none connects.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let accounts = self.host.repo().list_accounts().await?;
        if accounts.is_empty() {
            warn!("no accounts configured; add one with --add-account");
            self.close_repository().await;
            return Ok(());
        }

        let modules = self.host.modules();
        let mut loaded = modules.load_builtins(&self.host).await;
        if modules.config().auto_load {
            loaded += modules
                .discover_and_load_all(&self.host, &modules.config().directories())
                .await;
        }
        info!(modules = loaded, "modules ready");

        let active = self.start_all().await?;
        if active == 0 {
            error!("no account could be started");
            self.stop_all().await;
            return Ok(());
        }
        info!(active, total = accounts.len(), "accounts started");
        self.send_startup_notifications().await;

        shutdown.cancelled().await;
        info!("shutdown requested");
        self.stop_all().await;
        Ok(())
    }

    /// Start every persisted account. Returns how many became active.
    pub async fn start_all(&self) -> Result<usize> {
        let mut active = 0;
        for account in self.host.repo().list_accounts().await? {
            let account_id = account.id;
            match self.start_account(account).await {
                Ok(_) => active += 1,
                Err(e) => error!(%account_id, error = %e, "failed to start account"),
            }
        }
        Ok(active)
    }

    /// Connect one account and attach the dispatch loop. A live session for
    /// the same account is returned as-is; a second start while the first is
    /// still connecting is refused.
    pub async fn start_account(&self, account: Account) -> Result<Arc<Session>> {
        let account_id = account.id;
        {
            let handles = self.live.handles.lock().await;
            if let Some(existing) = handles.get(&account_id) {
                return Ok(existing.session.clone());
            }
            if self.state(account_id) == SessionState::Connecting {
                return Err(Error::Connect(format!(
                    "account {account_id} is already connecting"
                )));
            }
            self.set_state(account_id, SessionState::Connecting);
        }

        let transport = match self.transport.connect(&account.credentials()).await {
            Ok(t) => t,
            Err(e) => {
                self.set_state(account_id, SessionState::Failed);
                return Err(e);
            }
        };
        let transport = self.wrap_transport(transport);
        let incoming = match transport.subscribe().await {
            Ok(rx) => rx,
            Err(e) => {
                self.set_state(account_id, SessionState::Failed);
                let _ = transport.disconnect().await;
                return Err(e);
            }
        };

        let session = Arc::new(Session::new(account, transport));
        self.post_connect_setup(&session).await;
        if let Err(e) = restore_aliases(
            self.host.repo().as_ref(),
            self.host.commands(),
            account_id,
        )
        .await
        {
            warn!(%account_id, error = %e, "failed to restore aliases");
        }

        let mut handles = self.live.handles.lock().await;
        if self.state(account_id) != SessionState::Connecting {
            // Stopped while connecting.
            drop(handles);
            if let Err(e) = session.transport().disconnect().await {
                warn!(%account_id, error = %e, "disconnect failed");
            }
            self.set_state(account_id, SessionState::Stopped);
            return Err(Error::Connect(format!(
                "start of account {account_id} was cancelled"
            )));
        }
        let cancel = CancellationToken::new();
        let task = tokio::spawn(receive_loop(
            self.host.clone(),
            self.live.clone(),
            session.clone(),
            incoming,
            cancel.clone(),
        ));
        handles.insert(
            account_id,
            SessionHandle {
                session: session.clone(),
                cancel,
                task,
            },
        );
        self.set_state(account_id, SessionState::Active);
        drop(handles);
        info!(%account_id, me = %session.me(), "account session active");
        Ok(session)
    }

    fn wrap_transport(&self, transport: Arc<dyn TransportSession>) -> Arc<dyn TransportSession> {
        let cfg = self.host.config().transport_config();
        if cfg.throttle {
            Arc::new(ThrottledSession::new(transport, ThrottleConfig::from(&cfg)))
        } else {
            transport
        }
    }

    /// Optional one-time setup; every failure here is only a warning.
    async fn post_connect_setup(&self, session: &Session) {
        let repo = self.host.repo();
        let account_id = session.account_id();

        match repo.get_setting(account_id, LOG_CHAT_SETTING).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                if let Err(e) = self.create_log_chat(session).await {
                    warn!(%account_id, error = %e, "log chat setup skipped");
                }
            }
            Err(e) => warn!(%account_id, error = %e, "cannot read log chat setting"),
        }

        let inline = self.host.config().inline_bot_config();
        if inline.owner_id != 0 {
            let owner = UserId(inline.owner_id);
            match repo.add_owner(account_id, owner, true).await {
                Ok(()) => debug!(%account_id, %owner, "configured owner seeded"),
                Err(e) => warn!(%account_id, %owner, error = %e, "cannot seed configured owner"),
            }
        }
        if inline.enabled && !inline.token.trim().is_empty() {
            let owner = if inline.owner_id != 0 {
                inline.owner_id
            } else {
                session.me().0
            };
            let stored = async {
                repo.set_setting(account_id, INLINE_BOT_TOKEN_SETTING, inline.token.trim())
                    .await?;
                repo.set_setting(account_id, INLINE_BOT_OWNER_SETTING, &owner.to_string())
                    .await
            };
            if let Err(e) = stored.await {
                warn!(%account_id, error = %e, "inline bot registration skipped");
            }
        }
    }

    async fn create_log_chat(&self, session: &Session) -> Result<ChatId> {
        let transport = session.transport();
        let chat = transport
            .create_group(LOG_CHAT_TITLE, &[session.me()])
            .await?;
        self.host
            .repo()
            .set_setting(session.account_id(), LOG_CHAT_SETTING, &chat.0.to_string())
            .await?;
        transport
            .send(
                chat,
                "👋 <b>Welcome to Forelka</b>\nService notices for this account will appear here.",
                TextFormat::Html,
            )
            .await?;
        info!(account_id = %session.account_id(), chat_id = chat.0, "log chat created");
        Ok(chat)
    }

    async fn send_startup_notifications(&self) {
        let modules = self.host.modules().loaded_names().await.len();
        let sessions: Vec<Arc<Session>> = self
            .live
            .handles
            .lock()
            .await
            .values()
            .map(|h| h.session.clone())
            .collect();
        for session in sessions {
            let repo = self.host.repo().as_ref();
            let prefix = session
                .prefix(repo)
                .await
                .unwrap_or_else(|_| session.account().prefix.clone());
            let chat = session.notice_chat(repo).await;
            let text = format!(
                "🚀 <b>Forelka started</b>\n<b>Account:</b> {}\n<b>Prefix:</b> {}\n<b>Modules:</b> {modules}",
                code(&session.me().to_string()),
                code(prefix.as_str()),
            );
            if let Err(e) = session.transport().send(chat, &text, TextFormat::Html).await {
                warn!(account_id = %session.account_id(), error = %e, "startup notification failed");
            }
        }
    }

    /// Stop one session: end its receive loop, let the in-flight handler
    /// finish, then disconnect.
    pub async fn stop_account(&self, account_id: AccountId) -> bool {
        let handle = {
            let mut handles = self.live.handles.lock().await;
            let handle = handles.remove(&account_id);
            if handle.is_none() && self.state(account_id) == SessionState::Connecting {
                // The pending start sees this and drops its connection.
                self.set_state(account_id, SessionState::Stopping);
            }
            handle
        };
        let Some(handle) = handle else {
            return false;
        };
        self.stop_handle(account_id, handle).await;
        true
    }

    async fn stop_handle(&self, account_id: AccountId, handle: SessionHandle) {
        self.set_state(account_id, SessionState::Stopping);
        handle.cancel.cancel();
        if let Err(e) = handle.task.await {
            warn!(%account_id, error = %e, "receive loop ended abnormally");
        }
        if let Err(e) = handle.session.transport().disconnect().await {
            warn!(%account_id, error = %e, "disconnect failed");
        }
        self.set_state(account_id, SessionState::Stopped);
        info!(%account_id, "account session stopped");
    }

    /// Stop every session, then close the repository.
    pub async fn stop_all(&self) {
        let handles: Vec<(AccountId, SessionHandle)> =
            self.live.handles.lock().await.drain().collect();
        for (account_id, handle) in handles {
            self.stop_handle(account_id, handle).await;
        }
        self.close_repository().await;
    }

    async fn close_repository(&self) {
        if let Err(e) = self.host.repo().close().await {
            warn!(error = %e, "failed to close repository");
        }
    }

    pub async fn session(&self, account_id: AccountId) -> Option<Arc<Session>> {
        self.live
            .handles
            .lock()
            .await
            .get(&account_id)
            .map(|h| h.session.clone())
    }

    pub async fn active_accounts(&self) -> Vec<AccountId> {
        let mut ids: Vec<_> = self.live.handles.lock().await.keys().copied().collect();
        ids.sort();
        ids
    }

    pub async fn add_account(
        &self,
        user_id: UserId,
        api_id: &str,
        api_hash: &str,
        prefix: Option<&str>,
    ) -> Result<AccountId> {
        let prefix = match prefix {
            Some(raw) => Prefix::parse(raw)?,
            None => Prefix::default(),
        };
        let id = self
            .host
            .repo()
            .add_account(NewAccount {
                external_user_id: user_id,
                api_id: api_id.to_string(),
                api_hash: api_hash.to_string(),
                prefix,
            })
            .await?;
        info!(account_id = %id, %user_id, "account saved");
        Ok(id)
    }

    /// Stops the live session first, then removes the account and its rows.
    pub async fn remove_account(&self, user_id: UserId) -> Result<bool> {
        let Some(account) = self.host.repo().get_account_by_external_id(user_id).await? else {
            return Ok(false);
        };
        self.stop_account(account.id).await;
        let removed = self.host.repo().remove_account(account.id).await?;
        if removed {
            info!(account_id = %account.id, %user_id, "account removed");
        }
        Ok(removed)
    }

    /// Grant `owner_id` owner and admin rights on the account of `user_id`.
    /// Returns `false` when no such account exists.
    pub async fn add_owner(&self, user_id: UserId, owner_id: UserId) -> Result<bool> {
        let repo = self.host.repo();
        let Some(account) = repo.get_account_by_external_id(user_id).await? else {
            return Ok(false);
        };
        repo.add_owner(account.id, owner_id, true).await?;
        info!(account_id = %account.id, owner = %owner_id, "owner added");
        Ok(true)
    }

    pub async fn list_accounts(&self) -> Result<Vec<Account>> {
        self.host.repo().list_accounts().await
    }
}

async fn receive_loop(
    host: Arc<Host>,
    live: Arc<LiveSessions>,
    session: Arc<Session>,
    mut incoming: mpsc::Receiver<IncomingMessage>,
    cancel: CancellationToken,
) {
    let account_id = session.account_id();
    loop {
        // Only the wait for the next message is cancellable; a dispatch in
        // progress runs to completion.
        let msg = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            msg = incoming.recv() => msg,
        };
        let Some(msg) = msg else {
            warn!(%account_id, "incoming message stream closed");
            live.release_closed(&session).await;
            break;
        };
        let outcome = dispatch(&host, &session, msg).await;
        debug!(%account_id, ?outcome, "message handled");
    }
}
