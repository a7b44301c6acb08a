use std::{sync::Arc, time::Duration};

use tokio::time::Instant;

use crate::{
    domain::{Account, AccountId, ChatId, Owner, Prefix, UserId},
    repository::{self, Repository, LOG_CHAT_SETTING},
    transport::TransportSession,
    Result,
};

/// Live runtime state of one connected account.
///
/// Composed once when the transport connects. Prefix and owners are not cached
/// here; they are read from the repository whenever they are needed.
pub struct Session {
    account: Account,
    transport: Arc<dyn TransportSession>,
    me: UserId,
    started_at: Instant,
}

impl Session {
    pub fn new(account: Account, transport: Arc<dyn TransportSession>) -> Self {
        let me = transport.me();
        Self {
            account,
            transport,
            me,
            started_at: Instant::now(),
        }
    }

    pub fn account(&self) -> &Account {
        &self.account
    }

    pub fn account_id(&self) -> AccountId {
        self.account.id
    }

    /// The account's own user id on the network.
    pub fn me(&self) -> UserId {
        self.me
    }

    pub fn transport(&self) -> &Arc<dyn TransportSession> {
        &self.transport
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub async fn prefix(&self, repo: &dyn Repository) -> Result<Prefix> {
        repository::current_prefix(repo, &self.account).await
    }

    pub async fn owners(&self, repo: &dyn Repository) -> Result<Vec<Owner>> {
        repo.list_owners(self.account.id).await
    }

    /// Where service notices go: the log chat when one was set up, else the
    /// account's own chat.
    pub async fn notice_chat(&self, repo: &dyn Repository) -> ChatId {
        match repo.get_setting(self.account.id, LOG_CHAT_SETTING).await {
            Ok(Some(raw)) => raw
                .trim()
                .parse::<i64>()
                .map(ChatId)
                .unwrap_or_else(|_| self.me.into()),
            _ => self.me.into(),
        }
    }
}
