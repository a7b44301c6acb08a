use std::fmt;

use chrono::{DateTime, Utc};

use crate::{errors::Error, Result};

/// Durable surrogate key of a managed account.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AccountId(pub i64);

/// Chat-network user id (numeric).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UserId(pub i64);

/// Chat-network chat id (numeric).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ChatId(pub i64);

/// Chat-network message id (numeric).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MessageId(pub i32);

/// A stable reference to a sent or received message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MessageRef {
    pub chat_id: ChatId,
    pub message_id: MessageId,
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<UserId> for ChatId {
    /// Private chats share the user's id ("saved messages" for the account itself).
    fn from(u: UserId) -> Self {
        ChatId(u.0)
    }
}

pub const DEFAULT_PREFIX: &str = ".";
const MAX_PREFIX_CHARS: usize = 3;

/// Command prefix: 1-3 non-whitespace characters.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Prefix(String);

impl Prefix {
    pub fn parse(raw: &str) -> Result<Self> {
        let count = raw.chars().count();
        if count == 0 || count > MAX_PREFIX_CHARS || raw.chars().any(char::is_whitespace) {
            return Err(Error::InvalidPrefix(raw.to_string()));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for Prefix {
    fn default() -> Self {
        Self(DEFAULT_PREFIX.to_string())
    }
}

impl fmt::Display for Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Transport credentials of an account.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Credentials {
    pub external_user_id: UserId,
    pub api_id: String,
    pub api_hash: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Account {
    pub id: AccountId,
    pub external_user_id: UserId,
    pub api_id: String,
    pub api_hash: String,
    pub prefix: Prefix,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    pub fn credentials(&self) -> Credentials {
        Credentials {
            external_user_id: self.external_user_id,
            api_id: self.api_id.clone(),
            api_hash: self.api_hash.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Owner {
    pub account_id: AccountId,
    pub owner_user_id: UserId,
    pub is_admin: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModuleRecord {
    pub account_id: AccountId,
    pub module_name: String,
    pub enabled: bool,
    pub version: String,
    pub developer: String,
    pub description: String,
}
