//! Hand-written fakes shared by the unit tests.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, AtomicI32, Ordering},
        Arc, Mutex,
    },
};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::{
    config::ConfigStore,
    domain::{ChatId, Credentials, MessageId, MessageRef, Prefix, UserId},
    errors::Error,
    host::Host,
    repository::{NewAccount, Repository, SqliteRepository},
    session::Session,
    transport::{IncomingMessage, TextFormat, Transport, TransportSession},
    Result,
};

pub const TEST_CHAT: ChatId = ChatId(-100);

pub struct FakeSession {
    me: UserId,
    next_id: AtomicI32,
    sent: Mutex<Vec<(ChatId, String, TextFormat)>>,
    groups: Mutex<Vec<String>>,
    supports_groups: bool,
    tx: Mutex<Option<mpsc::Sender<IncomingMessage>>>,
    rx: Mutex<Option<mpsc::Receiver<IncomingMessage>>>,
    disconnected: AtomicBool,
}

impl FakeSession {
    pub fn new(me: UserId) -> Arc<Self> {
        Self::build(me, true)
    }

    pub fn without_groups(me: UserId) -> Arc<Self> {
        Self::build(me, false)
    }

    fn build(me: UserId, supports_groups: bool) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(64);
        Arc::new(Self {
            me,
            next_id: AtomicI32::new(1),
            sent: Mutex::new(Vec::new()),
            groups: Mutex::new(Vec::new()),
            supports_groups,
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(Some(rx)),
            disconnected: AtomicBool::new(false),
        })
    }

    pub fn sent(&self) -> Vec<(ChatId, String)> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|(c, t, _)| (*c, t.clone()))
            .collect()
    }

    pub fn sent_texts(&self) -> Vec<String> {
        self.sent().into_iter().map(|(_, t)| t).collect()
    }

    pub fn created_groups(&self) -> Vec<String> {
        self.groups.lock().unwrap().clone()
    }

    pub async fn push(&self, msg: IncomingMessage) {
        let tx = self.tx.lock().unwrap().clone().expect("incoming stream closed");
        tx.send(msg).await.unwrap();
    }

    /// End the incoming stream the way a dropped connection would.
    pub fn close_incoming(&self) {
        self.tx.lock().unwrap().take();
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransportSession for FakeSession {
    fn me(&self) -> UserId {
        self.me
    }

    async fn send(&self, chat_id: ChatId, text: &str, format: TextFormat) -> Result<MessageRef> {
        self.sent
            .lock()
            .unwrap()
            .push((chat_id, text.to_string(), format));
        Ok(MessageRef {
            chat_id,
            message_id: MessageId(self.next_id.fetch_add(1, Ordering::SeqCst)),
        })
    }

    async fn create_group(&self, title: &str, _members: &[UserId]) -> Result<ChatId> {
        if !self.supports_groups {
            return Err(Error::Unsupported("create_group"));
        }
        let mut groups = self.groups.lock().unwrap();
        groups.push(title.to_string());
        Ok(ChatId(-1000 - groups.len() as i64))
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<IncomingMessage>> {
        self.rx
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| Error::Transport("already subscribed".to_string()))
    }

    async fn disconnect(&self) -> Result<()> {
        self.disconnected.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Connects every account except the ones marked as failing.
#[derive(Default)]
pub struct FakeTransport {
    failing: HashSet<UserId>,
    sessions: Mutex<HashMap<UserId, Arc<FakeSession>>>,
}

impl FakeTransport {
    pub fn failing(ids: impl IntoIterator<Item = UserId>) -> Self {
        Self {
            failing: ids.into_iter().collect(),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn session(&self, user: UserId) -> Option<Arc<FakeSession>> {
        self.sessions.lock().unwrap().get(&user).cloned()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn connect(&self, credentials: &Credentials) -> Result<Arc<dyn TransportSession>> {
        let user = credentials.external_user_id;
        if self.failing.contains(&user) {
            return Err(Error::Connect(format!("refused {user}")));
        }
        let session = FakeSession::new(user);
        self.sessions.lock().unwrap().insert(user, session.clone());
        let session: Arc<dyn TransportSession> = session;
        Ok(session)
    }
}

pub struct Fixture {
    pub host: Arc<Host>,
    pub session: Arc<Session>,
    pub transport: Arc<FakeSession>,
    pub owner: UserId,
    pub dir: tempfile::TempDir,
}

pub fn test_config(dir: &std::path::Path, overrides: &[(&str, Value)]) -> Arc<ConfigStore> {
    let config = ConfigStore::from_value(
        dir.join("config.json"),
        json!({
            "log_file": "",
            "modules": {
                "modules_dir": dir.join("modules"),
                "loaded_modules_dir": dir.join("loaded_modules"),
                "install_command": ["false"],
                "request_timeout_secs": 5,
            },
            "transport": { "throttle": false },
        }),
    );
    for (key, value) in overrides {
        config.set(key, value.clone()).unwrap();
    }
    Arc::new(config)
}

pub async fn fixture() -> Fixture {
    fixture_with(&[]).await
}

pub async fn fixture_with(overrides: &[(&str, Value)]) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path(), overrides);
    let repo: Arc<dyn Repository> = Arc::new(SqliteRepository::open_in_memory().unwrap());
    let owner = UserId(1000);
    let account_id = repo
        .add_account(NewAccount {
            external_user_id: owner,
            api_id: "1".to_string(),
            api_hash: "hash".to_string(),
            prefix: Prefix::default(),
        })
        .await
        .unwrap();
    let account = repo.get_account_by_id(account_id).await.unwrap().unwrap();

    let host = Host::new(config, repo);
    let transport = FakeSession::new(owner);
    let session = Arc::new(Session::new(account, transport.clone()));
    Fixture {
        host,
        session,
        transport,
        owner,
        dir,
    }
}

pub fn text_from(sender: UserId, text: &str) -> IncomingMessage {
    IncomingMessage {
        chat_id: TEST_CHAT,
        message_id: MessageId(1),
        sender_id: Some(sender),
        text: Some(text.to_string()),
        reply_to_sender: None,
    }
}
