//! Telegram adapter (teloxide).
//!
//! Implements the `forelka-core` transport over the Telegram Bot API. The
//! account's `api_id` and `api_hash` together form the bot token
//! (`"{api_id}:{api_hash}"`), which is the shape BotFather hands out.

use std::sync::Arc;

use async_trait::async_trait;
use teloxide::{
    dispatching::{Dispatcher, ShutdownToken},
    dptree,
    prelude::*,
    types::ParseMode,
};
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
    time::sleep,
};
use tracing::{debug, info, warn};

use forelka_core::{
    domain::{ChatId, Credentials, MessageId, MessageRef, UserId},
    errors::Error,
    transport::{IncomingMessage, TextFormat, Transport, TransportSession},
    Result,
};

const INCOMING_BUFFER: usize = 256;

/// Connects accounts through the Bot API.
#[derive(Clone, Debug, Default)]
pub struct TelegramTransport;

impl TelegramTransport {
    pub fn new() -> Self {
        Self
    }

    fn token(credentials: &Credentials) -> Result<String> {
        let id = credentials.api_id.trim();
        let hash = credentials.api_hash.trim();
        if id.is_empty() || hash.is_empty() {
            return Err(Error::Connect("api_id and api_hash must both be set".to_string()));
        }
        Ok(format!("{id}:{hash}"))
    }
}

#[async_trait]
impl Transport for TelegramTransport {
    async fn connect(&self, credentials: &Credentials) -> Result<Arc<dyn TransportSession>> {
        let bot = Bot::new(Self::token(credentials)?);
        let me = bot
            .get_me()
            .await
            .map_err(|e| Error::Connect(format!("telegram get_me failed: {e}")))?;
        let me_id = UserId(me.id.0 as i64);
        if me_id != credentials.external_user_id {
            warn!(
                configured = %credentials.external_user_id,
                actual = %me_id,
                "bot id differs from the configured user id"
            );
        }
        info!(user = %me_id, username = %me.username(), "connected to telegram");

        let session: Arc<dyn TransportSession> = Arc::new(TelegramSession::new(bot, me_id));
        Ok(session)
    }
}

struct Running {
    shutdown: ShutdownToken,
    task: JoinHandle<()>,
}

/// One connected bot.
pub struct TelegramSession {
    bot: Bot,
    me: UserId,
    running: Mutex<Option<Running>>,
    subscribed: std::sync::atomic::AtomicBool,
}

impl TelegramSession {
    pub fn new(bot: Bot, me: UserId) -> Self {
        Self {
            bot,
            me,
            running: Mutex::new(None),
            subscribed: std::sync::atomic::AtomicBool::new(false),
        }
    }

    fn tg_chat(chat_id: ChatId) -> teloxide::types::ChatId {
        teloxide::types::ChatId(chat_id.0)
    }

    fn map_err(e: teloxide::RequestError) -> Error {
        Error::Transport(format!("telegram error: {e}"))
    }

    async fn with_retry<T, Fut>(&self, mut op: impl FnMut() -> Fut) -> Result<T>
    where
        Fut: std::future::IntoFuture<Output = std::result::Result<T, teloxide::RequestError>>,
        Fut::IntoFuture: Send,
    {
        const MAX_RETRIES: usize = 1;
        let mut attempts = 0usize;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) => match e {
                    teloxide::RequestError::RetryAfter(d) if attempts < MAX_RETRIES => {
                        attempts += 1;
                        sleep(d).await;
                        continue;
                    }
                    other => return Err(Self::map_err(other)),
                },
            }
        }
    }
}

fn to_incoming(msg: &Message) -> IncomingMessage {
    let user_id = |u: &teloxide::types::User| UserId(u.id.0 as i64);
    IncomingMessage {
        chat_id: ChatId(msg.chat.id.0),
        message_id: MessageId(msg.id.0),
        sender_id: msg.from().map(user_id),
        text: msg.text().map(str::to_string),
        reply_to_sender: msg
            .reply_to_message()
            .and_then(|r| r.from())
            .map(user_id),
    }
}

#[async_trait]
impl TransportSession for TelegramSession {
    fn me(&self) -> UserId {
        self.me
    }

    async fn send(&self, chat_id: ChatId, text: &str, format: TextFormat) -> Result<MessageRef> {
        let msg = self
            .with_retry(|| {
                let req = self.bot.send_message(Self::tg_chat(chat_id), text.to_string());
                match format {
                    TextFormat::Html => req.parse_mode(ParseMode::Html),
                    TextFormat::Plain => req,
                }
            })
            .await?;

        Ok(MessageRef {
            chat_id,
            message_id: MessageId(msg.id.0),
        })
    }

    async fn create_group(&self, _title: &str, _members: &[UserId]) -> Result<ChatId> {
        // Bots cannot create chats through the Bot API.
        Err(Error::Unsupported("create_group"))
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<IncomingMessage>> {
        use std::sync::atomic::Ordering;
        if self.subscribed.swap(true, Ordering::SeqCst) {
            return Err(Error::Transport("already subscribed".to_string()));
        }

        let (tx, rx) = mpsc::channel(INCOMING_BUFFER);
        let handler = Update::filter_message().endpoint(
            |msg: Message, tx: mpsc::Sender<IncomingMessage>| async move {
                if tx.send(to_incoming(&msg)).await.is_err() {
                    debug!("incoming receiver dropped");
                }
                respond(())
            },
        );

        // A single distribution key keeps every update in arrival order.
        let mut dispatcher = Dispatcher::builder(self.bot.clone(), handler)
            .dependencies(dptree::deps![tx])
            .distribution_function(|_| Some(()))
            .default_handler(|_| async {})
            .build();
        let shutdown = dispatcher.shutdown_token();
        let task = tokio::spawn(async move {
            dispatcher.dispatch().await;
        });

        *self.running.lock().await = Some(Running { shutdown, task });
        Ok(rx)
    }

    async fn disconnect(&self) -> Result<()> {
        let Some(running) = self.running.lock().await.take() else {
            return Ok(());
        };
        match running.shutdown.shutdown() {
            Ok(done) => done.await,
            Err(e) => debug!(error = %e, "dispatcher was not running"),
        }
        if let Err(e) = running.task.await {
            warn!(error = %e, "telegram dispatcher task failed");
        }
        info!(user = %self.me, "disconnected from telegram");
        Ok(())
    }
}
