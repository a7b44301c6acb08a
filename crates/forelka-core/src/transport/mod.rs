//! Chat-network transport port.
//!
//! The core never speaks the wire protocol. An adapter crate implements
//! [`Transport`] and hands back one [`TransportSession`] per connected account.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{
    domain::{ChatId, Credentials, MessageId, MessageRef, UserId},
    Result,
};

pub mod throttled;

/// How outgoing text should be interpreted by the network.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TextFormat {
    Plain,
    Html,
}

/// A message event delivered to the account.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IncomingMessage {
    pub chat_id: ChatId,
    pub message_id: MessageId,
    pub sender_id: Option<UserId>,
    /// `None` for media without caption, service messages, etc.
    pub text: Option<String>,
    /// Author of the message this one replies to, if any.
    pub reply_to_sender: Option<UserId>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, credentials: &Credentials) -> Result<Arc<dyn TransportSession>>;
}

#[async_trait]
pub trait TransportSession: Send + Sync {
    /// The account's own user id as reported by the network.
    fn me(&self) -> UserId;

    async fn send(&self, chat_id: ChatId, text: &str, format: TextFormat) -> Result<MessageRef>;

    async fn create_group(&self, title: &str, members: &[UserId]) -> Result<ChatId>;

    /// Hand out the incoming message stream, in arrival order. May be taken once.
    async fn subscribe(&self) -> Result<mpsc::Receiver<IncomingMessage>>;

    async fn disconnect(&self) -> Result<()>;
}
