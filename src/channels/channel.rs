//! Transport abstraction: inbound messages and the progress/result sink.

use std::pin::Pin;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;

use crate::error::ChannelError;

/// A message received from an external channel.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    /// Channel this message came from.
    pub channel: String,
    /// Chat the message was sent in; replies and task results go here.
    pub chat_id: String,
    /// Sender identity (numeric id or username).
    pub user_id: String,
    /// Optional display name.
    pub user_name: Option<String>,
    /// Message content.
    pub content: String,
    /// When the message was received.
    pub received_at: DateTime<Utc>,
}

impl IncomingMessage {
    pub fn new(
        channel: impl Into<String>,
        chat_id: impl Into<String>,
        user_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            channel: channel.into(),
            chat_id: chat_id.into(),
            user_id: user_id.into(),
            user_name: None,
            content: content.into(),
            received_at: Utc::now(),
        }
    }

    pub fn with_user_name(mut self, name: impl Into<String>) -> Self {
        self.user_name = Some(name.into());
        self
    }
}

/// Stream of incoming messages.
pub type MessageStream = Pin<Box<dyn Stream<Item = IncomingMessage> + Send>>;

/// Outbound side of a chat transport.
///
/// Progress indicators are editable messages addressed by the handle
/// returned from [`Transport::create_progress`].
#[async_trait]
pub trait Transport: Send + Sync {
    /// Post a new progress indicator and return its handle.
    async fn create_progress(&self, chat_id: &str, text: &str) -> Result<i64, ChannelError>;

    /// Overwrite the indicator's text. Repeating the same text is harmless.
    async fn update_progress(
        &self,
        chat_id: &str,
        handle: i64,
        text: &str,
    ) -> Result<(), ChannelError>;

    async fn delete_progress(&self, chat_id: &str, handle: i64) -> Result<(), ChannelError>;

    /// Send one message. Callers chunk long text before calling this.
    async fn send_message(&self, chat_id: &str, text: &str) -> Result<(), ChannelError>;
}
