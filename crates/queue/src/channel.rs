//! The seam between the worker and its transport to the queue.
//!
//! A [`Socket`] joins topics; a [`Channel`] is one joined topic. Every push
//! waits for the server's `ok` or `error` reply.

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum ChannelError {
    /// The server replied with an error status.
    #[error("'{event}' was rejected: {response}")]
    Rejected { event: String, response: Value },

    #[error("no reply to '{event}' in time")]
    Timeout { event: String },

    #[error("connection closed")]
    Closed,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("failed to encode or decode a payload: {0}")]
    Encode(String),
}

/// One joined topic.
#[async_trait]
pub trait Channel: Send + Sync {
    fn topic(&self) -> &str;

    /// Push `event` and wait for the reply. Returns the reply's response
    /// body on `ok`.
    async fn push(&self, event: &str, payload: Value) -> Result<Value, ChannelError>;

    async fn leave(&self) -> Result<(), ChannelError>;
}

/// A connection able to join topics.
#[async_trait]
pub trait Socket: Send + Sync {
    async fn join(&self, topic: &str, payload: Value) -> Result<Arc<dyn Channel>, ChannelError>;
}

/// Push a typed payload and decode the typed reply.
pub async fn request<P, R>(channel: &dyn Channel, event: &str, payload: &P) -> Result<R, ChannelError>
where
    P: Serialize + ?Sized,
    R: DeserializeOwned,
{
    let payload = serde_json::to_value(payload).map_err(|e| ChannelError::Encode(e.to_string()))?;
    let response = channel.push(event, payload).await?;
    serde_json::from_value(response).map_err(|e| ChannelError::Encode(e.to_string()))
}

/// Push a typed payload, ignoring the reply body.
pub async fn send<P>(channel: &dyn Channel, event: &str, payload: &P) -> Result<(), ChannelError>
where
    P: Serialize + ?Sized,
{
    let payload = serde_json::to_value(payload).map_err(|e| ChannelError::Encode(e.to_string()))?;
    channel.push(event, payload).await.map(|_| ())
}
