//! In-memory stand-ins for the remote queue, for tests and local runs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::channel::{Channel, ChannelError, Socket};

/// Replies to one event. `Err` is sent back as an `error` reply.
pub type Handler = Arc<dyn Fn(Value) -> Result<Value, Value> + Send + Sync>;

/// A channel that answers pushes from registered handlers and records
/// everything pushed to it.
///
/// Events without a handler are acknowledged with `null`.
pub struct MockChannel {
    topic: String,
    handlers: HashMap<String, Handler>,
    pushes: Mutex<Vec<(String, Value)>>,
    left: Mutex<bool>,
}

impl MockChannel {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            handlers: HashMap::new(),
            pushes: Mutex::new(Vec::new()),
            left: Mutex::new(false),
        }
    }

    pub fn on(
        mut self,
        event: impl Into<String>,
        handler: impl Fn(Value) -> Result<Value, Value> + Send + Sync + 'static,
    ) -> Self {
        self.handlers.insert(event.into(), Arc::new(handler));
        self
    }

    /// Every push so far, in order.
    pub fn pushes(&self) -> Vec<(String, Value)> {
        self.pushes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Payloads pushed for `event`, in order.
    pub fn pushed(&self, event: &str) -> Vec<Value> {
        self.pushes()
            .into_iter()
            .filter(|(name, _)| name == event)
            .map(|(_, payload)| payload)
            .collect()
    }

    /// Names of every pushed event, in order.
    pub fn events(&self) -> Vec<String> {
        self.pushes().into_iter().map(|(name, _)| name).collect()
    }

    pub fn has_left(&self) -> bool {
        *self.left.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Channel for MockChannel {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn push(&self, event: &str, payload: Value) -> Result<Value, ChannelError> {
        self.pushes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((event.to_string(), payload.clone()));

        match self.handlers.get(event) {
            Some(handler) => handler(payload).map_err(|response| ChannelError::Rejected {
                event: event.to_string(),
                response,
            }),
            None => Ok(Value::Null),
        }
    }

    async fn leave(&self) -> Result<(), ChannelError> {
        *self.left.lock().unwrap_or_else(PoisonError::into_inner) = true;
        Ok(())
    }
}

/// A socket whose topics are pre-registered mock channels.
#[derive(Default)]
pub struct MockSocket {
    channels: Mutex<HashMap<String, Arc<MockChannel>>>,
    joins: Mutex<Vec<(String, Value)>>,
}

impl MockSocket {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `channel` under its topic and return it for inspection.
    pub fn add(&self, channel: MockChannel) -> Arc<MockChannel> {
        let channel = Arc::new(channel);
        self.channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(channel.topic.clone(), Arc::clone(&channel));
        channel
    }

    /// Every join so far, with its payload.
    pub fn joins(&self) -> Vec<(String, Value)> {
        self.joins
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Socket for MockSocket {
    async fn join(&self, topic: &str, payload: Value) -> Result<Arc<dyn Channel>, ChannelError> {
        self.joins
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((topic.to_string(), payload));

        let channel = self
            .channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(topic)
            .cloned();
        match channel {
            Some(channel) => Ok(channel as Arc<dyn Channel>),
            None => Err(ChannelError::Rejected {
                event: "phx_join".to_string(),
                response: json!({ "reason": "unmatched topic" }),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn handlers_answer_and_pushes_are_recorded() {
        let channel = MockChannel::new("run:1")
            .on("ping", |_| Ok(json!("pong")))
            .on("bad", |_| Err(json!({ "errors": ["nope"] })));

        assert_eq!(channel.push("ping", json!({ "n": 1 })).await.unwrap(), json!("pong"));
        assert!(matches!(
            channel.push("bad", Value::Null).await,
            Err(ChannelError::Rejected { .. })
        ));
        assert_eq!(channel.push("other", Value::Null).await.unwrap(), Value::Null);
        assert_eq!(channel.events(), vec!["ping", "bad", "other"]);
        assert_eq!(channel.pushed("ping"), vec![json!({ "n": 1 })]);
    }

    #[tokio::test]
    async fn socket_joins_registered_topics_only() {
        let socket = MockSocket::new();
        socket.add(MockChannel::new("run:1"));

        let channel = socket.join("run:1", json!({ "token": "t" })).await.unwrap();
        assert_eq!(channel.topic(), "run:1");
        assert!(socket.join("run:2", Value::Null).await.is_err());
        assert_eq!(socket.joins().len(), 2);
    }
}
