//! Lazy input resolution over a run's channel.

use std::sync::Arc;

use async_trait::async_trait;
use engine::{ResolveError, Resolvers};
use serde_json::{json, Value};
use tracing::debug;

use crate::channel::Channel;
use crate::protocol::{GET_CREDENTIAL, GET_DATACLIP};

/// Fetches credentials and dataclips from the queue on demand.
pub struct ChannelResolvers {
    channel: Arc<dyn Channel>,
}

impl ChannelResolvers {
    pub fn new(channel: Arc<dyn Channel>) -> Self {
        Self { channel }
    }

    async fn fetch(&self, event: &str, id: &str) -> Result<Value, ResolveError> {
        debug!(topic = self.channel.topic(), event, id, "resolving");
        let response = self
            .channel
            .push(event, json!({ "id": id }))
            .await
            .map_err(|e| ResolveError(format!("{event} {id}: {e}")))?;
        decode(response).map_err(|e| ResolveError(format!("{event} {id}: {e}")))
    }
}

/// Bodies may arrive as JSON text.
fn decode(response: Value) -> Result<Value, serde_json::Error> {
    match response {
        Value::String(text) => serde_json::from_str(&text),
        other => Ok(other),
    }
}

#[async_trait]
impl Resolvers for ChannelResolvers {
    async fn resolve_credential(&self, id: &str) -> Result<Value, ResolveError> {
        self.fetch(GET_CREDENTIAL, id).await
    }

    async fn resolve_state(&self, id: &str) -> Result<Value, ResolveError> {
        self.fetch(GET_DATACLIP, id).await
    }
}
