//! Phoenix channel client over a websocket.
//!
//! Frames use the v2 serializer: `[join_ref, ref, topic, event, payload]`.
//! Replies arrive as `phx_reply` with `{status, response}` and are matched
//! to their push by `ref`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::channel::{Channel, ChannelError, Socket};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(30);

struct Reply {
    ok: bool,
    response: Value,
}

struct Shared {
    outgoing: mpsc::UnboundedSender<String>,
    pending: Mutex<HashMap<String, oneshot::Sender<Reply>>>,
    next_ref: AtomicU64,
    reply_timeout: Duration,
    closed: CancellationToken,
}

impl Shared {
    fn make_ref(&self) -> String {
        (self.next_ref.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, HashMap<String, oneshot::Sender<Reply>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Send one frame and wait for its reply.
    async fn call(
        &self,
        join_ref: Option<&str>,
        topic: &str,
        event: &str,
        payload: Value,
    ) -> Result<Value, ChannelError> {
        let msg_ref = self.make_ref();
        let join_ref = join_ref.map(str::to_string).unwrap_or_else(|| msg_ref.clone());
        let frame = json!([join_ref, msg_ref, topic, event, payload]).to_string();

        let (tx, rx) = oneshot::channel();
        self.lock_pending().insert(msg_ref.clone(), tx);
        if self.outgoing.send(frame).is_err() {
            self.lock_pending().remove(&msg_ref);
            return Err(ChannelError::Closed);
        }
        trace!(topic, event, msg_ref = %msg_ref, "pushed");

        match tokio::time::timeout(self.reply_timeout, rx).await {
            Ok(Ok(Reply { ok: true, response })) => Ok(response),
            Ok(Ok(Reply { ok: false, response })) => Err(ChannelError::Rejected {
                event: event.to_string(),
                response,
            }),
            Ok(Err(_)) => Err(ChannelError::Closed),
            Err(_) => {
                self.lock_pending().remove(&msg_ref);
                Err(ChannelError::Timeout {
                    event: event.to_string(),
                })
            }
        }
    }

    fn resolve(&self, frame: &str) {
        let Ok(Value::Array(parts)) = serde_json::from_str::<Value>(frame) else {
            debug!("ignoring malformed frame");
            return;
        };
        let [_, msg_ref, topic, event, payload] = parts.as_slice() else {
            debug!("ignoring frame with unexpected arity");
            return;
        };
        if event.as_str() != Some("phx_reply") {
            trace!(topic = %topic, event = %event, "ignoring server push");
            return;
        }
        let Some(msg_ref) = msg_ref.as_str() else {
            return;
        };
        let Some(tx) = self.lock_pending().remove(msg_ref) else {
            trace!(msg_ref, "reply for unknown ref");
            return;
        };
        let _ = tx.send(Reply {
            ok: payload.get("status").and_then(Value::as_str) == Some("ok"),
            response: payload.get("response").cloned().unwrap_or(Value::Null),
        });
    }
}

/// A websocket connection to a Phoenix endpoint.
pub struct PhoenixSocket {
    shared: Arc<Shared>,
}

impl PhoenixSocket {
    /// Connect to `url`. `/websocket?vsn=2.0.0` is appended.
    pub async fn connect(url: &str) -> Result<Self, ChannelError> {
        Self::connect_with_timeout(url, DEFAULT_REPLY_TIMEOUT).await
    }

    pub async fn connect_with_timeout(url: &str, reply_timeout: Duration) -> Result<Self, ChannelError> {
        let endpoint = format!("{}/websocket?vsn=2.0.0", url.trim_end_matches('/'));
        let (stream, _) = tokio_tungstenite::connect_async(endpoint.as_str())
            .await
            .map_err(|e| ChannelError::Transport(e.to_string()))?;
        info!(url = %endpoint, "connected to queue");

        let (outgoing, outbox) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            outgoing,
            pending: Mutex::new(HashMap::new()),
            next_ref: AtomicU64::new(0),
            reply_timeout,
            closed: CancellationToken::new(),
        });
        tokio::spawn(connection(stream, outbox, Arc::clone(&shared)));
        Ok(Self { shared })
    }

    /// Close the connection. Pending pushes fail with [`ChannelError::Closed`].
    pub fn close(&self) {
        self.shared.closed.cancel();
    }
}

impl Drop for PhoenixSocket {
    fn drop(&mut self) {
        self.shared.closed.cancel();
    }
}

#[async_trait]
impl Socket for PhoenixSocket {
    async fn join(&self, topic: &str, payload: Value) -> Result<Arc<dyn Channel>, ChannelError> {
        let join_ref = self.shared.make_ref();
        // The join's own ref doubles as the join ref of later pushes.
        let frame = json!([join_ref, join_ref, topic, "phx_join", payload]).to_string();

        let (tx, rx) = oneshot::channel();
        self.shared.lock_pending().insert(join_ref.clone(), tx);
        self.shared
            .outgoing
            .send(frame)
            .map_err(|_| ChannelError::Closed)?;

        let reply = tokio::time::timeout(self.shared.reply_timeout, rx)
            .await
            .map_err(|_| ChannelError::Timeout {
                event: "phx_join".to_string(),
            })?
            .map_err(|_| ChannelError::Closed)?;
        if !reply.ok {
            return Err(ChannelError::Rejected {
                event: "phx_join".to_string(),
                response: reply.response,
            });
        }
        debug!(topic, "joined");
        Ok(Arc::new(PhoenixChannel {
            topic: topic.to_string(),
            join_ref,
            shared: Arc::clone(&self.shared),
        }))
    }
}

pub struct PhoenixChannel {
    topic: String,
    join_ref: String,
    shared: Arc<Shared>,
}

#[async_trait]
impl Channel for PhoenixChannel {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn push(&self, event: &str, payload: Value) -> Result<Value, ChannelError> {
        self.shared
            .call(Some(&self.join_ref), &self.topic, event, payload)
            .await
    }

    async fn leave(&self) -> Result<(), ChannelError> {
        self.shared
            .call(Some(&self.join_ref), &self.topic, "phx_leave", json!({}))
            .await
            .map(|_| ())
    }
}

/// Pump frames between the websocket and the shared state until either side
/// closes.
async fn connection(
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut outbox: mpsc::UnboundedReceiver<String>,
    shared: Arc<Shared>,
) {
    let (mut ws_tx, mut ws_rx) = stream.split();
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.tick().await;

    loop {
        tokio::select! {
            _ = shared.closed.cancelled() => {
                let _ = ws_tx.send(WsMessage::Close(None)).await;
                break;
            }
            frame = outbox.recv() => {
                let Some(frame) = frame else { break };
                if ws_tx.send(WsMessage::Text(frame.into())).await.is_err() {
                    warn!("queue connection lost while sending");
                    break;
                }
            }
            _ = heartbeat.tick() => {
                let msg_ref = shared.make_ref();
                let frame = json!([Value::Null, msg_ref, "phoenix", "heartbeat", {}]).to_string();
                if ws_tx.send(WsMessage::Text(frame.into())).await.is_err() {
                    warn!("queue connection lost during heartbeat");
                    break;
                }
            }
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(WsMessage::Text(text))) => shared.resolve(text.as_str()),
                    Some(Ok(WsMessage::Ping(data))) => {
                        let _ = ws_tx.send(WsMessage::Pong(data)).await;
                    }
                    Some(Ok(WsMessage::Close(_))) | None => {
                        warn!("queue closed the connection");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "queue connection error");
                        break;
                    }
                }
            }
        }
    }

    // Dropping the senders fails every waiting push with `Closed`.
    shared.lock_pending().clear();
    shared.closed.cancel();
    debug!("queue connection task stopped");
}
