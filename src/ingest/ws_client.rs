//! BetterBot WebSocket Client
//!
//! Connects to the backend's `/ws` feed and republishes its messages as
//! [`StreamEvent`]s. Reconnects forever with exponential backoff (1s doubling
//! to 60s, reset after a clean session). Every connection transition is
//! published as a `Status` event.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::{connect_async_with_config, tungstenite::Message};
use tracing::{debug, error, info, warn};

use super::stream::StreamClient;
use crate::config::ClientConfig;
use crate::models::{ConnectionStatus, ProbePayload, StreamEvent, WsClientMessage, WsServerEvent};

const EVENT_CHANNEL_CAPACITY: usize = 4096;
const INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(1);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);

struct Inner {
    url: String,
    api_token: Option<String>,
    events: broadcast::Sender<StreamEvent>,
    status: Mutex<ConnectionStatus>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
}

impl Inner {
    fn set_status(&self, status: ConnectionStatus) {
        {
            let mut current = self.status.lock();
            if *current == status {
                return;
            }
            *current = status;
        }
        // No subscribers is fine.
        let _ = self.events.send(StreamEvent::Status(status));
    }

    async fn run(self: Arc<Self>) {
        let mut reconnect_delay = INITIAL_RECONNECT_DELAY;

        loop {
            self.set_status(ConnectionStatus::Connecting);
            match self.connect_and_stream().await {
                Ok(()) => {
                    info!("stream connection closed by server");
                    self.set_status(ConnectionStatus::Disconnected);
                    reconnect_delay = INITIAL_RECONNECT_DELAY;
                }
                Err(e) => {
                    error!("stream error: {:#}", e);
                    self.set_status(ConnectionStatus::Error);
                }
            }
            *self.outbound.lock() = None;

            warn!("reconnecting stream in {:?}", reconnect_delay);
            sleep(reconnect_delay).await;
            reconnect_delay = (reconnect_delay * 2).min(MAX_RECONNECT_DELAY);
        }
    }

    async fn connect_and_stream(&self) -> Result<()> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .context("Failed to build websocket request")?;
        if let Some(token) = &self.api_token {
            let value = format!("Bearer {}", token)
                .parse()
                .context("Invalid API token")?;
            request.headers_mut().insert("Authorization", value);
        }

        let ws_config = WebSocketConfig {
            max_message_size: Some(16 * 1024 * 1024),
            max_frame_size: Some(4 * 1024 * 1024),
            ..Default::default()
        };

        debug!(url = %self.url, "connecting stream");
        let (ws_stream, response) = connect_async_with_config(request, Some(ws_config), false)
            .await
            .context("Failed to connect to WebSocket")?;
        info!(status = %response.status(), "stream connected");

        let (mut write, mut read) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        *self.outbound.lock() = Some(out_tx);
        self.set_status(ConnectionStatus::Connected);

        loop {
            tokio::select! {
                frame = read.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => self.dispatch(&text),
                        Some(Ok(Message::Close(frame))) => {
                            debug!(?frame, "stream close frame");
                            return Ok(());
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(e).context("WebSocket read failed"),
                        None => return Ok(()),
                    }
                }
                Some(message) = out_rx.recv() => {
                    write
                        .send(message)
                        .await
                        .context("WebSocket write failed")?;
                }
            }
        }
    }

    fn dispatch(&self, text: &str) {
        // Legacy servers answer probes with a bare "pong".
        if text.trim() == "pong" {
            return;
        }
        match serde_json::from_str::<WsServerEvent>(text) {
            Ok(event) => {
                let _ = self.events.send(StreamEvent::from(event));
            }
            Err(e) => {
                if tracing::enabled!(tracing::Level::DEBUG) {
                    let preview: String = text.chars().take(200).collect();
                    debug!(error = %e, "dropping undecodable frame: {}", preview);
                }
            }
        }
    }
}

pub struct WsStreamClient {
    inner: Arc<Inner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl WsStreamClient {
    pub fn new(url: impl Into<String>, api_token: Option<String>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                url: url.into(),
                api_token,
                events,
                status: Mutex::new(ConnectionStatus::Disconnected),
                outbound: Mutex::new(None),
            }),
            task: Mutex::new(None),
        }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(config.ws_url.clone(), config.api_token.clone())
    }
}

#[async_trait]
impl StreamClient for WsStreamClient {
    fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.inner.events.subscribe()
    }

    fn status(&self) -> ConnectionStatus {
        *self.inner.status.lock()
    }

    /// Start the reconnect loop. Returns immediately; progress is reported
    /// through status events.
    async fn connect(&self) -> Result<()> {
        let mut task = self.task.lock();
        if task.as_ref().map_or(false, |t| !t.is_finished()) {
            return Ok(());
        }
        *task = Some(tokio::spawn(Arc::clone(&self.inner).run()));
        Ok(())
    }

    async fn disconnect(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            task.abort();
        }
        *self.inner.outbound.lock() = None;
        self.inner.set_status(ConnectionStatus::Disconnected);
    }

    async fn send_ping(&self, timestamp_ms: i64) -> Result<()> {
        let payload = serde_json::to_string(&WsClientMessage::Ping(ProbePayload {
            timestamp: timestamp_ms,
        }))
        .context("Failed to serialize ping")?;

        let outbound = self.inner.outbound.lock().clone();
        let Some(tx) = outbound else {
            anyhow::bail!("stream not connected");
        };
        tx.send(Message::Text(payload))
            .map_err(|_| anyhow::anyhow!("stream writer closed"))
    }
}

impl Drop for WsStreamClient {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}
