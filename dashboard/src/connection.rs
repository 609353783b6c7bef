//! Farm-scoped telemetry stream.
//!
//! [`ConnectionManager::open`] starts one websocket task per farm and hands
//! back a [`ConnectionHandle`] that owns the receiving end of its events.
//! The manager keeps at most one live connection per farm: opening a farm
//! again (for instance after the credential rotated) shuts the previous
//! socket down first. Lost connections are reported, never retried here.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::error::{DecodeError, TransportError};
use crate::message::{decode_push, decode_push_bytes, PushMessage};

const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closed,
}

#[derive(Debug)]
pub enum ConnectionEvent {
    Connected,
    Disconnected(TransportError),
    Message(PushMessage),
}

struct LiveConnection {
    id: Uuid,
    // Dropping the sender also stops the task.
    _shutdown: oneshot::Sender<()>,
}

type Registry = Arc<Mutex<HashMap<String, LiveConnection>>>;

#[derive(Clone)]
pub struct ConnectionManager {
    ws_url: Url,
    live: Registry,
}

impl ConnectionManager {
    pub fn new(ws_url: &str) -> Result<Self, TransportError> {
        let ws_url = Url::parse(ws_url).map_err(|e| TransportError::InvalidUrl {
            url: ws_url.to_string(),
            reason: e.to_string(),
        })?;
        Ok(ConnectionManager {
            ws_url,
            live: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// `{ws_url}/ws/farms/{farm_id}?token={credential}`
    pub fn stream_url(&self, farm_id: &str, credential: &str) -> Result<Url, TransportError> {
        let mut url = self.ws_url.clone();
        url.path_segments_mut()
            .map_err(|_| TransportError::InvalidUrl {
                url: self.ws_url.to_string(),
                reason: "cannot be a base".to_string(),
            })?
            .pop_if_empty()
            .extend(["ws", "farms", farm_id]);
        url.query_pairs_mut().clear().append_pair("token", credential);
        Ok(url)
    }

    pub fn open(&self, farm_id: &str, credential: &str) -> Result<ConnectionHandle, TransportError> {
        let url = self.stream_url(farm_id, credential)?;
        let id = Uuid::new_v4();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let replaced = self
            .live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                farm_id.to_string(),
                LiveConnection {
                    id,
                    _shutdown: shutdown_tx,
                },
            );
        if replaced.is_some() {
            info!(farm_id, "Replacing existing telemetry stream");
        }
        drop(replaced);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(run_connection(
            farm_id.to_string(),
            url,
            events_tx,
            state_tx,
            shutdown_rx,
            outbound_rx,
        ));

        Ok(ConnectionHandle {
            id,
            farm_id: farm_id.to_string(),
            events: events_rx,
            state: state_rx,
            outbound: outbound_tx,
            task: Some(task),
            live: Arc::clone(&self.live),
        })
    }

    pub async fn close(&self, handle: ConnectionHandle) {
        handle.close().await;
    }

    pub fn is_open(&self, farm_id: &str) -> bool {
        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(farm_id)
    }
}

/// Exclusive owner of one farm's stream.
///
/// Dropping the handle releases the connection just like
/// [`ConnectionHandle::close`], without waiting for the socket to finish.
pub struct ConnectionHandle {
    id: Uuid,
    farm_id: String,
    events: mpsc::UnboundedReceiver<ConnectionEvent>,
    state: watch::Receiver<ConnectionState>,
    outbound: mpsc::UnboundedSender<String>,
    task: Option<JoinHandle<()>>,
    live: Registry,
}

impl ConnectionHandle {
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Next stream event; `None` once the connection task has ended.
    pub async fn recv(&mut self) -> Option<ConnectionEvent> {
        self.events.recv().await
    }

    /// Queue a JSON frame for the server. Dropped unless connected.
    pub fn send(&self, message: &Value) -> bool {
        if !self.is_connected() {
            return false;
        }
        self.outbound.send(message.to_string()).is_ok()
    }

    pub async fn close(mut self) {
        self.release();
        if let Some(mut task) = self.task.take() {
            if tokio::time::timeout(CLOSE_TIMEOUT, &mut task).await.is_err() {
                warn!(farm_id = %self.farm_id, "Telemetry stream did not close in time, aborting");
                task.abort();
            }
        }
    }

    fn release(&self) {
        let mut live = self.live.lock().unwrap_or_else(PoisonError::into_inner);
        if live.get(&self.farm_id).map(|c| c.id) == Some(self.id) {
            live.remove(&self.farm_id);
        }
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        self.release();
    }
}

async fn run_connection(
    farm_id: String,
    url: Url,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    state: watch::Sender<ConnectionState>,
    mut shutdown: oneshot::Receiver<()>,
    mut outbound: mpsc::UnboundedReceiver<String>,
) {
    info!(farm_id = %farm_id, "Connecting to telemetry stream");

    let connect = tokio_tungstenite::connect_async(url.as_str());
    let ws = tokio::select! {
        _ = &mut shutdown => {
            state.send_replace(ConnectionState::Closed);
            return;
        }
        result = connect => match result {
            Ok((ws, _)) => ws,
            Err(e) => {
                warn!(farm_id = %farm_id, error = %e, "Telemetry stream handshake failed");
                state.send_replace(ConnectionState::Disconnected);
                let _ = events.send(ConnectionEvent::Disconnected(TransportError::Handshake(e.to_string())));
                return;
            }
        }
    };

    state.send_replace(ConnectionState::Connected);
    let _ = events.send(ConnectionEvent::Connected);
    info!(farm_id = %farm_id, "Telemetry stream connected");

    let (mut sink, mut stream) = ws.split();
    let reason = loop {
        tokio::select! {
            _ = &mut shutdown => {
                let _ = sink.send(Message::Close(None)).await;
                state.send_replace(ConnectionState::Closed);
                info!(farm_id = %farm_id, "Telemetry stream closed");
                return;
            }
            Some(text) = outbound.recv() => {
                if let Err(e) = sink.send(Message::Text(text)).await {
                    warn!(farm_id = %farm_id, error = %e, "Failed to send stream message");
                }
            }
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => forward(&farm_id, decode_push(&text), &events),
                Some(Ok(Message::Binary(bytes))) => forward(&farm_id, decode_push_bytes(&bytes), &events),
                Some(Ok(Message::Close(_))) | None => break TransportError::ClosedByPeer,
                Some(Ok(_)) => {}
                Some(Err(e)) => break TransportError::Dropped(e.to_string()),
            }
        }
    };

    warn!(farm_id = %farm_id, reason = %reason, "Telemetry stream disconnected");
    state.send_replace(ConnectionState::Disconnected);
    let _ = events.send(ConnectionEvent::Disconnected(reason));
}

fn forward(farm_id: &str, decoded: Result<PushMessage, DecodeError>, events: &mpsc::UnboundedSender<ConnectionEvent>) {
    match decoded {
        Ok(message) => {
            debug!(farm_id, "Stream message received");
            let _ = events.send(ConnectionEvent::Message(message));
        }
        Err(e) => warn!(farm_id, error = %e, "Dropping undecodable stream message"),
    }
}
