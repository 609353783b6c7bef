//! In-process mock of the fleet backend: REST under `/api/v1` and the farm
//! websocket under `/ws/farms/:farm_id`.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::time::{sleep, timeout};

use dashboard::config::Config;
use dashboard::subscription::{FarmSubscription, SubscriptionEvent};

pub const FARM: &str = "farm-1";
pub const TOKEN: &str = "good-token";

#[derive(Debug, Clone)]
enum Frame {
    Text(String),
    Close,
}

#[derive(Clone)]
pub struct Backend {
    pub addr: SocketAddr,
    tokens: Arc<Mutex<HashSet<String>>>,
    latest: Arc<Mutex<Vec<Value>>>,
    history: Arc<Mutex<VecDeque<(u64, Value)>>>,
    history_hits: Arc<Mutex<Vec<String>>>,
    commands: Arc<Mutex<Vec<(String, Value)>>>,
    streams: Arc<Mutex<Vec<(String, String)>>>,
    inbound: Arc<Mutex<Vec<String>>>,
    frames: broadcast::Sender<Frame>,
}

impl Backend {
    pub async fn start() -> Backend {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (frames, _) = broadcast::channel(64);
        let backend = Backend {
            addr: listener.local_addr().unwrap(),
            tokens: Arc::new(Mutex::new(HashSet::from([TOKEN.to_string()]))),
            latest: Arc::default(),
            history: Arc::default(),
            history_hits: Arc::default(),
            commands: Arc::default(),
            streams: Arc::default(),
            inbound: Arc::default(),
            frames,
        };

        let app = Router::new()
            .route("/api/v1/devices/:device_id/telemetry", get(history))
            .route("/api/v1/devices/:device_id/stats", get(stats))
            .route("/api/v1/devices/:device_id/cmd", post(command))
            .route("/api/v1/farms/:farm_id/telemetry/latest", get(latest))
            .route("/ws/farms/:farm_id", get(stream))
            .with_state(backend.clone());

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        backend
    }

    pub fn config(&self) -> Config {
        Config {
            api_url: format!("http://{}/api/v1", self.addr),
            ws_url: format!("ws://{}", self.addr),
            farm_id: Some(FARM.to_string()),
            ..Config::default()
        }
    }

    pub fn accept_token(&self, token: &str) {
        self.tokens.lock().unwrap().insert(token.to_string());
    }

    pub fn set_latest(&self, samples: Vec<Value>) {
        *self.latest.lock().unwrap() = samples;
    }

    /// Queue the response for the next history request, served after `delay_ms`.
    pub fn script_history(&self, delay_ms: u64, samples: Value) {
        self.history.lock().unwrap().push_back((delay_ms, samples));
    }

    pub fn history_hits(&self) -> Vec<String> {
        self.history_hits.lock().unwrap().clone()
    }

    pub fn commands(&self) -> Vec<(String, Value)> {
        self.commands.lock().unwrap().clone()
    }

    /// `(farm_id, token)` of every accepted stream, in order.
    pub fn streams(&self) -> Vec<(String, String)> {
        self.streams.lock().unwrap().clone()
    }

    pub fn inbound(&self) -> Vec<String> {
        self.inbound.lock().unwrap().clone()
    }

    pub fn push(&self, message: Value) {
        let _ = self.frames.send(Frame::Text(message.to_string()));
    }

    pub fn push_raw(&self, text: &str) {
        let _ = self.frames.send(Frame::Text(text.to_string()));
    }

    pub fn close_streams(&self) {
        let _ = self.frames.send(Frame::Close);
    }

    fn accepts(&self, token: &str) -> bool {
        self.tokens.lock().unwrap().contains(token)
    }

    fn authorized(&self, headers: &HeaderMap) -> bool {
        headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .is_some_and(|token| self.accepts(token))
    }
}

async fn history(
    State(backend): State<Backend>,
    Path(device_id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    if !backend.authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let limit = query.get("limit").cloned().unwrap_or_default();
    backend
        .history_hits
        .lock()
        .unwrap()
        .push(format!("{}?limit={}", device_id, limit));

    let scripted = backend.history.lock().unwrap().pop_front();
    let (delay_ms, body) = scripted.unwrap_or((0, json!([])));
    if delay_ms > 0 {
        sleep(Duration::from_millis(delay_ms)).await;
    }
    Json(body).into_response()
}

async fn latest(State(backend): State<Backend>, Path(_farm_id): Path<String>, headers: HeaderMap) -> Response {
    if !backend.authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let samples = backend.latest.lock().unwrap().clone();
    Json(Value::Array(samples)).into_response()
}

async fn stats(State(backend): State<Backend>, Path(device_id): Path<String>, headers: HeaderMap) -> Response {
    if !backend.authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    match device_id.as_str() {
        "broken" => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
        "garbled" => "not json".into_response(),
        _ => Json(json!({
            "max_temp_c": 38.1,
            "avg_temp_c": 37.6,
            "max_hum_pct": 61.0,
            "avg_hum_pct": 55.5
        }))
        .into_response(),
    }
}

async fn command(
    State(backend): State<Backend>,
    Path(device_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if !backend.authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let rejected = body["cmd"] == "BOGUS";
    backend.commands.lock().unwrap().push((device_id, body));
    if rejected {
        return StatusCode::BAD_REQUEST.into_response();
    }
    Json(json!({ "status": "sent" })).into_response()
}

async fn stream(
    State(backend): State<Backend>,
    Path(farm_id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    let token = query.get("token").cloned().unwrap_or_default();
    if !backend.accepts(&token) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    backend.streams.lock().unwrap().push((farm_id, token));
    // Subscribe before answering so nothing pushed after the handshake is lost.
    let frames = backend.frames.subscribe();
    ws.on_upgrade(move |socket| serve_stream(socket, frames, backend))
}

async fn serve_stream(mut socket: WebSocket, mut frames: broadcast::Receiver<Frame>, backend: Backend) {
    loop {
        tokio::select! {
            frame = frames.recv() => match frame {
                Ok(Frame::Text(text)) => {
                    if socket.send(Message::Text(text)).await.is_err() {
                        return;
                    }
                }
                Ok(Frame::Close) => {
                    let _ = socket.send(Message::Close(None)).await;
                    return;
                }
                Err(_) => return,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Text(text))) => backend.inbound.lock().unwrap().push(text),
                Some(Ok(_)) => {}
                _ => return,
            },
        }
    }
}

pub fn wire_sample(device_id: &str, secs: u32, temp_c: f64) -> Value {
    json!({
        "device_id": device_id,
        "ts": format!("2026-01-01T00:{:02}:{:02}Z", secs / 60, secs % 60),
        "temp_c": temp_c,
        "hum_pct": 55.0,
        "primary_heater": true,
        "uptime_s": 3600
    })
}

pub fn telemetry(device_id: &str, secs: u32, temp_c: f64) -> Value {
    json!({
        "type": "telemetry",
        "device_id": device_id,
        "data": wire_sample(device_id, secs, temp_c)
    })
}

/// Drive the subscription until an event matches.
pub async fn wait_for<F>(subscription: &mut FarmSubscription, mut matches: F) -> SubscriptionEvent
where
    F: FnMut(&SubscriptionEvent) -> bool,
{
    let found = timeout(Duration::from_secs(5), async {
        loop {
            match subscription.next_event().await {
                Some(event) if matches(&event) => return event,
                Some(_) => {}
                None => panic!("subscription ended while waiting"),
            }
        }
    })
    .await;
    found.expect("timed out waiting for subscription event")
}

/// Poll until `check` holds; the backend side runs on its own tasks.
pub async fn eventually<F: Fn() -> bool>(check: F) {
    timeout(Duration::from_secs(5), async {
        while !check() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
