//! In-process fake ComfyUI server for integration tests.
//!
//! One axum app serves the HTTP routes and the `/ws` upgrade on a single
//! port. Tests script the server: push WebSocket events, drop connections,
//! stage history entries, or switch `/prompt` into rejection mode.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Multipart, Path, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{Value, json};
use tokio::sync::{Mutex, broadcast};

use promptfleet_pool::client::Workflow;
use promptfleet_pool::{PoolClientConfig, PoolEvent};

/// A `POST /prompt` the fake server accepted.
#[derive(Debug, Clone)]
pub struct ReceivedPrompt {
    pub prompt_id: String,
    pub client_id: String,
    pub workflow: Value,
}

#[derive(Debug, Clone)]
enum WsDirective {
    Text(String),
    Binary(Vec<u8>),
    Close,
}

#[derive(Debug, Clone)]
struct RejectMode {
    status: u16,
    body: Value,
    /// Remaining rejections; `None` rejects forever.
    remaining: Option<u32>,
}

struct ServerState {
    prefix: String,
    next_prompt: AtomicU64,
    prompts: Mutex<Vec<ReceivedPrompt>>,
    interrupts: Mutex<Vec<String>>,
    uploads: Mutex<Vec<String>>,
    history: Mutex<HashMap<String, Value>>,
    object_info: Mutex<HashMap<String, Value>>,
    reject: Mutex<Option<RejectMode>>,
    connections: AtomicUsize,
    ws: broadcast::Sender<WsDirective>,
}

pub struct FakeServer {
    pub addr: SocketAddr,
    state: Arc<ServerState>,
}

impl FakeServer {
    pub async fn start(prefix: &str) -> Self {
        let (ws, _) = broadcast::channel(256);
        let state = Arc::new(ServerState {
            prefix: prefix.to_string(),
            next_prompt: AtomicU64::new(0),
            prompts: Mutex::new(Vec::new()),
            interrupts: Mutex::new(Vec::new()),
            uploads: Mutex::new(Vec::new()),
            history: Mutex::new(HashMap::new()),
            object_info: Mutex::new(HashMap::new()),
            reject: Mutex::new(None),
            connections: AtomicUsize::new(0),
            ws,
        });

        let app = Router::new()
            .route("/prompt", post(prompt_route))
            .route("/queue", get(queue_route))
            .route("/history/{prompt_id}", get(history_route))
            .route("/interrupt", post(interrupt_route))
            .route("/interrupt/{prompt_id}", post(interrupt_id_route))
            .route("/upload/image", post(upload_route))
            .route("/object_info/{class_type}", get(object_info_route))
            .route("/ws", get(ws_route))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, state }
    }

    pub fn url(&self) -> reqwest::Url {
        reqwest::Url::parse(&format!("http://{}", self.addr)).unwrap()
    }

    /// Pool client config pointed at this server, tuned for fast tests.
    pub fn client_config(&self, id: &str) -> PoolClientConfig {
        let mut config = PoolClientConfig::new(id, self.url());
        config.options.reconnect_base_delay = Duration::from_millis(50);
        config.options.reconnect_max_delay = Duration::from_millis(200);
        config
    }

    pub fn send_event(&self, kind: &str, data: Value) {
        let frame = json!({"type": kind, "data": data}).to_string();
        let _ = self.state.ws.send(WsDirective::Text(frame));
    }

    pub fn send_binary(&self, bytes: Vec<u8>) {
        let _ = self.state.ws.send(WsDirective::Binary(bytes));
    }

    /// Close every open WebSocket; clients will reconnect on their own.
    pub fn drop_connections(&self) {
        let _ = self.state.ws.send(WsDirective::Close);
    }

    pub async fn set_history(&self, prompt_id: &str, entry: Value) {
        self.state
            .history
            .lock()
            .await
            .insert(prompt_id.to_string(), entry);
    }

    pub async fn reject_prompts(&self, status: u16, body: Value) {
        *self.state.reject.lock().await = Some(RejectMode {
            status,
            body,
            remaining: None,
        });
    }

    /// Reject the next `times` submissions, then accept again.
    pub async fn reject_prompts_times(&self, status: u16, body: Value, times: u32) {
        *self.state.reject.lock().await = Some(RejectMode {
            status,
            body,
            remaining: Some(times),
        });
    }

    pub async fn set_object_info(&self, class_type: &str, info: Value) {
        self.state
            .object_info
            .lock()
            .await
            .insert(class_type.to_string(), info);
    }

    pub async fn uploads(&self) -> Vec<String> {
        self.state.uploads.lock().await.clone()
    }

    pub async fn prompts(&self) -> Vec<ReceivedPrompt> {
        self.state.prompts.lock().await.clone()
    }

    pub async fn interrupts(&self) -> Vec<String> {
        self.state.interrupts.lock().await.clone()
    }

    /// Wait until at least `n` prompts were accepted; returns the `n`-th.
    pub async fn wait_for_prompt(&self, n: usize) -> ReceivedPrompt {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                {
                    let prompts = self.state.prompts.lock().await;
                    if prompts.len() >= n {
                        return prompts[n - 1].clone();
                    }
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("timed out waiting for a prompt submission")
    }

    /// Wait until an interrupt for `prompt_id` was received.
    pub async fn wait_for_interrupt(&self, prompt_id: &str) {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                if self
                    .state
                    .interrupts
                    .lock()
                    .await
                    .iter()
                    .any(|id| id == prompt_id)
                {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("timed out waiting for an interrupt")
    }

    /// Finish a prompt: emit `executed` for `node` then `execution_success`.
    pub fn complete_prompt(&self, prompt_id: &str, node: &str, output: Value) {
        self.send_event(
            "executed",
            json!({"node": node, "output": output, "prompt_id": prompt_id}),
        );
        self.send_event("execution_success", json!({"prompt_id": prompt_id}));
    }
}

async fn prompt_route(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<Value>,
) -> Response {
    let rejection = {
        let mut reject = state.reject.lock().await;
        let serve = match reject.as_mut() {
            None => None,
            Some(mode) => match mode.remaining.as_mut() {
                Some(0) => None,
                Some(left) => {
                    *left -= 1;
                    Some((mode.status, mode.body.clone()))
                }
                None => Some((mode.status, mode.body.clone())),
            },
        };
        if serve.is_none() {
            *reject = None;
        }
        serve
    };
    if let Some((status, body)) = rejection {
        let status = StatusCode::from_u16(status).unwrap();
        return (status, Json(body)).into_response();
    }
    let n = state.next_prompt.fetch_add(1, Ordering::SeqCst) + 1;
    let prompt_id = format!("{}-p{}", state.prefix, n);
    state.prompts.lock().await.push(ReceivedPrompt {
        prompt_id: prompt_id.clone(),
        client_id: body
            .get("client_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        workflow: body.get("prompt").cloned().unwrap_or(Value::Null),
    });
    Json(json!({"prompt_id": prompt_id})).into_response()
}

async fn queue_route(State(_state): State<Arc<ServerState>>) -> Json<Value> {
    Json(json!({"queue_running": [], "queue_pending": []}))
}

async fn history_route(
    State(state): State<Arc<ServerState>>,
    Path(prompt_id): Path<String>,
) -> Json<Value> {
    let history = state.history.lock().await;
    Json(history.get(&prompt_id).cloned().unwrap_or_else(|| json!({})))
}

async fn interrupt_route(State(state): State<Arc<ServerState>>) -> StatusCode {
    state.interrupts.lock().await.push("(bare)".to_string());
    StatusCode::OK
}

async fn interrupt_id_route(
    State(state): State<Arc<ServerState>>,
    Path(prompt_id): Path<String>,
) -> StatusCode {
    state.interrupts.lock().await.push(prompt_id);
    StatusCode::OK
}

async fn upload_route(
    State(state): State<Arc<ServerState>>,
    mut multipart: Multipart,
) -> Json<Value> {
    let mut name = "upload.bin".to_string();
    while let Some(field) = multipart.next_field().await.unwrap() {
        if field.name() == Some("image") {
            if let Some(filename) = field.file_name() {
                name = filename.to_string();
            }
        }
        let _ = field.bytes().await;
    }
    state.uploads.lock().await.push(name.clone());
    Json(json!({"name": name, "subfolder": "", "type": "input"}))
}

async fn object_info_route(
    State(state): State<Arc<ServerState>>,
    Path(class_type): Path<String>,
) -> Json<Value> {
    let info = state.object_info.lock().await;
    match info.get(&class_type) {
        Some(entry) => Json(json!({class_type: entry})),
        None => Json(json!({})),
    }
}

async fn ws_route(
    State(state): State<Arc<ServerState>>,
    upgrade: WebSocketUpgrade,
) -> Response {
    upgrade.on_upgrade(move |socket| handle_ws(state, socket))
}

async fn handle_ws(state: Arc<ServerState>, mut socket: WebSocket) {
    state.connections.fetch_add(1, Ordering::SeqCst);
    let mut directives = state.ws.subscribe();
    loop {
        tokio::select! {
            directive = directives.recv() => match directive {
                Ok(WsDirective::Text(text)) => {
                    if socket.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Ok(WsDirective::Binary(bytes)) => {
                    if socket.send(Message::Binary(bytes.into())).await.is_err() {
                        break;
                    }
                }
                Ok(WsDirective::Close) => break,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(_)) => {}
                _ => break,
            },
        }
    }
    state.connections.fetch_sub(1, Ordering::SeqCst);
}

/// Build a workflow from literal JSON.
pub fn workflow(value: Value) -> Workflow {
    Workflow::from_value(value).unwrap()
}

/// Wait for the first pool event `pick` maps to `Some`, panicking after 10s.
pub async fn wait_for_event<F, T>(
    events: &mut tokio::sync::broadcast::Receiver<PoolEvent>,
    mut pick: F,
) -> T
where
    F: FnMut(&PoolEvent) -> Option<T>,
{
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let event = events.recv().await.expect("pool event stream closed");
            if let Some(value) = pick(&event) {
                return value;
            }
        }
    })
    .await
    .expect("timed out waiting for a pool event")
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}
