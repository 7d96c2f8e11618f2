//! One connection to one ComfyUI-compatible server.
//!
//! A [`ClientSession`] owns a shared HTTP client and a WebSocket task that
//! decodes server frames into [`SessionEvent`]s on a broadcast channel. The
//! WebSocket reconnects automatically with exponential backoff; connection
//! state is published on a `watch` channel so owners can await stability.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::StreamExt as _;
use reqwest::Url;
use serde::de::DeserializeOwned;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::error::{EnqueueDetails, ExecError, collect_error_strings};
use crate::protocol::{
    BinaryFrame, ClassInfo, HistoryEntry, PreviewFrame, PreviewMetaFrame, PromptAccepted,
    QueueSnapshot, ServerEvent, SystemStats, UploadedImage, parse_binary_frame,
    parse_server_event,
};
use crate::workflow::Workflow;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Configuration for one [`ClientSession`].
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Server base URL, e.g. `http://127.0.0.1:8188`.
    pub base_url: Url,
    /// `clientId` announced on the WebSocket; defaults to a fresh UUID.
    pub client_id: String,
    /// Whether a dropped WebSocket is reconnected automatically.
    pub auto_reconnect: bool,
    /// Reconnect attempts before the session gives up as failed.
    pub max_reconnect_attempts: u32,
    /// First reconnect delay; doubles per attempt.
    pub reconnect_base_delay: Duration,
    /// Upper bound on the reconnect delay.
    pub reconnect_max_delay: Duration,
    /// Timeout applied to every HTTP request.
    pub request_timeout: Duration,
}

impl SessionOptions {
    /// Default bound on reconnect attempts.
    pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 10;
    /// Default base reconnect delay.
    pub const DEFAULT_RECONNECT_BASE_DELAY: Duration = Duration::from_millis(500);
    /// Default reconnect delay cap.
    pub const DEFAULT_RECONNECT_MAX_DELAY: Duration = Duration::from_secs(30);
    /// Default HTTP request timeout.
    pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

    /// Options for `base_url` with defaults everywhere else.
    pub fn new(mut base_url: Url) -> Self {
        // Joining relative endpoint paths needs a trailing slash.
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Self {
            base_url,
            client_id: uuid::Uuid::new_v4().to_string(),
            auto_reconnect: true,
            max_reconnect_attempts: Self::DEFAULT_MAX_RECONNECT_ATTEMPTS,
            reconnect_base_delay: Self::DEFAULT_RECONNECT_BASE_DELAY,
            reconnect_max_delay: Self::DEFAULT_RECONNECT_MAX_DELAY,
            request_timeout: Self::DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

/// Connection state of the session's WebSocket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// First connection attempt in flight.
    Connecting,
    /// WebSocket open.
    Connected,
    /// WebSocket closed; no reconnect in flight.
    Disconnected,
    /// WebSocket closed; reconnect in flight or pending.
    Reconnecting,
    /// Reconnect attempts exhausted.
    Failed,
}

impl ConnectionState {
    /// Whether the state is terminal for the current connect cycle.
    pub fn is_settled(self) -> bool {
        matches!(
            self,
            ConnectionState::Connected | ConnectionState::Disconnected | ConnectionState::Failed
        )
    }
}

/// Event fanned out by a session to its subscribers.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The WebSocket opened for the first time.
    Connected,
    /// The WebSocket re-opened after a drop.
    Reconnected,
    /// The WebSocket dropped.
    Disconnected,
    /// Reconnect attempts were exhausted.
    ReconnectionFailed,
    /// A decoded server event from a text frame.
    Server(ServerEvent),
    /// A plain preview image frame.
    Preview(PreviewFrame),
    /// A preview image frame with metadata.
    PreviewMeta(PreviewMetaFrame),
}

/// One connection to one remote server.
pub struct ClientSession {
    options: SessionOptions,
    http: reqwest::Client,
    event_tx: broadcast::Sender<SessionEvent>,
    state_tx: watch::Sender<ConnectionState>,
    close_token: CancellationToken,
    reconnect_abort: std::sync::Mutex<CancellationToken>,
    ws_task: std::sync::Mutex<Option<JoinHandle<()>>>,
    preview_metadata: AtomicBool,
}

impl ClientSession {
    /// Build a session. The WebSocket is not opened until [`connect`].
    ///
    /// [`connect`]: ClientSession::connect
    pub fn new(options: SessionOptions) -> Result<Arc<Self>, ExecError> {
        let http = reqwest::Client::builder()
            .timeout(options.request_timeout)
            .build()
            .map_err(|err| ExecError::transport(&err))?;
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (state_tx, _) = watch::channel(ConnectionState::Connecting);
        Ok(Arc::new(Self {
            options,
            http,
            event_tx,
            state_tx,
            close_token: CancellationToken::new(),
            reconnect_abort: std::sync::Mutex::new(CancellationToken::new()),
            ws_task: std::sync::Mutex::new(None),
            preview_metadata: AtomicBool::new(false),
        }))
    }

    /// The `clientId` this session announces to the server.
    pub fn client_id(&self) -> &str {
        &self.options.client_id
    }

    /// The server base URL.
    pub fn base_url(&self) -> &Url {
        &self.options.base_url
    }

    /// Whether the server advertised metadata-carrying preview frames.
    pub fn supports_preview_metadata(&self) -> bool {
        self.preview_metadata.load(Ordering::Relaxed)
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Watch connection state transitions.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Subscribe to the session event stream.
    ///
    /// Subscribe before submitting a prompt: the broadcast channel only
    /// delivers events sent after subscription.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_tx.subscribe()
    }

    /// Open the WebSocket and keep it open. Idempotent while a socket task
    /// is alive.
    pub fn connect(self: &Arc<Self>) {
        let mut slot = self.ws_task.lock().expect("session task lock poisoned");
        if slot.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        let session = Arc::clone(self);
        *slot = Some(tokio::spawn(async move { session.run_ws().await }));
    }

    /// Cancel any pending reconnect attempt without closing an open socket.
    pub fn abort_reconnect(&self) {
        let mut guard = self
            .reconnect_abort
            .lock()
            .expect("session abort lock poisoned");
        let previous = std::mem::replace(&mut *guard, CancellationToken::new());
        previous.cancel();
    }

    /// Close the session: stop the WebSocket task and all reconnects.
    pub async fn close(&self) {
        self.close_token.cancel();
        let task = self
            .ws_task
            .lock()
            .expect("session task lock poisoned")
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.event_tx.send(event);
    }

    fn ws_url(&self) -> String {
        let scheme = if self.options.base_url.scheme() == "https" {
            "wss"
        } else {
            "ws"
        };
        let host = self.options.base_url.host_str().unwrap_or("127.0.0.1");
        let port = self
            .options
            .base_url
            .port_or_known_default()
            .map(|p| format!(":{p}"))
            .unwrap_or_default();
        format!(
            "{scheme}://{host}{port}/ws?clientId={}",
            self.options.client_id
        )
    }

    async fn run_ws(self: Arc<Self>) {
        let mut attempt: u32 = 0;
        let mut ever_connected = false;

        loop {
            self.set_state(if ever_connected {
                ConnectionState::Reconnecting
            } else {
                ConnectionState::Connecting
            });

            let url = self.ws_url();
            let connected = tokio::select! {
                _ = self.close_token.cancelled() => {
                    self.set_state(ConnectionState::Disconnected);
                    return;
                }
                result = tokio_tungstenite::connect_async(&url) => result,
            };

            match connected {
                Ok((stream, _response)) => {
                    attempt = 0;
                    self.set_state(ConnectionState::Connected);
                    if ever_connected {
                        tracing::info!(client_id = %self.options.client_id, "websocket reconnected");
                        self.emit(SessionEvent::Reconnected);
                    } else {
                        tracing::info!(client_id = %self.options.client_id, "websocket connected");
                        self.emit(SessionEvent::Connected);
                    }
                    ever_connected = true;

                    self.read_frames(stream).await;

                    if self.close_token.is_cancelled() {
                        self.set_state(ConnectionState::Disconnected);
                        return;
                    }
                    tracing::warn!(client_id = %self.options.client_id, "websocket disconnected");
                    self.set_state(ConnectionState::Disconnected);
                    self.emit(SessionEvent::Disconnected);
                }
                Err(err) => {
                    tracing::warn!(
                        client_id = %self.options.client_id,
                        error = %err,
                        "websocket connect failed"
                    );
                }
            }

            if !self.options.auto_reconnect {
                if !ever_connected {
                    self.set_state(ConnectionState::Failed);
                    self.emit(SessionEvent::ReconnectionFailed);
                } else {
                    self.set_state(ConnectionState::Disconnected);
                }
                return;
            }

            attempt = attempt.saturating_add(1);
            if attempt > self.options.max_reconnect_attempts {
                self.set_state(ConnectionState::Failed);
                self.emit(SessionEvent::ReconnectionFailed);
                return;
            }

            let delay = reconnect_delay(&self.options, attempt);
            let abort = self
                .reconnect_abort
                .lock()
                .expect("session abort lock poisoned")
                .clone();
            tokio::select! {
                _ = self.close_token.cancelled() => {
                    self.set_state(ConnectionState::Disconnected);
                    return;
                }
                _ = abort.cancelled() => {
                    self.set_state(ConnectionState::Disconnected);
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn read_frames(
        &self,
        mut stream: tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
    ) {
        loop {
            let frame = tokio::select! {
                _ = self.close_token.cancelled() => return,
                frame = stream.next() => frame,
            };

            match frame {
                Some(Ok(Message::Text(text))) => match parse_server_event(text.as_str()) {
                    Ok(Some(event)) => {
                        self.note_feature_flags(&event);
                        self.emit(SessionEvent::Server(event));
                    }
                    Ok(None) => {}
                    Err(err) => {
                        tracing::debug!(error = %err, "ignoring undecodable text frame");
                    }
                },
                Some(Ok(Message::Binary(data))) => match parse_binary_frame(data.as_slice()) {
                    Ok(Some(BinaryFrame::Preview(frame))) => {
                        self.emit(SessionEvent::Preview(frame));
                    }
                    Ok(Some(BinaryFrame::PreviewMeta(frame))) => {
                        self.emit(SessionEvent::PreviewMeta(frame));
                    }
                    Ok(None) => {}
                    Err(err) => {
                        tracing::debug!(error = %err, "ignoring undecodable binary frame");
                    }
                },
                Some(Ok(Message::Close(_))) | None => return,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    tracing::warn!(error = %err, "websocket read error");
                    return;
                }
            }
        }
    }

    fn note_feature_flags(&self, event: &ServerEvent) {
        if let ServerEvent::Status(status) = event {
            let advertised = status
                .status
                .get("feature_flags")
                .and_then(|flags| flags.get("supports_preview_metadata"))
                .and_then(serde_json::Value::as_bool);
            if let Some(value) = advertised {
                self.preview_metadata.store(value, Ordering::Relaxed);
            }
        }
    }

    fn endpoint(&self, path: &str) -> Result<Url, ExecError> {
        self.options.base_url.join(path).map_err(|err| ExecError::Transport {
            message: format!("invalid endpoint {path}: {err}"),
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ExecError> {
        let url = self.endpoint(path)?;
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|err| ExecError::transport(&err))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ExecError::Transport {
                message: format!("GET {path}: http {status}: {}", snippet(&body, 200)),
            });
        }
        response
            .json::<T>()
            .await
            .map_err(|err| ExecError::transport(&err))
    }

    /// `GET /queue`. Doubles as the health-check keep-alive.
    pub async fn get_queue(&self) -> Result<QueueSnapshot, ExecError> {
        self.get_json("queue").await
    }

    /// `GET /system_stats`.
    pub async fn system_stats(&self) -> Result<SystemStats, ExecError> {
        self.get_json("system_stats").await
    }

    /// `POST /prompt`: submit a workflow for execution.
    ///
    /// A rejection becomes [`ExecError::EnqueueFailed`] carrying the HTTP
    /// status plus the parsed (or snipped) response body.
    pub async fn submit_prompt(&self, workflow: &Workflow) -> Result<PromptAccepted, ExecError> {
        let url = self.endpoint("prompt")?;
        let body = serde_json::json!({
            "prompt": workflow.to_value(),
            "client_id": self.options.client_id,
        });
        let response = self
            .http
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|err| ExecError::transport(&err))?;

        let status = response.status();
        if status.is_success() {
            return response
                .json::<PromptAccepted>()
                .await
                .map_err(|err| ExecError::transport(&err));
        }

        let body_text = response.text().await.unwrap_or_default();
        let body_json: Option<serde_json::Value> = serde_json::from_str(&body_text).ok();
        let reason = body_json
            .as_ref()
            .map(collect_error_strings)
            .and_then(|mut strings| {
                if strings.is_empty() {
                    None
                } else {
                    Some(strings.remove(0))
                }
            });
        let body_snippet = if body_json.is_none() && !body_text.is_empty() {
            Some(snippet(&body_text, 300))
        } else {
            None
        };

        Err(ExecError::EnqueueFailed(EnqueueDetails {
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or_default().to_string(),
            body_json,
            body_snippet,
            reason,
        }))
    }

    /// `GET /history/{prompt_id}`.
    ///
    /// Returns `None` while the server has no entry for the prompt. Both the
    /// bare entry shape and the id-keyed map shape are accepted.
    pub async fn history(&self, prompt_id: &str) -> Result<Option<HistoryEntry>, ExecError> {
        let raw: serde_json::Value = self.get_json(&format!("history/{prompt_id}")).await?;
        let entry = match &raw {
            serde_json::Value::Object(map) if map.is_empty() => None,
            serde_json::Value::Object(map) if map.contains_key(prompt_id) => {
                Some(map[prompt_id].clone())
            }
            serde_json::Value::Object(_) => Some(raw),
            _ => None,
        };
        match entry {
            None => Ok(None),
            Some(value) => serde_json::from_value::<HistoryEntry>(value)
                .map(Some)
                .map_err(|err| ExecError::Transport {
                    message: format!("undecodable history entry: {err}"),
                }),
        }
    }

    /// `POST /interrupt[/{prompt_id}]`.
    ///
    /// The prompt-scoped route is tried first; servers without it answer
    /// 404 and the bare route is used instead.
    pub async fn interrupt(&self, prompt_id: Option<&str>) -> Result<(), ExecError> {
        if let Some(prompt_id) = prompt_id {
            let url = self.endpoint(&format!("interrupt/{prompt_id}"))?;
            let response = self
                .http
                .post(url)
                .send()
                .await
                .map_err(|err| ExecError::transport(&err))?;
            if response.status() != reqwest::StatusCode::NOT_FOUND {
                return check_plain(response, "interrupt").await;
            }
        }
        let url = self.endpoint("interrupt")?;
        let response = self
            .http
            .post(url)
            .send()
            .await
            .map_err(|err| ExecError::transport(&err))?;
        check_plain(response, "interrupt").await
    }

    /// `POST /upload/image`: upload attachment bytes ahead of submission.
    pub async fn upload_image(
        &self,
        filename: &str,
        bytes: Vec<u8>,
    ) -> Result<UploadedImage, ExecError> {
        let url = self.endpoint("upload/image")?;
        let part = reqwest::multipart::Part::bytes(bytes).file_name(filename.to_string());
        let form = reqwest::multipart::Form::new()
            .part("image", part)
            .text("overwrite", "true");
        let response = self
            .http
            .post(url)
            .multipart(form)
            .send()
            .await
            .map_err(|err| ExecError::transport(&err))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ExecError::Transport {
                message: format!("upload/image: http {status}: {}", snippet(&body, 200)),
            });
        }
        response
            .json::<UploadedImage>()
            .await
            .map_err(|err| ExecError::transport(&err))
    }

    /// `GET /object_info/{class_type}`: fetch one class definition.
    ///
    /// Returns `None` when the server does not know the class.
    pub async fn object_info(&self, class_type: &str) -> Result<Option<ClassInfo>, ExecError> {
        let url = self.endpoint(&format!("object_info/{class_type}"))?;
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|err| ExecError::transport(&err))?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ExecError::Transport {
                message: format!("object_info: http {status}: {}", snippet(&body, 200)),
            });
        }
        let raw: serde_json::Value = response
            .json()
            .await
            .map_err(|err| ExecError::transport(&err))?;
        match raw.get(class_type) {
            None => Ok(None),
            Some(info) => serde_json::from_value::<ClassInfo>(info.clone())
                .map(Some)
                .map_err(|err| ExecError::Transport {
                    message: format!("undecodable object_info for {class_type}: {err}"),
                }),
        }
    }
}

async fn check_plain(response: reqwest::Response, what: &str) -> Result<(), ExecError> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let body = response.text().await.unwrap_or_default();
    Err(ExecError::Transport {
        message: format!("{what}: http {status}: {}", snippet(&body, 200)),
    })
}

fn reconnect_delay(options: &SessionOptions, attempt: u32) -> Duration {
    let factor = 1u32 << attempt.saturating_sub(1).min(16);
    options
        .reconnect_base_delay
        .saturating_mul(factor)
        .min(options.reconnect_max_delay)
}

fn snippet(text: &str, max: usize) -> String {
    let mut end = text.len().min(max);
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}
