//! Wire protocol types for ComfyUI-compatible servers.
//!
//! Text WebSocket frames carry JSON `{type, data}` envelopes decoded into
//! [`ServerEvent`]. Binary frames carry preview images with an 8-byte
//! big-endian header, optionally followed by a length-prefixed JSON metadata
//! block. REST request/response shapes live here next to their decoders.

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

/// Response to an accepted `POST /prompt`.
#[derive(Debug, Clone, Deserialize)]
pub struct PromptAccepted {
    /// Server-assigned prompt id; the correlation key for every event.
    pub prompt_id: String,
    /// Position in the server queue, when reported.
    #[serde(default)]
    pub number: Option<u64>,
}

/// Snapshot of the server's execution queue (`GET /queue`).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueueSnapshot {
    /// Currently executing entries, as raw `[index, prompt_id, …]` rows.
    #[serde(default)]
    pub queue_running: Vec<Value>,
    /// Waiting entries, same row shape.
    #[serde(default)]
    pub queue_pending: Vec<Value>,
}

impl QueueSnapshot {
    fn row_matches(row: &Value, prompt_id: &str) -> bool {
        row.get(1).and_then(Value::as_str) == Some(prompt_id)
    }

    /// Whether the given prompt appears in the running or pending queue.
    pub fn contains(&self, prompt_id: &str) -> bool {
        self.queue_running
            .iter()
            .chain(self.queue_pending.iter())
            .any(|row| Self::row_matches(row, prompt_id))
    }
}

/// Status block of a history entry.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistoryStatus {
    /// Whether the server considers the prompt fully executed.
    #[serde(default)]
    pub completed: bool,
    /// Free-form status string, e.g. `success`.
    #[serde(default)]
    pub status_str: Option<String>,
}

/// One entry of `GET /history/{prompt_id}`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistoryEntry {
    /// Execution status, when the server reports one.
    #[serde(default)]
    pub status: Option<HistoryStatus>,
    /// Outputs keyed by node id.
    #[serde(default)]
    pub outputs: serde_json::Map<String, Value>,
}

impl HistoryEntry {
    /// Whether the entry is a completed run with at least one defined output.
    pub fn is_completed_with_outputs(&self) -> bool {
        let completed = self.status.as_ref().is_some_and(|s| s.completed);
        completed && self.outputs.values().any(|v| !v.is_null())
    }
}

/// Response to `POST /upload/image`.
#[derive(Debug, Clone, Deserialize)]
pub struct UploadedImage {
    /// Stored filename.
    pub name: String,
    /// Subfolder the server placed the file in, empty for the root.
    #[serde(default)]
    pub subfolder: String,
    /// Upload kind, usually `input`.
    #[serde(default, rename = "type")]
    pub kind: String,
}

impl UploadedImage {
    /// The filename as workflow inputs reference it (`subfolder/name`).
    pub fn workflow_path(&self) -> String {
        if self.subfolder.is_empty() {
            self.name.clone()
        } else {
            format!("{}/{}", self.subfolder, self.name)
        }
    }
}

/// Class definition returned by `GET /object_info/{class_type}`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClassInfo {
    /// Declared inputs.
    #[serde(default)]
    pub input: ClassInputs,
    /// Output slot types, in slot order.
    #[serde(default)]
    pub output: Vec<String>,
}

/// Input declarations of a node class, in declaration order.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClassInputs {
    /// Required inputs: name to `[type_spec, options?]` declaration.
    #[serde(default)]
    pub required: serde_json::Map<String, Value>,
    /// Optional inputs, same shape.
    #[serde(default)]
    pub optional: serde_json::Map<String, Value>,
}

impl ClassInfo {
    /// Iterate `(input_name, declared_type)` over required then optional
    /// inputs, in declaration order.
    ///
    /// Only inputs declared with a type name string yield a type; enum-list
    /// widget inputs are skipped.
    pub fn link_inputs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.input
            .required
            .iter()
            .chain(self.input.optional.iter())
            .filter_map(|(name, spec)| {
                let ty = spec.get(0).and_then(Value::as_str)?;
                Some((name.as_str(), ty))
            })
    }
}

/// Subset of `GET /system_stats` the core cares about.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SystemStats {
    /// Server/system block, kept raw.
    #[serde(default)]
    pub system: Value,
    /// Per-device stats, kept raw.
    #[serde(default)]
    pub devices: Vec<Value>,
}

/// Typed server event decoded from a text frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    /// Periodic queue status; also the feature-flag handshake carrier.
    Status(StatusEvent),
    /// The server began executing a prompt.
    ExecutionStart(ExecutionStartEvent),
    /// Nodes whose cached outputs are being reused.
    ExecutionCached(ExecutionCachedEvent),
    /// The currently executing node changed.
    Executing(ExecutingEvent),
    /// Progress within the current node.
    Progress(ProgressEvent),
    /// A node finished and produced an output.
    Executed(ExecutedEvent),
    /// The whole prompt finished successfully.
    ExecutionSuccess(ExecutionSuccessEvent),
    /// The prompt failed server-side.
    ExecutionError(ExecutionErrorEvent),
    /// The prompt was interrupted server-side.
    ExecutionInterrupted(ExecutionInterruptedEvent),
}

impl ServerEvent {
    /// The prompt id this event concerns, when it carries one.
    pub fn prompt_id(&self) -> Option<&str> {
        match self {
            ServerEvent::Status(_) => None,
            ServerEvent::ExecutionStart(e) => Some(&e.prompt_id),
            ServerEvent::ExecutionCached(e) => Some(&e.prompt_id),
            ServerEvent::Executing(e) => e.prompt_id.as_deref(),
            ServerEvent::Progress(e) => e.prompt_id.as_deref(),
            ServerEvent::Executed(e) => Some(&e.prompt_id),
            ServerEvent::ExecutionSuccess(e) => Some(&e.prompt_id),
            ServerEvent::ExecutionError(e) => Some(&e.prompt_id),
            ServerEvent::ExecutionInterrupted(e) => e.prompt_id.as_deref(),
        }
    }
}

/// Payload of a `status` event, kept raw apart from known flags.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct StatusEvent {
    /// Raw status block.
    #[serde(default)]
    pub status: Value,
    /// Session id echo, when present.
    #[serde(default)]
    pub sid: Option<String>,
}

/// Payload of `execution_start`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ExecutionStartEvent {
    /// The prompt that started.
    pub prompt_id: String,
}

/// Payload of `execution_cached`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ExecutionCachedEvent {
    /// Nodes served from cache.
    #[serde(default)]
    pub nodes: Vec<String>,
    /// The prompt the cache hit belongs to.
    pub prompt_id: String,
}

/// Payload of `executing`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ExecutingEvent {
    /// Node now executing; `None` marks the end of the run.
    #[serde(default)]
    pub node: Option<String>,
    /// The prompt being executed.
    #[serde(default)]
    pub prompt_id: Option<String>,
}

/// Payload of `progress`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProgressEvent {
    /// Steps done.
    #[serde(default)]
    pub value: u64,
    /// Total steps.
    #[serde(default)]
    pub max: u64,
    /// Node the progress belongs to, when reported.
    #[serde(default)]
    pub node: Option<String>,
    /// The prompt being executed.
    #[serde(default)]
    pub prompt_id: Option<String>,
}

/// Payload of `executed`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ExecutedEvent {
    /// Node that produced the output.
    pub node: String,
    /// The node's output payload.
    #[serde(default)]
    pub output: Value,
    /// The prompt the output belongs to.
    pub prompt_id: String,
}

/// Payload of `execution_success`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ExecutionSuccessEvent {
    /// The prompt that finished.
    pub prompt_id: String,
}

/// Payload of `execution_error`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ExecutionErrorEvent {
    /// The prompt that failed.
    pub prompt_id: String,
    /// Failing node id, when reported.
    #[serde(default)]
    pub node_id: Option<String>,
    /// Failing node class, when reported.
    #[serde(default)]
    pub node_type: Option<String>,
    /// Exception message.
    #[serde(default)]
    pub exception_message: Option<String>,
    /// Exception type.
    #[serde(default)]
    pub exception_type: Option<String>,
    /// Traceback lines.
    #[serde(default)]
    pub traceback: Vec<String>,
}

/// Payload of `execution_interrupted`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ExecutionInterruptedEvent {
    /// The prompt that was interrupted.
    #[serde(default)]
    pub prompt_id: Option<String>,
    /// Node that was executing at interruption, when reported.
    #[serde(default)]
    pub node_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
}

/// Decode one text frame into a [`ServerEvent`].
///
/// Returns `Ok(None)` for event types this crate does not model; the caller
/// is expected to ignore them.
pub fn parse_server_event(text: &str) -> Result<Option<ServerEvent>, serde_json::Error> {
    let envelope: Envelope = serde_json::from_str(text)?;
    let data = envelope.data;
    let event = match envelope.kind.as_str() {
        "status" => ServerEvent::Status(serde_json::from_value(data)?),
        "execution_start" => ServerEvent::ExecutionStart(serde_json::from_value(data)?),
        "execution_cached" => ServerEvent::ExecutionCached(serde_json::from_value(data)?),
        "executing" => ServerEvent::Executing(serde_json::from_value(data)?),
        "progress" => ServerEvent::Progress(serde_json::from_value(data)?),
        "executed" => ServerEvent::Executed(serde_json::from_value(data)?),
        "execution_success" => ServerEvent::ExecutionSuccess(serde_json::from_value(data)?),
        "execution_error" => ServerEvent::ExecutionError(serde_json::from_value(data)?),
        "execution_interrupted" => {
            ServerEvent::ExecutionInterrupted(serde_json::from_value(data)?)
        }
        _ => return Ok(None),
    };
    Ok(Some(event))
}

/// Binary frame event type for plain previews.
pub const BINARY_PREVIEW: u32 = 1;
/// Binary frame event type for previews with a metadata block.
pub const BINARY_PREVIEW_META: u32 = 4;

/// Image encoding of a preview frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    /// JPEG-encoded preview.
    Jpeg,
    /// PNG-encoded preview.
    Png,
    /// An encoding this crate does not know; the raw discriminant is kept.
    Other(u32),
}

impl From<u32> for ImageFormat {
    fn from(raw: u32) -> Self {
        match raw {
            1 => ImageFormat::Jpeg,
            2 => ImageFormat::Png,
            other => ImageFormat::Other(other),
        }
    }
}

/// A plain preview image pushed by the server.
///
/// Plain previews carry no prompt id; on a session with overlapping jobs
/// their attribution is best-effort.
#[derive(Debug, Clone, PartialEq)]
pub struct PreviewFrame {
    /// Image encoding.
    pub format: ImageFormat,
    /// Encoded image bytes.
    pub data: Vec<u8>,
}

/// A preview image with a JSON metadata block.
#[derive(Debug, Clone, PartialEq)]
pub struct PreviewMetaFrame {
    /// Image encoding.
    pub format: ImageFormat,
    /// Decoded metadata block; may carry `prompt_id` for strict filtering.
    pub metadata: Value,
    /// Encoded image bytes.
    pub data: Vec<u8>,
}

impl PreviewMetaFrame {
    /// `prompt_id` from the metadata block, when present.
    pub fn prompt_id(&self) -> Option<&str> {
        self.metadata.get("prompt_id").and_then(Value::as_str)
    }
}

/// A decoded binary frame.
#[derive(Debug, Clone, PartialEq)]
pub enum BinaryFrame {
    /// Plain preview.
    Preview(PreviewFrame),
    /// Preview with metadata.
    PreviewMeta(PreviewMetaFrame),
}

/// Problems decoding a binary frame.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The frame was shorter than its fixed header.
    #[error("binary frame truncated: {len} bytes")]
    Truncated {
        /// Actual frame length.
        len: usize,
    },
    /// The metadata block was not valid JSON.
    #[error("preview metadata is not valid JSON")]
    BadMetadata(#[source] serde_json::Error),
}

fn read_u32_be(bytes: &[u8], at: usize) -> Option<u32> {
    let chunk: [u8; 4] = bytes.get(at..at + 4)?.try_into().ok()?;
    Some(u32::from_be_bytes(chunk))
}

/// Decode one binary frame.
///
/// Returns `Ok(None)` for event types other than the preview pair; the
/// caller is expected to ignore them.
pub fn parse_binary_frame(bytes: &[u8]) -> Result<Option<BinaryFrame>, FrameError> {
    let (Some(event_type), Some(image_type)) = (read_u32_be(bytes, 0), read_u32_be(bytes, 4))
    else {
        return Err(FrameError::Truncated { len: bytes.len() });
    };
    let format = ImageFormat::from(image_type);

    match event_type {
        BINARY_PREVIEW => Ok(Some(BinaryFrame::Preview(PreviewFrame {
            format,
            data: bytes[8..].to_vec(),
        }))),
        BINARY_PREVIEW_META => {
            let Some(meta_len) = read_u32_be(bytes, 8) else {
                return Err(FrameError::Truncated { len: bytes.len() });
            };
            let meta_end = 12usize.saturating_add(meta_len as usize);
            let Some(meta_bytes) = bytes.get(12..meta_end) else {
                return Err(FrameError::Truncated { len: bytes.len() });
            };
            let metadata =
                serde_json::from_slice(meta_bytes).map_err(FrameError::BadMetadata)?;
            Ok(Some(BinaryFrame::PreviewMeta(PreviewMetaFrame {
                format,
                metadata,
                data: bytes[meta_end..].to_vec(),
            })))
        }
        _ => Ok(None),
    }
}
