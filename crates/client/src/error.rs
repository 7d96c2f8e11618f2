//! Error taxonomy shared by the session and the pool.
//!
//! Every failure a job can experience maps to one [`ExecError`] variant with
//! a stable [`ExecError::code`]. The pool's failure analyzer keys its
//! classification off these variants, so new failure modes should extend the
//! enum rather than smuggle through `Transport`.

use std::collections::BTreeMap;

use thiserror::Error;

/// What the server said when it rejected a prompt submission.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnqueueDetails {
    /// HTTP status code of the rejection.
    pub status: u16,
    /// HTTP status text, e.g. `Bad Request`.
    pub status_text: String,
    /// Parsed response body, when it was valid JSON.
    pub body_json: Option<serde_json::Value>,
    /// Leading snippet of the response body, when it was not JSON.
    pub body_snippet: Option<String>,
    /// Best-effort reason extracted from the body.
    pub reason: Option<String>,
}

impl std::fmt::Display for EnqueueDetails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "http {} {}", self.status, self.status_text)?;
        if let Some(reason) = &self.reason {
            write!(f, ": {reason}")?;
        } else if let Some(snippet) = &self.body_snippet {
            write!(f, ": {snippet}")?;
        }
        Ok(())
    }
}

/// Phase a timed-out attempt was in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutPhase {
    /// The server accepted the prompt but execution never began.
    Start,
    /// A node made no progress for the configured window.
    Node,
}

/// Terminal failure of one execution attempt.
#[derive(Debug, Clone, Error)]
pub enum ExecError {
    /// The server rejected the `/prompt` submission.
    #[error("server rejected prompt submission: {0}")]
    EnqueueFailed(EnqueueDetails),

    /// A workflow node (or its class definition) does not exist.
    #[error("node {node_id} is missing or has no class definition")]
    MissingNode {
        /// The node id the workflow referenced.
        node_id: String,
        /// The node's class type, when known.
        class_type: Option<String>,
    },

    /// The server no longer knows the prompt and has no history for it.
    #[error("prompt {prompt_id} vanished from the server queue with no history")]
    WentMissing {
        /// The server-assigned prompt id.
        prompt_id: String,
    },

    /// The connection dropped and did not recover within the grace window.
    #[error("connection lost during execution")]
    Disconnected {
        /// The prompt id of the attempt, when submission had happened.
        prompt_id: Option<String>,
    },

    /// The server reported success but required outputs never materialized.
    #[error("execution finished without outputs for nodes [{}]", .missing.join(", "))]
    ExecutionFailed {
        /// Output node ids that were still missing.
        missing: Vec<String>,
    },

    /// The server emitted an `execution_error` event.
    #[error("server execution error: {exception_message}")]
    CustomEvent {
        /// Node that raised the error, when reported.
        node_id: Option<String>,
        /// Class type of that node, when reported.
        node_type: Option<String>,
        /// Python exception type, when reported.
        exception_type: Option<String>,
        /// Server-side exception message.
        exception_message: String,
        /// Server-side traceback lines.
        traceback: Vec<String>,
    },

    /// The execution was interrupted, server-side or by cancellation.
    #[error("execution interrupted")]
    ExecutionInterrupted {
        /// Why the interruption happened, when known.
        reason: Option<String>,
    },

    /// `execution_cached` claimed completion but history had no outputs.
    #[error("cached execution of prompt {prompt_id} has no outputs in history")]
    FailedCache {
        /// The server-assigned prompt id.
        prompt_id: String,
    },

    /// Every eligible client permanently rejected this workflow.
    #[error("no remaining client supports workflow {workflow_hash}")]
    WorkflowNotSupported {
        /// Structural hash of the rejected workflow.
        workflow_hash: String,
        /// Per-client rejection reason.
        reasons: BTreeMap<String, String>,
    },

    /// An attempt-level timeout fired.
    #[error("execution timed out after {timeout_ms} ms ({phase:?})")]
    ExecutionTimeout {
        /// Which timer fired.
        phase: TimeoutPhase,
        /// The configured window, in milliseconds.
        timeout_ms: u64,
    },

    /// HTTP or WebSocket transport failure outside the taxonomy above.
    #[error("transport error: {message}")]
    Transport {
        /// Rendered source error.
        message: String,
    },
}

impl ExecError {
    /// Stable machine-readable code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            ExecError::EnqueueFailed(_) => "enqueue_failed",
            ExecError::MissingNode { .. } => "missing_node",
            ExecError::WentMissing { .. } => "went_missing",
            ExecError::Disconnected { .. } => "disconnected",
            ExecError::ExecutionFailed { .. } => "execution_failed",
            ExecError::CustomEvent { .. } => "custom_event",
            ExecError::ExecutionInterrupted { .. } => "execution_interrupted",
            ExecError::FailedCache { .. } => "failed_cache",
            ExecError::WorkflowNotSupported { .. } => "workflow_not_supported",
            ExecError::ExecutionTimeout { .. } => "execution_timeout",
            ExecError::Transport { .. } => "transport",
        }
    }

    pub(crate) fn transport(err: &reqwest::Error) -> Self {
        ExecError::Transport {
            message: format!("{err:#}"),
        }
    }
}

fn push_error_object(value: &serde_json::Value, out: &mut Vec<String>) {
    match value {
        serde_json::Value::String(s) => out.push(s.clone()),
        serde_json::Value::Object(map) => {
            for key in ["type", "message", "details"] {
                if let Some(s) = map.get(key).and_then(serde_json::Value::as_str) {
                    if !s.is_empty() {
                        out.push(s.to_string());
                    }
                }
            }
        }
        _ => {}
    }
}

/// Flatten the error strings a server rejection body may carry.
///
/// Covers the shapes ComfyUI-compatible servers use: a top-level `error`
/// (string or `{type, message, details}`), an `errors` array, and the
/// per-node `node_errors` map. Order follows the body, most significant
/// first.
pub fn collect_error_strings(body: &serde_json::Value) -> Vec<String> {
    let mut out = Vec::new();
    if let Some(error) = body.get("error") {
        push_error_object(error, &mut out);
    }
    if let Some(errors) = body.get("errors").and_then(serde_json::Value::as_array) {
        for entry in errors {
            push_error_object(entry, &mut out);
        }
    }
    if let Some(node_errors) = body.get("node_errors").and_then(serde_json::Value::as_object) {
        for node in node_errors.values() {
            if let Some(errors) = node.get("errors").and_then(serde_json::Value::as_array) {
                for entry in errors {
                    push_error_object(entry, &mut out);
                }
            }
        }
    }
    out
}
