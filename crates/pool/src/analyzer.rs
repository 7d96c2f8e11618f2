//! Failure classification.
//!
//! [`analyze`] is a pure function from an [`ExecError`] to a retry/blocking
//! verdict. The scheduler combines the verdict with the job's attempt budget
//! and residual compatibility; the verdict alone decides nothing.

use promptfleet_client::{EnqueueDetails, ExecError, collect_error_strings};

/// How the failing client should be treated for this workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockClient {
    /// No blocking signal.
    None,
    /// Let the failover strategy cool the client down.
    Temporary,
    /// The client can never run this workflow; exclude it for the job.
    Permanent,
}

/// Coarse failure class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureType {
    /// The workflow itself is invalid; no client can run it.
    WorkflowInvalid,
    /// This client lacks something the workflow needs (model, node pack).
    ClientIncompatible,
    /// A passing condition: overload, restart, network blip.
    Transient,
    /// Unclassified.
    Unknown,
}

/// The analyzer's verdict for one failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureAnalysis {
    /// Whether another attempt could succeed somewhere.
    pub retryable: bool,
    /// Blocking signal for the failing client.
    pub block_client: BlockClient,
    /// Coarse class.
    pub failure_type: FailureType,
    /// Human-readable cause, for failure memory and error synthesis.
    pub reason: Option<String>,
}

/// Server error codes meaning "this client cannot run this workflow".
const CLIENT_INCOMPATIBLE_CODES: &[&str] = &[
    "value_not_in_list",
    "missing_checkpoint",
    "missing_model",
    "lora_missing",
    "checkpoint_not_found",
    "model_not_found",
];

/// Message fragments meaning the same, for servers that only send prose.
const CLIENT_INCOMPATIBLE_PATTERNS: &[&str] = &[
    "value not in list",
    "no module named",
    "not in checkpoint list",
    "model not found",
    "does not exist in the model folder",
];

/// Server error codes meaning the workflow graph itself is broken.
const WORKFLOW_INVALID_CODES: &[&str] = &[
    "invalid_prompt",
    "prompt_no_outputs",
    "prompt_outputs_failed_validation",
    "required_input_missing",
    "invalid_input_type",
    "bad_linked_input",
    "return_type_mismatch",
];

/// Execution-time exception fragments that mark a client incompatible.
const EXEC_INCOMPATIBLE_PATTERNS: &[&str] = &[
    "no module named",
    "model not found",
    "unknown model type",
    "safetensors_rust.safetensorerror",
];

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    let lowered = haystack.to_ascii_lowercase();
    needles.iter().any(|needle| lowered.contains(needle))
}

fn matched<'a>(strings: &'a [String], needles: &[&str]) -> Option<&'a str> {
    strings
        .iter()
        .find(|s| contains_any(s, needles))
        .map(String::as_str)
}

fn analyze_enqueue(details: &EnqueueDetails) -> FailureAnalysis {
    let mut strings = details
        .body_json
        .as_ref()
        .map(collect_error_strings)
        .unwrap_or_default();
    if let Some(snippet) = &details.body_snippet {
        strings.push(snippet.clone());
    }

    if let Some(hit) = matched(&strings, CLIENT_INCOMPATIBLE_CODES)
        .or_else(|| matched(&strings, CLIENT_INCOMPATIBLE_PATTERNS))
    {
        return FailureAnalysis {
            retryable: true,
            block_client: BlockClient::Permanent,
            failure_type: FailureType::ClientIncompatible,
            reason: Some(hit.to_string()),
        };
    }

    if let Some(hit) = matched(&strings, WORKFLOW_INVALID_CODES) {
        return FailureAnalysis {
            retryable: false,
            block_client: BlockClient::None,
            failure_type: FailureType::WorkflowInvalid,
            reason: Some(hit.to_string()),
        };
    }

    if details.status >= 500 || details.status == 429 {
        return FailureAnalysis {
            retryable: true,
            block_client: BlockClient::Temporary,
            failure_type: FailureType::Transient,
            reason: details.reason.clone(),
        };
    }

    FailureAnalysis {
        retryable: true,
        block_client: BlockClient::Temporary,
        failure_type: FailureType::Unknown,
        reason: details.reason.clone().or_else(|| strings.first().cloned()),
    }
}

/// Classify one attempt failure.
pub fn analyze(error: &ExecError) -> FailureAnalysis {
    match error {
        ExecError::MissingNode { node_id, .. } => FailureAnalysis {
            retryable: false,
            block_client: BlockClient::None,
            failure_type: FailureType::WorkflowInvalid,
            reason: Some(format!("missing node {node_id}")),
        },

        ExecError::EnqueueFailed(details) => analyze_enqueue(details),

        ExecError::CustomEvent {
            exception_message,
            exception_type,
            ..
        } => {
            let text = format!(
                "{} {}",
                exception_type.as_deref().unwrap_or_default(),
                exception_message
            );
            if contains_any(&text, EXEC_INCOMPATIBLE_PATTERNS) {
                FailureAnalysis {
                    retryable: true,
                    block_client: BlockClient::Permanent,
                    failure_type: FailureType::ClientIncompatible,
                    reason: Some(exception_message.clone()),
                }
            } else {
                FailureAnalysis {
                    retryable: true,
                    block_client: BlockClient::Temporary,
                    failure_type: FailureType::Unknown,
                    reason: Some(exception_message.clone()),
                }
            }
        }

        ExecError::ExecutionInterrupted { reason } => FailureAnalysis {
            retryable: false,
            block_client: BlockClient::None,
            failure_type: FailureType::Unknown,
            reason: reason.clone(),
        },

        ExecError::WorkflowNotSupported { .. } => FailureAnalysis {
            retryable: false,
            block_client: BlockClient::None,
            failure_type: FailureType::ClientIncompatible,
            reason: None,
        },

        ExecError::WentMissing { .. }
        | ExecError::Disconnected { .. }
        | ExecError::ExecutionTimeout { .. } => FailureAnalysis {
            retryable: true,
            block_client: BlockClient::Temporary,
            failure_type: FailureType::Transient,
            reason: Some(error.to_string()),
        },

        ExecError::ExecutionFailed { .. }
        | ExecError::FailedCache { .. }
        | ExecError::Transport { .. } => FailureAnalysis {
            retryable: true,
            block_client: BlockClient::Temporary,
            failure_type: FailureType::Unknown,
            reason: Some(error.to_string()),
        },
    }
}
