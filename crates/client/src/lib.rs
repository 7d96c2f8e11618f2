#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! Client-side plumbing for one ComfyUI-compatible server: typed event bus,
//! wire protocol decoding, workflow snapshots, and the HTTP + WebSocket
//! session. The `promptfleet-pool` crate orchestrates many of these
//! sessions.

pub mod error;
pub mod events;
pub mod protocol;
pub mod session;
pub mod workflow;

pub use error::{EnqueueDetails, ExecError, TimeoutPhase, collect_error_strings};
pub use events::{EventBus, Subscription};
pub use protocol::{
    BinaryFrame, ClassInfo, HistoryEntry, ImageFormat, PreviewFrame, PreviewMetaFrame,
    PromptAccepted, QueueSnapshot, ServerEvent, SystemStats, UploadedImage,
};
pub use session::{ClientSession, ConnectionState, SessionEvent, SessionOptions};
pub use workflow::{NodeId, OutputMap, Workflow, WorkflowError};

pub use reqwest::Url;
