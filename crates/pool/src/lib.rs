#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! Concurrent workflow scheduling over a pool of ComfyUI-compatible servers:
//! queue adapter, failover strategy, client manager, failure analyzer,
//! per-attempt execution wrapper, and the top-level [`WorkflowPool`].

pub mod analyzer;
pub mod api;
pub mod failover;
pub mod pool;
pub mod queue;
pub mod wrapper;

mod manager;
mod sink;

pub use analyzer::{BlockClient, FailureAnalysis, FailureType, analyze};
pub use api::{
    Attachment, ClientSnapshot, JobOptions, JobOutputs, JobSnapshot, JobStatus, PoolClientConfig,
    PoolEvent, PoolOptions, PoolSnapshot, ProgressInfo, WorkflowAffinity,
};
pub use failover::{CooldownStrategy, FailoverStrategy};
pub use pool::{PoolError, WorkflowPool};
pub use queue::{
    MemoryQueue, QueueAdapter, QueueError, QueuePayload, QueueStats, Reservation,
};
pub use wrapper::{ExecutionObserver, ExecutionRequest, JobExecution, NoopObserver};

pub use promptfleet_client as client;
pub use promptfleet_client::{
    EnqueueDetails, ExecError, OutputMap, SessionOptions, TimeoutPhase, Workflow,
};
