//! Public configuration and event types for the workflow pool.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use promptfleet_client::{ExecError, NodeId, PreviewFrame, PreviewMetaFrame, SessionOptions, Url};

use crate::queue::QueueStats;

/// Pool-wide configuration.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Delay before a retryable failure re-enters the queue.
    pub retry_backoff: Duration,
    /// Bound between submission and the first sign of execution.
    /// `Duration::ZERO` disables the timer.
    pub execution_start_timeout: Duration,
    /// Sliding bound on per-node progress. `Duration::ZERO` disables it.
    pub node_execution_timeout: Duration,
    /// Interval of the keep-alive `GET /queue` ping. `Duration::ZERO`
    /// disables health checks.
    pub health_check_interval: Duration,
    /// How many waiting jobs one scheduling pass considers.
    pub schedule_window: usize,
    /// How many terminal job snapshots the result store retains.
    pub result_store_max: usize,
    /// Initial workflow-hash routing hints.
    pub workflow_affinities: Vec<WorkflowAffinity>,
    /// Attach per-node wall-clock timings to completed results.
    pub enable_profiling: bool,
}

impl PoolOptions {
    /// Default retry backoff.
    pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(1_000);
    /// Default execution-start timeout.
    pub const DEFAULT_EXECUTION_START_TIMEOUT: Duration = Duration::from_millis(5_000);
    /// Default per-node execution timeout.
    pub const DEFAULT_NODE_EXECUTION_TIMEOUT: Duration = Duration::from_millis(300_000);
    /// Default health-check interval.
    pub const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_millis(30_000);
    /// Default scheduling window.
    pub const DEFAULT_SCHEDULE_WINDOW: usize = 100;
    /// Default result store size.
    pub const DEFAULT_RESULT_STORE_MAX: usize = 256;
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            retry_backoff: Self::DEFAULT_RETRY_BACKOFF,
            execution_start_timeout: Self::DEFAULT_EXECUTION_START_TIMEOUT,
            node_execution_timeout: Self::DEFAULT_NODE_EXECUTION_TIMEOUT,
            health_check_interval: Self::DEFAULT_HEALTH_CHECK_INTERVAL,
            schedule_window: Self::DEFAULT_SCHEDULE_WINDOW,
            result_store_max: Self::DEFAULT_RESULT_STORE_MAX,
            workflow_affinities: Vec::new(),
            enable_profiling: false,
        }
    }
}

/// One managed server in the pool.
#[derive(Debug, Clone)]
pub struct PoolClientConfig {
    /// Pool-local client id, e.g. `"gpu-1"`.
    pub id: String,
    /// Session options for the server.
    pub options: SessionOptions,
}

impl PoolClientConfig {
    /// Config for `id` with defaults derived from `base_url`.
    pub fn new(id: impl Into<String>, base_url: Url) -> Self {
        Self {
            id: id.into(),
            options: SessionOptions::new(base_url),
        }
    }
}

/// Routing hint applied when a job carries no preference of its own.
#[derive(Debug, Clone, Default)]
pub struct WorkflowAffinity {
    /// Structural hash the hint applies to.
    pub workflow_hash: String,
    /// Clients to prefer; empty means any.
    pub preferred_client_ids: BTreeSet<String>,
    /// Clients to avoid.
    pub exclude_client_ids: BTreeSet<String>,
}

/// An image attachment uploaded before submission and wired into the graph.
#[derive(Debug, Clone)]
pub struct Attachment {
    /// Node whose input receives the uploaded filename.
    pub node_id: NodeId,
    /// Name of that input.
    pub input_name: String,
    /// Filename sent to the server.
    pub filename: String,
    /// Raw image bytes.
    pub bytes: Vec<u8>,
}

/// Per-job options.
#[derive(Debug, Clone)]
pub struct JobOptions {
    /// Attempts before the job fails for good.
    pub max_attempts: u32,
    /// Per-job override of the pool retry backoff.
    pub retry_delay: Option<Duration>,
    /// Higher runs first.
    pub priority: i32,
    /// Only these clients may run the job; empty means any.
    pub preferred_client_ids: BTreeSet<String>,
    /// These clients never run the job.
    pub exclude_client_ids: BTreeSet<String>,
    /// Extra node ids to collect outputs from, keyed by node id.
    pub include_outputs: Vec<NodeId>,
    /// Opaque caller data, echoed in snapshots.
    pub metadata: Option<Value>,
    /// Per-job override of the execution-start timeout.
    pub execution_start_timeout: Option<Duration>,
    /// Per-job override of the node-execution timeout.
    pub node_execution_timeout: Option<Duration>,
    /// Attachments uploaded before submission.
    pub attachments: Vec<Attachment>,
    /// Nodes to bypass-rewire out of the graph before submission.
    pub bypass_node_ids: Vec<NodeId>,
    /// Precomputed structural hash, when the caller already has one.
    pub workflow_hash: Option<String>,
}

impl JobOptions {
    /// Default attempt budget.
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            max_attempts: Self::DEFAULT_MAX_ATTEMPTS,
            retry_delay: None,
            priority: 0,
            preferred_client_ids: BTreeSet::new(),
            exclude_client_ids: BTreeSet::new(),
            include_outputs: Vec::new(),
            metadata: None,
            execution_start_timeout: None,
            node_execution_timeout: None,
            attachments: Vec::new(),
            bypass_node_ids: Vec::new(),
            workflow_hash: None,
        }
    }
}

/// Lifecycle state of a job record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    /// Waiting in the queue.
    Queued,
    /// Assigned to a client; an attempt is in flight.
    Running,
    /// Finished with a result.
    Completed,
    /// Finished without a result.
    Failed,
    /// Cancelled by the caller.
    Cancelled,
}

impl JobStatus {
    /// Whether the status is terminal.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

/// Mapped outputs of a completed job.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobOutputs {
    /// Outputs keyed by alias (or node id when no alias was set).
    pub mapped: BTreeMap<String, Value>,
    /// Outputs of nodes outside the requested output set.
    pub raw: BTreeMap<NodeId, Value>,
    /// Output node ids, in declaration order.
    pub nodes: Vec<NodeId>,
    /// The node-id to alias map that produced `mapped`.
    pub aliases: BTreeMap<NodeId, String>,
    /// The server prompt id of the successful attempt.
    pub prompt_id: String,
    /// Auto-randomized seed values actually submitted, per node.
    pub auto_seeds: BTreeMap<NodeId, i64>,
    /// Per-node wall-clock timings, when profiling was enabled.
    pub node_timings: Option<BTreeMap<NodeId, Duration>>,
}

impl JobOutputs {
    /// Look up an output by alias or node id.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.mapped.get(key).or_else(|| self.raw.get(key))
    }
}

/// Public view of one job record.
#[derive(Debug, Clone)]
pub struct JobSnapshot {
    /// The pool-assigned job id.
    pub job_id: Uuid,
    /// Structural hash of the job's workflow.
    pub workflow_hash: String,
    /// Current lifecycle state.
    pub status: JobStatus,
    /// Scheduling priority.
    pub priority: i32,
    /// Attempts started so far.
    pub attempts: u32,
    /// Attempt budget.
    pub max_attempts: u32,
    /// Clients excluded from running the job, including permanent
    /// incompatibilities learned along the way.
    pub exclude_client_ids: BTreeSet<String>,
    /// Client of the current (or last) attempt.
    pub client_id: Option<String>,
    /// Server prompt id of the current (or last) attempt.
    pub prompt_id: Option<String>,
    /// When the job was enqueued.
    pub enqueued_at: DateTime<Utc>,
    /// When execution began, for the current attempt.
    pub started_at: Option<DateTime<Utc>>,
    /// When the job reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
    /// Caller metadata.
    pub metadata: Option<Value>,
    /// Most recent failure.
    pub last_error: Option<ExecError>,
    /// Mapped outputs, once completed.
    pub result: Option<JobOutputs>,
}

/// Progress within the currently executing node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressInfo {
    /// Steps done.
    pub value: u64,
    /// Total steps.
    pub max: u64,
    /// Node the progress belongs to, when reported.
    pub node: Option<String>,
}

/// Point-in-time view of one managed client.
#[derive(Debug, Clone)]
pub struct ClientSnapshot {
    /// Pool-local client id.
    pub id: String,
    /// Whether the session is connected.
    pub online: bool,
    /// Whether an attempt is running on the client.
    pub busy: bool,
    /// Most recent error observed on the client.
    pub last_error: Option<String>,
    /// When the client last answered (connect, successful attempt, or ping).
    pub last_seen_at: Option<DateTime<Utc>>,
}

/// Point-in-time view of the whole pool.
#[derive(Debug, Clone, Default)]
pub struct PoolSnapshot {
    /// Managed clients.
    pub clients: Vec<ClientSnapshot>,
    /// Queue adapter counters.
    pub queue: QueueStats,
    /// Attempts currently in flight.
    pub running: usize,
}

/// Pool lifecycle event.
#[derive(Debug, Clone)]
pub enum PoolEvent {
    /// Initialization finished; the client set is stable.
    PoolReady {
        /// Clients that came online.
        client_ids: Vec<String>,
    },
    /// A non-job-scoped pool error.
    PoolError {
        /// Rendered error.
        message: String,
    },
    /// A client's online/busy state changed.
    ClientState {
        /// Pool-local client id.
        client_id: String,
        /// Connected?
        online: bool,
        /// Running an attempt?
        busy: bool,
        /// Most recent error observed on the client.
        last_error: Option<String>,
    },
    /// The failover strategy put a (client, workflow) pair on cooldown.
    ClientBlockedWorkflow {
        /// Pool-local client id.
        client_id: String,
        /// Structural hash of the blocked workflow.
        workflow_hash: String,
    },
    /// A cooldown ended through a success.
    ClientUnblockedWorkflow {
        /// Pool-local client id.
        client_id: String,
        /// Structural hash of the unblocked workflow.
        workflow_hash: String,
    },
    /// A job entered the queue (first time or after a retry).
    JobQueued {
        /// Job view at emission time.
        job: JobSnapshot,
    },
    /// A server accepted the job's prompt.
    JobAccepted {
        /// Job view at emission time.
        job: JobSnapshot,
    },
    /// Execution began on the server.
    JobStarted {
        /// Job view at emission time.
        job: JobSnapshot,
    },
    /// Node progress.
    JobProgress {
        /// The job.
        job_id: Uuid,
        /// Client executing it.
        client_id: String,
        /// Progress payload.
        progress: ProgressInfo,
    },
    /// A plain preview frame, attributed best-effort.
    JobPreview {
        /// The job.
        job_id: Uuid,
        /// Client executing it.
        client_id: String,
        /// Preview image.
        image: PreviewFrame,
    },
    /// A metadata preview frame, filtered by prompt id.
    JobPreviewMeta {
        /// The job.
        job_id: Uuid,
        /// Client executing it.
        client_id: String,
        /// Preview image with metadata.
        image: PreviewMetaFrame,
    },
    /// One output node finished.
    JobOutput {
        /// The job.
        job_id: Uuid,
        /// Client executing it.
        client_id: String,
        /// Alias or node id.
        key: String,
        /// Raw output payload.
        data: Value,
    },
    /// The job finished with a result.
    JobCompleted {
        /// Job view including the result.
        job: JobSnapshot,
    },
    /// An attempt (or the whole job) failed.
    JobFailed {
        /// Job view at emission time.
        job: JobSnapshot,
        /// Whether a retry is scheduled.
        will_retry: bool,
    },
    /// A retry was scheduled.
    JobRetrying {
        /// Job view at emission time.
        job: JobSnapshot,
        /// Backoff before the job is schedulable again.
        delay: Duration,
    },
    /// The job was cancelled.
    JobCancelled {
        /// Job view at emission time.
        job: JobSnapshot,
    },
}
