//! The workflow pool: job records, scheduling passes, retries, cancellation.
//!
//! The pool is logically single-threaded over its own invariants: one
//! scheduler task runs passes (woken by a [`Notify`], which coalesces
//! concurrent triggers into a single rerun), and every record mutation
//! happens either on the scheduler's control path or in the outcome handler
//! of the one attempt that owns the job. Events are never emitted while the
//! state lock is held.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use chrono::Utc;
use thiserror::Error;
use tokio::sync::{Notify, broadcast, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use promptfleet_client::{
    ExecError, OutputMap, PreviewFrame, PreviewMetaFrame, Subscription, Workflow,
};
use serde_json::Value;

use crate::analyzer::{BlockClient, FailureAnalysis, FailureType, analyze};
use crate::api::{
    JobOptions, JobOutputs, JobSnapshot, JobStatus, PoolClientConfig, PoolEvent, PoolOptions,
    PoolSnapshot, ProgressInfo,
};
use crate::failover::{CooldownStrategy, FailoverStrategy};
use crate::manager::{ClaimedClient, ClientManager, CompatJob};
use crate::queue::{MemoryQueue, QueueAdapter, QueueError, QueuePayload, Reservation};
use crate::sink::EventSink;
use crate::wrapper::{ExecutionObserver, ExecutionRequest, JobExecution};

/// Errors surfaced by pool operations.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The queue adapter rejected the payload.
    #[error(transparent)]
    Queue(#[from] QueueError),
    /// The pool no longer accepts work.
    #[error("pool is shutting down")]
    ShuttingDown,
    /// A client session could not be built during startup.
    #[error("client initialization failed: {0}")]
    Init(String),
}

struct JobRecord {
    job_id: Uuid,
    workflow: Workflow,
    workflow_hash: String,
    output_map: OutputMap,
    options: JobOptions,
    status: JobStatus,
    attempts: u32,
    enqueued_at: chrono::DateTime<Utc>,
    started_at: Option<chrono::DateTime<Utc>>,
    completed_at: Option<chrono::DateTime<Utc>>,
    client_id: Option<String>,
    prompt_id: Option<String>,
    last_error: Option<ExecError>,
    result: Option<JobOutputs>,
}

impl JobRecord {
    fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            job_id: self.job_id,
            workflow_hash: self.workflow_hash.clone(),
            status: self.status,
            priority: self.options.priority,
            attempts: self.attempts,
            max_attempts: self.options.max_attempts,
            exclude_client_ids: self.options.exclude_client_ids.clone(),
            client_id: self.client_id.clone(),
            prompt_id: self.prompt_id.clone(),
            enqueued_at: self.enqueued_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            metadata: self.options.metadata.clone(),
            last_error: self.last_error.clone(),
            result: self.result.clone(),
        }
    }
}

struct FailureNote {
    analysis: FailureAnalysis,
    reason: String,
}

struct RunningJob {
    cancel: CancellationToken,
    client_id: String,
}

#[derive(Default)]
struct PoolState {
    records: HashMap<Uuid, JobRecord>,
    running: HashMap<Uuid, RunningJob>,
    failure_memory: HashMap<Uuid, std::collections::BTreeMap<String, FailureNote>>,
    affinities: HashMap<String, crate::api::WorkflowAffinity>,
    results: VecDeque<JobSnapshot>,
    shutting_down: bool,
}

fn push_result(state: &mut PoolState, snapshot: JobSnapshot, max: usize) {
    state.results.push_back(snapshot);
    while state.results.len() > max.max(1) {
        state.results.pop_front();
    }
}

struct PoolShared {
    options: PoolOptions,
    queue: Arc<dyn QueueAdapter>,
    manager: Arc<ClientManager>,
    sink: Arc<EventSink>,
    state: std::sync::Mutex<PoolState>,
    schedule: Notify,
    cancel: CancellationToken,
    snapshot_tx: watch::Sender<PoolSnapshot>,
    tasks: std::sync::Mutex<JoinSet<()>>,
}

impl PoolShared {
    fn state(&self) -> std::sync::MutexGuard<'_, PoolState> {
        self.state.lock().expect("pool state lock poisoned")
    }

    fn permanent_failures(&self, job_id: Uuid) -> BTreeSet<String> {
        let state = self.state();
        state
            .failure_memory
            .get(&job_id)
            .map(|memory| {
                memory
                    .iter()
                    .filter(|(_, note)| note.analysis.block_client == BlockClient::Permanent)
                    .map(|(client_id, _)| client_id.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    async fn push_snapshot(&self) {
        let queue = self.queue.stats().await;
        let clients = self.manager.snapshots();
        let running = self.state().running.len();
        let _ = self.snapshot_tx.send(PoolSnapshot {
            clients,
            queue,
            running,
        });
    }
}

/// Orchestrates jobs over a pool of ComfyUI-compatible servers.
pub struct WorkflowPool {
    shared: Arc<PoolShared>,
}

impl WorkflowPool {
    /// Start a pool with the default in-memory queue and cooldown strategy.
    pub async fn start(
        clients: Vec<PoolClientConfig>,
        options: PoolOptions,
    ) -> Result<Self, PoolError> {
        Self::start_with(
            clients,
            options,
            Arc::new(MemoryQueue::unbounded()),
            Arc::new(CooldownStrategy::default()),
        )
        .await
    }

    /// Start a pool with explicit queue adapter and failover strategy.
    pub async fn start_with(
        clients: Vec<PoolClientConfig>,
        options: PoolOptions,
        queue: Arc<dyn QueueAdapter>,
        strategy: Arc<dyn FailoverStrategy>,
    ) -> Result<Self, PoolError> {
        let sink = Arc::new(EventSink::new());
        let cancel = CancellationToken::new();
        let manager = ClientManager::new(strategy, Arc::clone(&sink), cancel.child_token());

        let online = manager
            .initialize(clients)
            .await
            .map_err(|err| PoolError::Init(err.to_string()))?;
        tracing::info!(clients = ?online, "pool ready");
        manager.spawn_health_loop(options.health_check_interval);

        let affinities = options
            .workflow_affinities
            .iter()
            .map(|affinity| (affinity.workflow_hash.clone(), affinity.clone()))
            .collect();

        let (snapshot_tx, _) = watch::channel(PoolSnapshot::default());
        let shared = Arc::new(PoolShared {
            options,
            queue,
            manager,
            sink,
            state: std::sync::Mutex::new(PoolState {
                affinities,
                ..PoolState::default()
            }),
            schedule: Notify::new(),
            cancel,
            snapshot_tx,
            tasks: std::sync::Mutex::new(JoinSet::new()),
        });

        tokio::spawn(scheduler_loop(Arc::clone(&shared)));
        shared.push_snapshot().await;
        Ok(Self { shared })
    }

    /// Register a handler on the synchronous event bus.
    pub fn on<F>(&self, handler: F) -> Subscription<PoolEvent>
    where
        F: FnMut(&PoolEvent) + Send + 'static,
    {
        self.shared.sink.bus().on(handler)
    }

    /// Register a one-shot handler on the synchronous event bus.
    pub fn once<F>(&self, handler: F) -> Subscription<PoolEvent>
    where
        F: FnMut(&PoolEvent) + Send + 'static,
    {
        self.shared.sink.bus().once(handler)
    }

    /// Subscribe to the event stream for async consumption.
    pub fn events(&self) -> broadcast::Receiver<PoolEvent> {
        self.shared.sink.subscribe()
    }

    /// Current pool snapshot.
    pub fn snapshot(&self) -> PoolSnapshot {
        self.shared.snapshot_tx.borrow().clone()
    }

    /// Watch pool snapshots.
    pub fn watch_snapshot(&self) -> watch::Receiver<PoolSnapshot> {
        self.shared.snapshot_tx.subscribe()
    }

    /// Look up a job, live or recently terminal.
    pub fn job(&self, job_id: Uuid) -> Option<JobSnapshot> {
        let state = self.shared.state();
        state
            .records
            .get(&job_id)
            .map(JobRecord::snapshot)
            .or_else(|| {
                state
                    .results
                    .iter()
                    .rev()
                    .find(|snapshot| snapshot.job_id == job_id)
                    .cloned()
            })
    }

    /// Submit a workflow. Returns the pool-assigned job id.
    pub async fn enqueue(
        &self,
        workflow: Workflow,
        output_map: OutputMap,
        mut options: JobOptions,
    ) -> Result<Uuid, PoolError> {
        let workflow_hash = options
            .workflow_hash
            .take()
            .unwrap_or_else(|| workflow.structural_hash());
        let job_id = Uuid::new_v4();

        let mut output_map = output_map;
        for node in &options.include_outputs {
            if !output_map.node_ids.contains(node) {
                output_map.node_ids.push(node.clone());
            }
        }
        options.max_attempts = options.max_attempts.max(1);

        let (snapshot, payload) = {
            let mut state = self.shared.state();
            if state.shutting_down {
                return Err(PoolError::ShuttingDown);
            }
            if let Some(affinity) = state.affinities.get(&workflow_hash) {
                if options.preferred_client_ids.is_empty() {
                    options.preferred_client_ids = affinity.preferred_client_ids.clone();
                }
                if options.exclude_client_ids.is_empty() {
                    options.exclude_client_ids = affinity.exclude_client_ids.clone();
                }
            }
            let payload = QueuePayload {
                job_id,
                workflow_hash: workflow_hash.clone(),
                priority: options.priority,
                attempts: 0,
                max_attempts: options.max_attempts,
                preferred_client_ids: options.preferred_client_ids.clone(),
                exclude_client_ids: options.exclude_client_ids.clone(),
            };
            let record = JobRecord {
                job_id,
                workflow,
                workflow_hash,
                output_map,
                options,
                status: JobStatus::Queued,
                attempts: 0,
                enqueued_at: Utc::now(),
                started_at: None,
                completed_at: None,
                client_id: None,
                prompt_id: None,
                last_error: None,
                result: None,
            };
            let snapshot = record.snapshot();
            state.records.insert(job_id, record);
            (snapshot, payload)
        };

        if let Err(err) = self.shared.queue.enqueue(payload).await {
            self.shared.state().records.remove(&job_id);
            return Err(err.into());
        }

        tracing::debug!(%job_id, hash = %snapshot.workflow_hash, "job queued");
        self.shared.sink.emit(PoolEvent::JobQueued { job: snapshot });
        self.shared.schedule.notify_one();
        Ok(job_id)
    }

    /// Cancel a job. Returns whether anything was cancelled.
    ///
    /// A waiting job is pulled from the queue; a running job has its attempt
    /// cancelled and an interrupt sent to the owning server. Idempotent:
    /// terminal and unknown jobs return `false`.
    pub async fn cancel(&self, job_id: Uuid) -> bool {
        let waiting = {
            let state = self.shared.state();
            state
                .records
                .get(&job_id)
                .is_some_and(|record| record.status == JobStatus::Queued)
                && !state.running.contains_key(&job_id)
        };

        if waiting && self.shared.queue.remove(job_id).await {
            let snapshot = {
                let mut state = self.shared.state();
                let Some(mut record) = state.records.remove(&job_id) else {
                    return false;
                };
                record.status = JobStatus::Cancelled;
                record.completed_at = Some(Utc::now());
                let snapshot = record.snapshot();
                push_result(&mut state, snapshot.clone(), self.shared.options.result_store_max);
                snapshot
            };
            self.shared.sink.emit(PoolEvent::JobCancelled { job: snapshot });
            self.shared.push_snapshot().await;
            return true;
        }

        let active = {
            let mut state = self.shared.state();
            let Some(running) = state.running.get(&job_id) else {
                return false;
            };
            let token = running.cancel.clone();
            let client_id = running.client_id.clone();
            let Some(record) = state.records.get_mut(&job_id) else {
                return false;
            };
            if record.status.is_terminal() {
                return false;
            }
            record.status = JobStatus::Cancelled;
            (token, client_id, record.prompt_id.clone(), record.snapshot())
        };

        let (token, client_id, prompt_id, snapshot) = active;
        token.cancel();
        if let Some(session) = self.shared.manager.session(&client_id) {
            let job = job_id;
            tokio::spawn(async move {
                if let Err(err) = session.interrupt(prompt_id.as_deref()).await {
                    tracing::warn!(job_id = %job, error = %err, "interrupt request failed");
                }
            });
        }
        self.shared.sink.emit(PoolEvent::JobCancelled { job: snapshot });
        true
    }

    /// Stop everything: scheduler, health checks, sessions, queue.
    ///
    /// Active attempts are cancelled and their reservations released; no
    /// events are emitted past this point.
    pub async fn shutdown(&self) {
        self.shared.state().shutting_down = true;
        self.shared.sink.mute();
        self.shared.cancel.cancel();

        let mut tasks = {
            let mut guard = self.shared.tasks.lock().expect("pool task lock poisoned");
            std::mem::take(&mut *guard)
        };
        while tasks.join_next().await.is_some() {}

        self.shared.queue.close().await;
        self.shared.manager.shutdown().await;
        tracing::info!("pool shut down");
    }
}

async fn scheduler_loop(shared: Arc<PoolShared>) {
    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => return,
            _ = shared.schedule.notified() => {}
        }
        // Keep passing until a full pass assigns nothing. Triggers arriving
        // mid-pass latch in the Notify and rerun immediately.
        loop {
            match run_pass(&shared).await {
                Ok(0) => break,
                Ok(_) => continue,
                Err(err) => {
                    tracing::error!(error = %format!("{err:#}"), "scheduling pass failed");
                    shared.sink.emit(PoolEvent::PoolError {
                        message: format!("{err:#}"),
                    });
                    break;
                }
            }
        }
        shared.push_snapshot().await;
    }
}

struct Candidate {
    position: usize,
    payload: QueuePayload,
    compatible: Vec<String>,
}

async fn run_pass(shared: &Arc<PoolShared>) -> anyhow::Result<usize> {
    let idle = shared.manager.stable_ids();
    if idle.is_empty() {
        return Ok(0);
    }

    let payloads = shared.queue.peek(shared.options.schedule_window).await;
    if payloads.is_empty() {
        return Ok(0);
    }

    let mut candidates = Vec::new();
    for (position, payload) in payloads.into_iter().enumerate() {
        let permanently_failed = shared.permanent_failures(payload.job_id);
        let job = CompatJob {
            workflow_hash: &payload.workflow_hash,
            preferred: &payload.preferred_client_ids,
            excluded: &payload.exclude_client_ids,
            permanently_failed: &permanently_failed,
        };
        let compatible: Vec<String> = idle
            .iter()
            .filter(|client_id| shared.manager.can_run(client_id, &job))
            .cloned()
            .collect();
        if !compatible.is_empty() {
            candidates.push(Candidate {
                position,
                payload,
                compatible,
            });
        }
    }

    // Priority first; then rarer jobs before generalists so a scarce client
    // is not consumed by a job that could run anywhere; then queue order.
    candidates.sort_by(|a, b| {
        b.payload
            .priority
            .cmp(&a.payload.priority)
            .then(a.compatible.len().cmp(&b.compatible.len()))
            .then(a.position.cmp(&b.position))
    });

    let mut assigned = 0usize;
    let mut taken: HashSet<String> = HashSet::new();
    for candidate in candidates {
        let Some(client_id) = candidate
            .compatible
            .iter()
            .find(|client_id| !taken.contains(*client_id))
            .cloned()
        else {
            continue;
        };

        let Some(reservation) = shared
            .queue
            .reserve_by_id(candidate.payload.job_id)
            .await
        else {
            continue;
        };

        let permanently_failed = shared.permanent_failures(candidate.payload.job_id);
        let job = CompatJob {
            workflow_hash: &candidate.payload.workflow_hash,
            preferred: &candidate.payload.preferred_client_ids,
            excluded: &candidate.payload.exclude_client_ids,
            permanently_failed: &permanently_failed,
        };
        let Some(claim) = shared.manager.claim(&client_id, &job) else {
            // Lost the client to a race; the job goes straight back.
            shared
                .queue
                .retry(reservation, Duration::ZERO)
                .await
                .context("return reservation after lost claim")?;
            continue;
        };

        taken.insert(client_id);
        spawn_attempt(shared, reservation, claim);
        assigned += 1;
    }

    Ok(assigned)
}

fn spawn_attempt(shared: &Arc<PoolShared>, mut reservation: Reservation, claim: ClaimedClient) {
    let job_id = reservation.payload.job_id;
    let client_id = claim.client_id().to_string();

    let request = {
        let mut state = shared.state();
        match state.records.get_mut(&job_id) {
            Some(record) if record.status != JobStatus::Cancelled => {
                record.attempts += 1;
                record.status = JobStatus::Running;
                record.client_id = Some(client_id.clone());
                record.prompt_id = None;
                reservation.payload.attempts = record.attempts;
                let request = ExecutionRequest {
                    workflow: record.workflow.clone(),
                    output_map: record.output_map.clone(),
                    bypass_node_ids: record.options.bypass_node_ids.clone(),
                    attachments: record.options.attachments.clone(),
                    execution_start_timeout: record
                        .options
                        .execution_start_timeout
                        .unwrap_or(shared.options.execution_start_timeout),
                    node_execution_timeout: record
                        .options
                        .node_execution_timeout
                        .unwrap_or(shared.options.node_execution_timeout),
                    enable_profiling: shared.options.enable_profiling,
                };
                let cancel = shared.cancel.child_token();
                state.running.insert(
                    job_id,
                    RunningJob {
                        cancel: cancel.clone(),
                        client_id: client_id.clone(),
                    },
                );
                Some((request, cancel))
            }
            _ => None,
        }
    };

    let Some((request, cancel)) = request else {
        // The job vanished (cancelled) between reservation and assignment.
        let shared = Arc::clone(shared);
        tokio::spawn(async move {
            let error = ExecError::ExecutionInterrupted {
                reason: Some("cancelled before start".to_string()),
            };
            if let Err(err) = shared.queue.discard(reservation, &error).await {
                tracing::warn!(%job_id, error = %err, "discard of dead reservation failed");
            }
            claim.release(false);
        });
        return;
    };

    tracing::debug!(%job_id, %client_id, "attempt assigned");
    let shared = Arc::clone(shared);
    let mut tasks = shared.tasks.lock().expect("pool task lock poisoned");
    tasks.spawn({
        let shared = Arc::clone(&shared);
        async move {
            let observer = Arc::new(PoolObserver {
                shared: Arc::clone(&shared),
                job_id,
                client_id: client_id.clone(),
            });
            let execution =
                JobExecution::new(claim.session(), request, observer, cancel);
            let result = execution.run().await;
            handle_outcome(&shared, job_id, reservation, claim, result).await;
            shared.schedule.notify_one();
        }
    });
}

enum FailDecision {
    Retry {
        delay: Duration,
        failed: JobSnapshot,
        queued: JobSnapshot,
    },
    Fail {
        snapshot: JobSnapshot,
        final_error: ExecError,
    },
}

async fn handle_outcome(
    shared: &Arc<PoolShared>,
    job_id: Uuid,
    mut reservation: Reservation,
    claim: ClaimedClient,
    result: Result<JobOutputs, ExecError>,
) {
    let client_id = claim.client_id().to_string();
    let workflow_hash = reservation.payload.workflow_hash.clone();

    // Cancellation interlock: a record observed cancelled (or gone) drops
    // whatever the wrapper produced.
    let dropped = {
        let mut state = shared.state();
        state.running.remove(&job_id);
        let cancelled = matches!(
            state.records.get(&job_id),
            Some(record) if record.status == JobStatus::Cancelled
        );
        if cancelled {
            if let Some(mut record) = state.records.remove(&job_id) {
                record.completed_at = Some(Utc::now());
                let snapshot = record.snapshot();
                push_result(&mut state, snapshot, shared.options.result_store_max);
            }
            true
        } else {
            !state.records.contains_key(&job_id)
        }
    };
    if dropped {
        let error = ExecError::ExecutionInterrupted {
            reason: Some("cancelled".to_string()),
        };
        if let Err(err) = shared.queue.discard(reservation, &error).await {
            tracing::warn!(%job_id, error = %err, "discard after cancel failed");
        }
        claim.release(false);
        shared.push_snapshot().await;
        return;
    }

    match result {
        Ok(outputs) => {
            let snapshot = {
                let mut state = shared.state();
                state.records.remove(&job_id).map(|mut record| {
                    record.status = JobStatus::Completed;
                    record.completed_at = Some(Utc::now());
                    record.result = Some(outputs);
                    state.failure_memory.remove(&job_id);
                    let snapshot = record.snapshot();
                    push_result(&mut state, snapshot.clone(), shared.options.result_store_max);
                    snapshot
                })
            };
            if let Err(err) = shared.queue.commit(reservation).await {
                tracing::warn!(%job_id, error = %err, "commit failed");
            }
            claim.release(true);
            if let Some(snapshot) = snapshot {
                tracing::info!(%job_id, %client_id, "job completed");
                shared.sink.emit(PoolEvent::JobCompleted { job: snapshot });
            }
        }
        Err(error) => {
            let analysis = analyze(&error);
            tracing::warn!(
                %job_id,
                %client_id,
                code = error.code(),
                retryable = analysis.retryable,
                "attempt failed"
            );
            shared.manager.record_failure(&client_id, &workflow_hash, &error);
            claim.release(false);

            let client_ids = shared.manager.client_ids();
            let decision = {
                let mut state = shared.state();
                let reason = analysis
                    .reason
                    .clone()
                    .unwrap_or_else(|| error.to_string());
                state
                    .failure_memory
                    .entry(job_id)
                    .or_default()
                    .insert(
                        client_id.clone(),
                        FailureNote {
                            analysis: analysis.clone(),
                            reason,
                        },
                    );

                let Some(record) = state.records.get_mut(&job_id) else {
                    return;
                };
                record.last_error = Some(error.clone());
                if analysis.block_client == BlockClient::Permanent {
                    record.options.exclude_client_ids.insert(client_id.clone());
                    reservation
                        .payload
                        .exclude_client_ids
                        .insert(client_id.clone());
                }
                reservation.payload.attempts = record.attempts;

                let attempts = record.attempts;
                let max_attempts = record.options.max_attempts;
                let preferred = record.options.preferred_client_ids.clone();
                let excluded = record.options.exclude_client_ids.clone();

                let memory = state.failure_memory.get(&job_id);
                let has_retry_path = client_ids.iter().any(|candidate| {
                    !excluded.contains(candidate)
                        && (preferred.is_empty() || preferred.contains(candidate))
                        && memory
                            .and_then(|m| m.get(candidate))
                            .is_none_or(|note| {
                                note.analysis.block_client != BlockClient::Permanent
                            })
                });

                let will_retry =
                    analysis.retryable && attempts < max_attempts && has_retry_path;

                if will_retry {
                    let Some(record) = state.records.get_mut(&job_id) else {
                        return;
                    };
                    let delay = record
                        .options
                        .retry_delay
                        .unwrap_or(shared.options.retry_backoff);
                    let failed = record.snapshot();
                    record.client_id = None;
                    record.prompt_id = None;
                    record.started_at = None;
                    record.completed_at = None;
                    record.result = None;
                    record.status = JobStatus::Queued;
                    let queued = record.snapshot();
                    FailDecision::Retry {
                        delay,
                        failed,
                        queued,
                    }
                } else {
                    let final_error = if !has_retry_path
                        && analysis.failure_type == FailureType::ClientIncompatible
                    {
                        let reasons = state
                            .failure_memory
                            .get(&job_id)
                            .map(|memory| {
                                memory
                                    .iter()
                                    .map(|(cid, note)| (cid.clone(), note.reason.clone()))
                                    .collect()
                            })
                            .unwrap_or_default();
                        ExecError::WorkflowNotSupported {
                            workflow_hash: workflow_hash.clone(),
                            reasons,
                        }
                    } else {
                        error.clone()
                    };
                    let Some(mut record) = state.records.remove(&job_id) else {
                        return;
                    };
                    record.status = JobStatus::Failed;
                    record.completed_at = Some(Utc::now());
                    record.last_error = Some(final_error.clone());
                    state.failure_memory.remove(&job_id);
                    let snapshot = record.snapshot();
                    push_result(&mut state, snapshot.clone(), shared.options.result_store_max);
                    FailDecision::Fail {
                        snapshot,
                        final_error,
                    }
                }
            };

            match decision {
                FailDecision::Retry {
                    delay,
                    failed,
                    queued,
                } => {
                    shared.sink.emit(PoolEvent::JobFailed {
                        job: failed.clone(),
                        will_retry: true,
                    });
                    shared.sink.emit(PoolEvent::JobRetrying { job: failed, delay });
                    if let Err(err) = shared.queue.retry(reservation, delay).await {
                        tracing::error!(%job_id, error = %err, "retry park failed");
                        shared.sink.emit(PoolEvent::PoolError {
                            message: format!("retry park failed for {job_id}: {err}"),
                        });
                    }
                    shared.sink.emit(PoolEvent::JobQueued { job: queued });
                    let shared = Arc::clone(shared);
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        shared.schedule.notify_one();
                    });
                }
                FailDecision::Fail {
                    snapshot,
                    final_error,
                } => {
                    if let Err(err) = shared.queue.discard(reservation, &final_error).await {
                        tracing::warn!(%job_id, error = %err, "discard failed");
                    }
                    shared.sink.emit(PoolEvent::JobFailed {
                        job: snapshot,
                        will_retry: false,
                    });
                }
            }
        }
    }

    shared.push_snapshot().await;
}

struct PoolObserver {
    shared: Arc<PoolShared>,
    job_id: Uuid,
    client_id: String,
}

impl ExecutionObserver for PoolObserver {
    fn on_pending(&self, prompt_id: &str) {
        let snapshot = {
            let mut state = self.shared.state();
            let Some(record) = state.records.get_mut(&self.job_id) else {
                return;
            };
            if record.status != JobStatus::Running {
                return;
            }
            record.prompt_id = Some(prompt_id.to_string());
            record.snapshot()
        };
        self.shared.sink.emit(PoolEvent::JobAccepted { job: snapshot });
    }

    fn on_start(&self, _prompt_id: &str) {
        let snapshot = {
            let mut state = self.shared.state();
            let Some(record) = state.records.get_mut(&self.job_id) else {
                return;
            };
            if record.status != JobStatus::Running {
                return;
            }
            record.started_at = Some(Utc::now());
            record.snapshot()
        };
        self.shared.sink.emit(PoolEvent::JobStarted { job: snapshot });
    }

    fn on_progress(&self, info: &ProgressInfo) {
        self.shared.sink.emit(PoolEvent::JobProgress {
            job_id: self.job_id,
            client_id: self.client_id.clone(),
            progress: info.clone(),
        });
    }

    fn on_preview(&self, frame: &PreviewFrame) {
        self.shared.sink.emit(PoolEvent::JobPreview {
            job_id: self.job_id,
            client_id: self.client_id.clone(),
            image: frame.clone(),
        });
    }

    fn on_preview_meta(&self, frame: &PreviewMetaFrame) {
        self.shared.sink.emit(PoolEvent::JobPreviewMeta {
            job_id: self.job_id,
            client_id: self.client_id.clone(),
            image: frame.clone(),
        });
    }

    fn on_output(&self, key: &str, data: &Value) {
        self.shared.sink.emit(PoolEvent::JobOutput {
            job_id: self.job_id,
            client_id: self.client_id.clone(),
            key: key.to_string(),
            data: data.clone(),
        });
    }
}
