//! Per-attempt execution wrapper.
//!
//! [`JobExecution`] drives one workflow attempt on one session: bypass
//! rewiring, attachment upload, submission, event correlation by prompt id,
//! output collection, timeouts, disconnect recovery via history replay, and
//! cancellation. Every failure is routed through the observer exactly once
//! and returned as `Err`; `run` never panics an attempt away.

use std::collections::{BTreeMap, BTreeSet};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::broadcast;
use tokio::time::{Instant, Sleep, sleep};
use tokio_util::sync::CancellationToken;

use promptfleet_client::{
    ClientSession, ExecError, HistoryEntry, NodeId, OutputMap, PreviewFrame, PreviewMetaFrame,
    ServerEvent, SessionEvent, TimeoutPhase, Workflow,
    protocol::{ExecutedEvent, ExecutionErrorEvent},
};

use crate::api::{Attachment, JobOutputs, ProgressInfo};

/// Grace window for a reconnect before the attempt fails as disconnected.
const DISCONNECT_GRACE: Duration = Duration::from_millis(5_000);
/// Wait for trailing `executed` frames after `execution_success`.
const SUCCESS_TRAILING_WAIT: Duration = Duration::from_millis(100);
/// History poll budget for success/cache fallbacks.
const HISTORY_POLL_ATTEMPTS: u32 = 3;
/// Delay between history polls.
const HISTORY_POLL_DELAY: Duration = Duration::from_millis(250);

/// Sink for attempt lifecycle callbacks.
///
/// All methods default to no-ops so implementors pick what they need.
pub trait ExecutionObserver: Send + Sync {
    /// The server accepted the prompt.
    fn on_pending(&self, _prompt_id: &str) {}
    /// Execution began (first `executing` event).
    fn on_start(&self, _prompt_id: &str) {}
    /// Node progress.
    fn on_progress(&self, _info: &ProgressInfo) {}
    /// A plain preview frame.
    fn on_preview(&self, _frame: &PreviewFrame) {}
    /// A metadata preview frame that passed the prompt-id filter.
    fn on_preview_meta(&self, _frame: &PreviewMetaFrame) {}
    /// One output landed, keyed by alias or node id.
    fn on_output(&self, _key: &str, _data: &Value) {}
    /// The attempt finished with mapped outputs.
    fn on_finished(&self, _outputs: &JobOutputs) {}
    /// The attempt failed.
    fn on_failed(&self, _error: &ExecError) {}
}

/// Observer that ignores everything.
pub struct NoopObserver;

impl ExecutionObserver for NoopObserver {}

/// Everything one attempt needs besides the session.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    /// Per-attempt workflow copy; mutated by seeds, rewiring, attachments.
    pub workflow: Workflow,
    /// Which nodes to collect and how to key them.
    pub output_map: OutputMap,
    /// Nodes to bypass-rewire out of the graph before submission.
    pub bypass_node_ids: Vec<NodeId>,
    /// Attachments to upload and wire in before submission.
    pub attachments: Vec<Attachment>,
    /// Bound between submission and the first sign of execution;
    /// `Duration::ZERO` disables.
    pub execution_start_timeout: Duration,
    /// Sliding per-node progress bound; `Duration::ZERO` disables.
    pub node_execution_timeout: Duration,
    /// Record per-node wall-clock timings.
    pub enable_profiling: bool,
}

/// One attempt of one job on one session.
pub struct JobExecution {
    session: Arc<ClientSession>,
    request: ExecutionRequest,
    observer: Arc<dyn ExecutionObserver>,
    cancel: CancellationToken,
}

fn cancelled_error() -> ExecError {
    ExecError::ExecutionInterrupted {
        reason: Some("cancelled".to_string()),
    }
}

struct Collected {
    map: OutputMap,
    required: BTreeSet<NodeId>,
    outputs: BTreeMap<NodeId, Value>,
    raw: BTreeMap<NodeId, Value>,
}

impl Collected {
    fn new(map: OutputMap) -> Self {
        let required = map.node_ids.iter().cloned().collect();
        Self {
            map,
            required,
            outputs: BTreeMap::new(),
            raw: BTreeMap::new(),
        }
    }

    fn record(&mut self, node: &str, value: Value) {
        if self.required.remove(node) || self.map.node_ids.iter().any(|n| n == node) {
            self.outputs.insert(node.to_string(), value);
        } else {
            self.raw.insert(node.to_string(), value);
        }
    }

    fn complete(&self) -> bool {
        self.required.is_empty()
    }

    fn any_defined(&self) -> bool {
        self.outputs.values().any(|v| !v.is_null())
    }

    fn missing(&self) -> Vec<NodeId> {
        self.required.iter().cloned().collect()
    }

    /// Fill still-missing required outputs from a history entry.
    fn adopt_history(&mut self, entry: &HistoryEntry) {
        let nodes: Vec<NodeId> = self.required.iter().cloned().collect();
        for node in nodes {
            if let Some(value) = entry.outputs.get(&node) {
                if !value.is_null() {
                    self.required.remove(&node);
                    self.outputs.insert(node, value.clone());
                }
            }
        }
    }

    fn into_outputs(
        self,
        prompt_id: String,
        auto_seeds: BTreeMap<NodeId, i64>,
        node_timings: Option<BTreeMap<NodeId, Duration>>,
    ) -> JobOutputs {
        let mut mapped = BTreeMap::new();
        for (node, value) in self.outputs {
            mapped.insert(self.map.key_for(&node).to_string(), value);
        }
        JobOutputs {
            mapped,
            raw: self.raw,
            nodes: self.map.node_ids,
            aliases: self.map.aliases,
            prompt_id,
            auto_seeds,
            node_timings,
        }
    }
}

#[derive(Default)]
struct Profiling {
    current: Option<(NodeId, Instant)>,
    timings: BTreeMap<NodeId, Duration>,
}

impl Profiling {
    fn enter(&mut self, node: &str) {
        let now = Instant::now();
        if let Some((prev, since)) = self.current.take() {
            *self.timings.entry(prev).or_default() += now - since;
        }
        self.current = Some((node.to_string(), now));
    }

    fn finish(mut self) -> BTreeMap<NodeId, Duration> {
        if let Some((prev, since)) = self.current.take() {
            *self.timings.entry(prev).or_default() += Instant::now() - since;
        }
        self.timings
    }
}

impl JobExecution {
    /// Build an attempt over `session`.
    pub fn new(
        session: Arc<ClientSession>,
        request: ExecutionRequest,
        observer: Arc<dyn ExecutionObserver>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            session,
            request,
            observer,
            cancel,
        }
    }

    /// Run the attempt to a terminal state.
    ///
    /// The terminal outcome is delivered exactly once: through
    /// [`ExecutionObserver::on_finished`] or [`ExecutionObserver::on_failed`],
    /// and as this method's return value.
    pub async fn run(self) -> Result<JobOutputs, ExecError> {
        let observer = Arc::clone(&self.observer);
        let result = self.execute().await;
        match &result {
            Ok(outputs) => observer.on_finished(outputs),
            Err(error) => observer.on_failed(error),
        }
        result
    }

    async fn guarded<T>(
        &self,
        fut: impl Future<Output = Result<T, ExecError>>,
    ) -> Result<T, ExecError> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(cancelled_error()),
            result = fut => result,
        }
    }

    async fn execute(mut self) -> Result<JobOutputs, ExecError> {
        // Subscribe before submission so no early event is missed.
        let mut events = self.session.subscribe();

        let auto_seeds = self.request.workflow.randomize_seeds();

        let bypass = std::mem::take(&mut self.request.bypass_node_ids);
        for node_id in &bypass {
            let rewire = rewire_bypassed(&self.session, &mut self.request.workflow, node_id);
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(cancelled_error()),
                result = rewire => result?,
            }
        }

        let attachments = std::mem::take(&mut self.request.attachments);
        for attachment in attachments {
            let uploaded = self
                .guarded(self.session.upload_image(&attachment.filename, attachment.bytes))
                .await?;
            let wired = self.request.workflow.set_input(
                &attachment.node_id,
                &attachment.input_name,
                Value::from(uploaded.workflow_path()),
            );
            if !wired {
                return Err(ExecError::MissingNode {
                    node_id: attachment.node_id,
                    class_type: None,
                });
            }
        }

        let accepted = self
            .guarded(self.session.submit_prompt(&self.request.workflow))
            .await?;
        let prompt_id = accepted.prompt_id;
        tracing::debug!(%prompt_id, "prompt accepted");
        self.observer.on_pending(&prompt_id);

        self.stream(&mut events, prompt_id, auto_seeds).await
    }

    async fn stream(
        &self,
        events: &mut broadcast::Receiver<SessionEvent>,
        prompt_id: String,
        auto_seeds: BTreeMap<NodeId, i64>,
    ) -> Result<JobOutputs, ExecError> {
        let mut collected = Collected::new(self.request.output_map.clone());
        let mut profiling = self
            .request
            .enable_profiling
            .then(Profiling::default);

        let start_timeout = self.request.execution_start_timeout;
        let node_timeout = self.request.node_execution_timeout;
        let mut start_deadline: Option<Pin<Box<Sleep>>> =
            (!start_timeout.is_zero()).then(|| Box::pin(sleep(start_timeout)));
        let mut node_deadline: Option<Pin<Box<Sleep>>> = None;
        let mut grace: Option<Pin<Box<Sleep>>> = None;

        let mut started = false;
        let mut start_emitted = false;
        let mut disconnected = false;

        macro_rules! finish {
            () => {
                return Ok(collected.into_outputs(
                    prompt_id,
                    auto_seeds,
                    profiling.map(Profiling::finish),
                ))
            };
        }

        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => return Err(cancelled_error()),
                _ = async {
                    match start_deadline.as_mut() {
                        Some(timer) => timer.as_mut().await,
                        None => std::future::pending().await,
                    }
                } => {
                    return Err(ExecError::ExecutionTimeout {
                        phase: TimeoutPhase::Start,
                        timeout_ms: start_timeout.as_millis() as u64,
                    });
                }
                _ = async {
                    match node_deadline.as_mut() {
                        Some(timer) => timer.as_mut().await,
                        None => std::future::pending().await,
                    }
                } => {
                    return Err(ExecError::ExecutionTimeout {
                        phase: TimeoutPhase::Node,
                        timeout_ms: node_timeout.as_millis() as u64,
                    });
                }
                _ = async {
                    match grace.as_mut() {
                        Some(timer) => timer.as_mut().await,
                        None => std::future::pending().await,
                    }
                } => {
                    return Err(ExecError::Disconnected {
                        prompt_id: Some(prompt_id),
                    });
                }
                event = events.recv() => event,
            };

            let event = match event {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(%prompt_id, skipped, "attempt lagged behind session events");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(ExecError::Disconnected {
                        prompt_id: Some(prompt_id),
                    });
                }
            };

            match event {
                SessionEvent::Server(server_event) => {
                    if server_event
                        .prompt_id()
                        .is_some_and(|pid| pid != prompt_id)
                    {
                        continue;
                    }
                    match server_event {
                        ServerEvent::Status(_) => {
                            if started || disconnected {
                                continue;
                            }
                            let queue = match self.session.get_queue().await {
                                Ok(queue) => queue,
                                Err(err) => {
                                    tracing::warn!(%prompt_id, error = %err, "queue check failed");
                                    continue;
                                }
                            };
                            if queue.contains(&prompt_id) {
                                continue;
                            }
                            // Not pending, not running: finished already, or lost.
                            match self.session.history(&prompt_id).await {
                                Ok(Some(entry)) if entry.is_completed_with_outputs() => {
                                    collected.adopt_history(&entry);
                                    if collected.any_defined() {
                                        finish!();
                                    }
                                    return Err(ExecError::WentMissing { prompt_id });
                                }
                                _ => return Err(ExecError::WentMissing { prompt_id }),
                            }
                        }
                        ServerEvent::ExecutionStart(_) => {
                            started = true;
                            start_deadline = None;
                            if !node_timeout.is_zero() {
                                node_deadline = Some(Box::pin(sleep(node_timeout)));
                            }
                        }
                        ServerEvent::ExecutionCached(cached) => {
                            let fully_cached = collected
                                .required
                                .iter()
                                .all(|node| cached.nodes.contains(node));
                            if !fully_cached {
                                continue;
                            }
                            self.cached_fallback(&mut collected, &prompt_id).await?;
                            finish!();
                        }
                        ServerEvent::Executing(executing) => {
                            let Some(node) = executing.node else {
                                continue;
                            };
                            started = true;
                            start_deadline = None;
                            if !node_timeout.is_zero() {
                                node_deadline = Some(Box::pin(sleep(node_timeout)));
                            }
                            if !start_emitted {
                                start_emitted = true;
                                self.observer.on_start(&prompt_id);
                            }
                            if let Some(profiling) = profiling.as_mut() {
                                profiling.enter(&node);
                            }
                        }
                        ServerEvent::Progress(progress) => {
                            started = true;
                            start_deadline = None;
                            if !node_timeout.is_zero() {
                                node_deadline = Some(Box::pin(sleep(node_timeout)));
                            }
                            self.observer.on_progress(&ProgressInfo {
                                value: progress.value,
                                max: progress.max,
                                node: progress.node,
                            });
                        }
                        ServerEvent::Executed(executed) => {
                            self.record_executed(&mut collected, executed);
                            if collected.complete() {
                                finish!();
                            }
                        }
                        ServerEvent::ExecutionSuccess(_) => {
                            if !collected.complete() {
                                self.success_fallback(events, &mut collected, &prompt_id)
                                    .await?;
                            }
                            finish!();
                        }
                        ServerEvent::ExecutionError(error) => {
                            return Err(custom_event_error(error));
                        }
                        ServerEvent::ExecutionInterrupted(_) => {
                            return Err(ExecError::ExecutionInterrupted { reason: None });
                        }
                    }
                }
                SessionEvent::Preview(frame) => {
                    start_deadline = None;
                    self.observer.on_preview(&frame);
                }
                SessionEvent::PreviewMeta(frame) => {
                    if frame.prompt_id().is_some_and(|pid| pid != prompt_id) {
                        continue;
                    }
                    start_deadline = None;
                    self.observer.on_preview_meta(&frame);
                }
                SessionEvent::Connected => {}
                SessionEvent::Reconnected => {
                    if !disconnected {
                        continue;
                    }
                    disconnected = false;
                    grace = None;
                    if let Ok(Some(entry)) = self.session.history(&prompt_id).await {
                        if entry.is_completed_with_outputs() {
                            collected.adopt_history(&entry);
                            if collected.any_defined() {
                                finish!();
                            }
                        }
                    }
                    // Re-arm whichever timer the outage paused.
                    if started {
                        if !node_timeout.is_zero() {
                            node_deadline = Some(Box::pin(sleep(node_timeout)));
                        }
                    } else if !start_timeout.is_zero() {
                        start_deadline = Some(Box::pin(sleep(start_timeout)));
                    }
                }
                SessionEvent::Disconnected => {
                    if disconnected {
                        continue;
                    }
                    disconnected = true;
                    // Timers pause for the outage; the grace timer takes over.
                    start_deadline = None;
                    node_deadline = None;
                    grace = Some(Box::pin(sleep(DISCONNECT_GRACE)));
                    tracing::warn!(%prompt_id, "session dropped mid-attempt, probing history");
                    if let Ok(Some(entry)) = self.session.history(&prompt_id).await {
                        if entry.is_completed_with_outputs() {
                            collected.adopt_history(&entry);
                            if collected.any_defined() {
                                finish!();
                            }
                        }
                    }
                }
                SessionEvent::ReconnectionFailed => {
                    return Err(ExecError::Disconnected {
                        prompt_id: Some(prompt_id),
                    });
                }
            }
        }
    }

    fn record_executed(&self, collected: &mut Collected, executed: ExecutedEvent) {
        let key = collected.map.key_for(&executed.node).to_string();
        self.observer.on_output(&key, &executed.output);
        collected.record(&executed.node, executed.output);
    }

    /// `execution_success` arrived with required outputs still missing: give
    /// trailing `executed` frames a moment, then replay history a bounded
    /// number of times.
    async fn success_fallback(
        &self,
        events: &mut broadcast::Receiver<SessionEvent>,
        collected: &mut Collected,
        prompt_id: &str,
    ) -> Result<(), ExecError> {
        tokio::time::sleep(SUCCESS_TRAILING_WAIT).await;
        while let Ok(event) = events.try_recv() {
            if let SessionEvent::Server(ServerEvent::Executed(executed)) = event {
                if executed.prompt_id == prompt_id {
                    self.record_executed(collected, executed);
                }
            }
        }
        if collected.complete() {
            return Ok(());
        }

        for attempt in 0..HISTORY_POLL_ATTEMPTS {
            if self.cancel.is_cancelled() {
                return Err(cancelled_error());
            }
            if attempt > 0 {
                tokio::time::sleep(HISTORY_POLL_DELAY).await;
            }
            match self.session.history(prompt_id).await {
                Ok(Some(entry)) => {
                    collected.adopt_history(&entry);
                    if collected.complete() {
                        return Ok(());
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(%prompt_id, error = %err, "history fallback failed");
                }
            }
        }
        Err(ExecError::ExecutionFailed {
            missing: collected.missing(),
        })
    }

    /// Every required node was served from cache; the server will not emit
    /// `executed` frames for them, so history is the only source.
    async fn cached_fallback(
        &self,
        collected: &mut Collected,
        prompt_id: &str,
    ) -> Result<(), ExecError> {
        for attempt in 0..HISTORY_POLL_ATTEMPTS {
            if self.cancel.is_cancelled() {
                return Err(cancelled_error());
            }
            if attempt > 0 {
                tokio::time::sleep(HISTORY_POLL_DELAY).await;
            }
            match self.session.history(prompt_id).await {
                Ok(Some(entry)) => {
                    collected.adopt_history(&entry);
                    if collected.complete() {
                        return Ok(());
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(%prompt_id, error = %err, "cached history fetch failed");
                }
            }
        }
        if collected.any_defined() {
            return Ok(());
        }
        Err(ExecError::FailedCache {
            prompt_id: prompt_id.to_string(),
        })
    }
}

fn custom_event_error(event: ExecutionErrorEvent) -> ExecError {
    ExecError::CustomEvent {
        node_id: event.node_id,
        node_type: event.node_type,
        exception_type: event.exception_type,
        exception_message: event
            .exception_message
            .unwrap_or_else(|| "execution error".to_string()),
        traceback: event.traceback,
    }
}

fn input_is_link(value: &Value) -> bool {
    value
        .as_array()
        .is_some_and(|arr| arr.len() == 2 && arr[0].is_string() && arr[1].is_u64())
}

/// Rewire one bypassed node out of the graph.
///
/// Each output slot of the bypassed node is mapped to the upstream wire that
/// fed its first same-typed input; downstream references to the slot are
/// replaced by that wire, or removed when no input matches. Finally the node
/// itself is deleted. A missing node or class definition aborts the attempt.
async fn rewire_bypassed(
    session: &Arc<ClientSession>,
    workflow: &mut Workflow,
    node_id: &str,
) -> Result<(), ExecError> {
    let node = workflow
        .node(node_id)
        .cloned()
        .ok_or_else(|| ExecError::MissingNode {
            node_id: node_id.to_string(),
            class_type: None,
        })?;
    let class_type = node
        .get("class_type")
        .and_then(Value::as_str)
        .ok_or_else(|| ExecError::MissingNode {
            node_id: node_id.to_string(),
            class_type: None,
        })?
        .to_string();

    let info = session
        .object_info(&class_type)
        .await?
        .ok_or_else(|| ExecError::MissingNode {
            node_id: node_id.to_string(),
            class_type: Some(class_type.clone()),
        })?;

    let empty = serde_json::Map::new();
    let inputs = node
        .get("inputs")
        .and_then(Value::as_object)
        .unwrap_or(&empty);

    // Output slot -> upstream wire feeding the first input of the same type.
    let slot_sources: Vec<Option<Value>> = info
        .output
        .iter()
        .map(|slot_type| {
            info.link_inputs()
                .filter(|&(_, input_type)| input_type == slot_type.as_str())
                .find_map(|(input_name, _)| {
                    inputs
                        .get(input_name)
                        .filter(|value| input_is_link(value))
                        .cloned()
                })
        })
        .collect();

    let mut removed_refs = 0usize;
    for (other_id, other) in workflow.nodes_mut().iter_mut() {
        if other_id.as_str() == node_id {
            continue;
        }
        let Some(other_inputs) = other.get_mut("inputs").and_then(Value::as_object_mut) else {
            continue;
        };
        let referencing: Vec<String> = other_inputs
            .iter()
            .filter(|(_, value)| {
                input_is_link(value) && value[0].as_str() == Some(node_id)
            })
            .map(|(name, _)| name.clone())
            .collect();
        for input_name in referencing {
            let slot = other_inputs[&input_name][1].as_u64().unwrap_or(0) as usize;
            match slot_sources.get(slot).cloned().flatten() {
                Some(wire) => {
                    other_inputs.insert(input_name, wire);
                }
                None => {
                    other_inputs.remove(&input_name);
                    removed_refs += 1;
                }
            }
        }
    }
    if removed_refs > 0 {
        tracing::debug!(node_id, removed_refs, "bypass dropped unmatched references");
    }

    workflow.remove_node(node_id);
    Ok(())
}
