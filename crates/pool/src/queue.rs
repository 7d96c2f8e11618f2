//! Priority FIFO with reservation semantics.
//!
//! The scheduler never pops blindly: it peeks a window, picks jobs by
//! priority and selectivity, then leases them by id. A lease is resolved by
//! exactly one of [`QueueAdapter::commit`], [`QueueAdapter::retry`], or
//! [`QueueAdapter::discard`]; passing the [`Reservation`] by value makes the
//! exactly-once rule a move-semantics fact rather than a convention.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::Instant;
use uuid::Uuid;

use promptfleet_client::ExecError;

/// Flattened subset of a job record the queue holds.
#[derive(Debug, Clone)]
pub struct QueuePayload {
    /// The pool-assigned job id.
    pub job_id: Uuid,
    /// Structural hash of the job's workflow.
    pub workflow_hash: String,
    /// Higher runs first.
    pub priority: i32,
    /// Attempts started so far; updated across retries.
    pub attempts: u32,
    /// Attempt budget.
    pub max_attempts: u32,
    /// Only these clients may run the job; empty means any.
    pub preferred_client_ids: BTreeSet<String>,
    /// These clients never run the job; widened by permanent failures.
    pub exclude_client_ids: BTreeSet<String>,
}

/// A lease over one queued payload.
#[derive(Debug)]
pub struct Reservation {
    /// Monotonic lease id.
    pub id: u64,
    /// The leased payload; mutations travel back on retry.
    pub payload: QueuePayload,
}

/// Adapter counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Payloads waiting (including delayed retries).
    pub waiting: usize,
    /// Active leases.
    pub leased: usize,
    /// Committed payloads since start.
    pub completed: u64,
    /// Discarded payloads since start.
    pub failed: u64,
}

/// Queue adapter failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueueError {
    /// The configured capacity bound is exhausted.
    #[error("queue is full")]
    Full,
    /// The reservation is unknown (already resolved, or from another queue).
    #[error("unknown reservation {0}")]
    UnknownReservation(u64),
    /// The adapter was closed.
    #[error("queue is closed")]
    Closed,
}

/// Pluggable job queue.
///
/// Implementations must keep a `job_id` in at most one of {waiting, leased}
/// and must tolerate interleaved calls from the scheduler and from
/// outcome handlers.
#[async_trait]
pub trait QueueAdapter: Send + Sync {
    /// Add a payload to the waiting set.
    async fn enqueue(&self, payload: QueuePayload) -> Result<(), QueueError>;

    /// Up to `n` waiting payloads in scheduling order, without leasing them.
    async fn peek(&self, n: usize) -> Vec<QueuePayload>;

    /// Lease a waiting payload by id. `None` when it is not waiting.
    async fn reserve_by_id(&self, job_id: Uuid) -> Option<Reservation>;

    /// Resolve a lease as succeeded.
    async fn commit(&self, reservation: Reservation) -> Result<(), QueueError>;

    /// Return a leased payload to the waiting set after `delay`.
    ///
    /// Until the delay elapses the payload is invisible to [`peek`] and
    /// [`reserve_by_id`].
    ///
    /// [`peek`]: QueueAdapter::peek
    /// [`reserve_by_id`]: QueueAdapter::reserve_by_id
    async fn retry(&self, reservation: Reservation, delay: Duration) -> Result<(), QueueError>;

    /// Resolve a lease as terminally failed.
    async fn discard(&self, reservation: Reservation, error: &ExecError) -> Result<(), QueueError>;

    /// Remove a waiting (not leased) payload. Returns whether it was removed.
    async fn remove(&self, job_id: Uuid) -> bool;

    /// Adapter counters.
    async fn stats(&self) -> QueueStats;

    /// Stop accepting payloads.
    async fn close(&self);
}

#[derive(Debug)]
struct WaitingEntry {
    seq: u64,
    payload: QueuePayload,
}

#[derive(Debug)]
struct DelayedEntry {
    ready_at: Instant,
    payload: QueuePayload,
}

#[derive(Debug, Default)]
struct MemoryQueueState {
    next_seq: u64,
    next_reservation: u64,
    waiting: Vec<WaitingEntry>,
    delayed: Vec<DelayedEntry>,
    leased: HashMap<u64, Uuid>,
    completed: u64,
    failed: u64,
    closed: bool,
}

impl MemoryQueueState {
    fn promote_ready(&mut self) {
        let now = Instant::now();
        let mut i = 0;
        while i < self.delayed.len() {
            if self.delayed[i].ready_at <= now {
                let entry = self.delayed.swap_remove(i);
                self.push_waiting(entry.payload);
            } else {
                i += 1;
            }
        }
    }

    fn push_waiting(&mut self, payload: QueuePayload) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.waiting.push(WaitingEntry { seq, payload });
        // Higher priority first, enqueue order within a priority band.
        self.waiting
            .sort_by(|a, b| b.payload.priority.cmp(&a.payload.priority).then(a.seq.cmp(&b.seq)));
    }
}

/// Default in-memory queue adapter.
#[derive(Debug)]
pub struct MemoryQueue {
    state: tokio::sync::Mutex<MemoryQueueState>,
    capacity: Option<usize>,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::unbounded()
    }
}

impl MemoryQueue {
    /// A queue with no capacity bound.
    pub fn unbounded() -> Self {
        Self {
            state: tokio::sync::Mutex::new(MemoryQueueState::default()),
            capacity: None,
        }
    }

    /// A queue rejecting enqueues beyond `capacity` un-resolved payloads.
    pub fn bounded(capacity: usize) -> Self {
        Self {
            state: tokio::sync::Mutex::new(MemoryQueueState::default()),
            capacity: Some(capacity),
        }
    }
}

#[async_trait]
impl QueueAdapter for MemoryQueue {
    async fn enqueue(&self, payload: QueuePayload) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(QueueError::Closed);
        }
        if let Some(capacity) = self.capacity {
            let in_flight = state.waiting.len() + state.delayed.len() + state.leased.len();
            if in_flight >= capacity {
                return Err(QueueError::Full);
            }
        }
        state.push_waiting(payload);
        Ok(())
    }

    async fn peek(&self, n: usize) -> Vec<QueuePayload> {
        let mut state = self.state.lock().await;
        state.promote_ready();
        state
            .waiting
            .iter()
            .take(n)
            .map(|entry| entry.payload.clone())
            .collect()
    }

    async fn reserve_by_id(&self, job_id: Uuid) -> Option<Reservation> {
        let mut state = self.state.lock().await;
        state.promote_ready();
        let index = state
            .waiting
            .iter()
            .position(|entry| entry.payload.job_id == job_id)?;
        let entry = state.waiting.remove(index);
        state.next_reservation += 1;
        let id = state.next_reservation;
        state.leased.insert(id, job_id);
        Some(Reservation {
            id,
            payload: entry.payload,
        })
    }

    async fn commit(&self, reservation: Reservation) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        state
            .leased
            .remove(&reservation.id)
            .ok_or(QueueError::UnknownReservation(reservation.id))?;
        state.completed += 1;
        Ok(())
    }

    async fn retry(&self, reservation: Reservation, delay: Duration) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        state
            .leased
            .remove(&reservation.id)
            .ok_or(QueueError::UnknownReservation(reservation.id))?;
        if delay.is_zero() {
            state.push_waiting(reservation.payload);
        } else {
            state.delayed.push(DelayedEntry {
                ready_at: Instant::now() + delay,
                payload: reservation.payload,
            });
        }
        Ok(())
    }

    async fn discard(&self, reservation: Reservation, error: &ExecError) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        state
            .leased
            .remove(&reservation.id)
            .ok_or(QueueError::UnknownReservation(reservation.id))?;
        state.failed += 1;
        tracing::debug!(
            job_id = %reservation.payload.job_id,
            code = error.code(),
            "discarded queued job"
        );
        Ok(())
    }

    async fn remove(&self, job_id: Uuid) -> bool {
        let mut state = self.state.lock().await;
        let waiting_len = state.waiting.len();
        state.waiting.retain(|entry| entry.payload.job_id != job_id);
        if state.waiting.len() != waiting_len {
            return true;
        }
        let delayed_len = state.delayed.len();
        state.delayed.retain(|entry| entry.payload.job_id != job_id);
        state.delayed.len() != delayed_len
    }

    async fn stats(&self) -> QueueStats {
        let state = self.state.lock().await;
        QueueStats {
            waiting: state.waiting.len() + state.delayed.len(),
            leased: state.leased.len(),
            completed: state.completed,
            failed: state.failed,
        }
    }

    async fn close(&self) {
        self.state.lock().await.closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(priority: i32) -> QueuePayload {
        QueuePayload {
            job_id: Uuid::new_v4(),
            workflow_hash: "hash".into(),
            priority,
            attempts: 0,
            max_attempts: 3,
            preferred_client_ids: BTreeSet::new(),
            exclude_client_ids: BTreeSet::new(),
        }
    }

    #[tokio::test]
    async fn orders_by_priority_then_fifo() {
        let queue = MemoryQueue::unbounded();
        let low = payload(1);
        let high = payload(10);
        let mid_a = payload(5);
        let mid_b = payload(5);

        for p in [&low, &high, &mid_a, &mid_b] {
            queue.enqueue(p.clone()).await.unwrap();
        }

        let order: Vec<Uuid> = queue.peek(10).await.iter().map(|p| p.job_id).collect();
        assert_eq!(order, vec![high.job_id, mid_a.job_id, mid_b.job_id, low.job_id]);
    }

    #[tokio::test]
    async fn reserve_commit_discard_lifecycle() {
        let queue = MemoryQueue::unbounded();
        let a = payload(0);
        let b = payload(0);
        queue.enqueue(a.clone()).await.unwrap();
        queue.enqueue(b.clone()).await.unwrap();

        let lease_a = queue.reserve_by_id(a.job_id).await.unwrap();
        // A leased job is gone from the waiting set.
        assert!(queue.reserve_by_id(a.job_id).await.is_none());
        assert!(queue.peek(10).await.iter().all(|p| p.job_id != a.job_id));

        queue.commit(lease_a).await.unwrap();

        let lease_b = queue.reserve_by_id(b.job_id).await.unwrap();
        let err = ExecError::WentMissing {
            prompt_id: "p".into(),
        };
        queue.discard(lease_b, &err).await.unwrap();

        let stats = queue.stats().await;
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.waiting, 0);
        assert_eq!(stats.leased, 0);
    }

    #[tokio::test]
    async fn stale_reservation_is_rejected() {
        let queue = MemoryQueue::unbounded();
        let a = payload(0);
        queue.enqueue(a.clone()).await.unwrap();
        let lease = queue.reserve_by_id(a.job_id).await.unwrap();
        let stale_id = lease.id;
        queue.commit(lease).await.unwrap();

        let fake = Reservation {
            id: stale_id,
            payload: a,
        };
        assert_eq!(
            queue.retry(fake, Duration::ZERO).await,
            Err(QueueError::UnknownReservation(stale_id))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn retried_payload_is_invisible_until_delay_elapses() {
        let queue = MemoryQueue::unbounded();
        let a = payload(0);
        queue.enqueue(a.clone()).await.unwrap();

        let mut lease = queue.reserve_by_id(a.job_id).await.unwrap();
        lease.payload.attempts += 1;
        lease
            .payload
            .exclude_client_ids
            .insert("c-bad".to_string());
        queue.retry(lease, Duration::from_millis(500)).await.unwrap();

        assert!(queue.peek(10).await.is_empty());
        assert!(queue.reserve_by_id(a.job_id).await.is_none());
        // Parked payloads still count as waiting.
        assert_eq!(queue.stats().await.waiting, 1);

        tokio::time::advance(Duration::from_millis(501)).await;

        let visible = queue.peek(10).await;
        assert_eq!(visible.len(), 1);
        // Identity and mutations survive the park.
        assert_eq!(visible[0].job_id, a.job_id);
        assert_eq!(visible[0].attempts, 1);
        assert!(visible[0].exclude_client_ids.contains("c-bad"));
    }

    #[tokio::test]
    async fn remove_only_touches_waiting_jobs() {
        let queue = MemoryQueue::unbounded();
        let a = payload(0);
        let b = payload(0);
        queue.enqueue(a.clone()).await.unwrap();
        queue.enqueue(b.clone()).await.unwrap();

        let lease = queue.reserve_by_id(a.job_id).await.unwrap();
        assert!(!queue.remove(a.job_id).await);
        assert!(queue.remove(b.job_id).await);
        assert!(!queue.remove(b.job_id).await);
        queue.commit(lease).await.unwrap();
    }

    #[tokio::test]
    async fn bounded_queue_rejects_overflow() {
        let queue = MemoryQueue::bounded(1);
        queue.enqueue(payload(0)).await.unwrap();
        assert_eq!(queue.enqueue(payload(0)).await, Err(QueueError::Full));
    }

    #[tokio::test]
    async fn closed_queue_rejects_enqueue() {
        let queue = MemoryQueue::unbounded();
        queue.close().await;
        assert_eq!(queue.enqueue(payload(0)).await, Err(QueueError::Closed));
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;
        use proptest::test_runner::TestCaseError;

        proptest! {
            // Priority monotonicity: for any priority mix, the scheduling
            // order is the (priority desc, enqueue order asc) sort.
            #[test]
            fn peek_order_is_priority_then_enqueue_order(
                priorities in proptest::collection::vec(-20i32..=20, 1..40),
            ) {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_time()
                    .build()
                    .expect("build test runtime");
                runtime.block_on(async {
                    let queue = MemoryQueue::unbounded();
                    let mut expected: Vec<(i32, usize, Uuid)> = Vec::new();
                    for (position, priority) in priorities.iter().copied().enumerate() {
                        let entry = payload(priority);
                        expected.push((priority, position, entry.job_id));
                        queue.enqueue(entry).await.expect("enqueue");
                    }
                    expected.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

                    let order: Vec<Uuid> = queue
                        .peek(priorities.len())
                        .await
                        .iter()
                        .map(|p| p.job_id)
                        .collect();
                    let want: Vec<Uuid> = expected.iter().map(|e| e.2).collect();
                    prop_assert_eq!(order, want);
                    Ok::<(), TestCaseError>(())
                })?;
            }
        }
    }
}
