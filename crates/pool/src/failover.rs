//! Per-(client, workflow) failover policy.
//!
//! The strategy answers "skip this client for this workflow right now?" from
//! local failure history. It never makes global decisions; permanent
//! exclusions are the analyzer's business, recorded on the job itself.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

/// Policy deciding whether a client should sit out a workflow.
pub trait FailoverStrategy: Send + Sync {
    /// Whether `client_id` should be skipped for `workflow_hash` right now.
    fn should_skip(&self, client_id: &str, workflow_hash: &str) -> bool;

    /// Record a failed attempt. Returns `true` when this failure newly put
    /// the pair on cooldown (an edge transition worth announcing).
    fn record_failure(&self, client_id: &str, workflow_hash: &str) -> bool;

    /// Record a successful attempt. Returns `true` when the pair had been on
    /// cooldown and is now clear.
    fn record_success(&self, client_id: &str, workflow_hash: &str) -> bool;

    /// Whether the pair is currently on cooldown.
    fn is_workflow_blocked(&self, client_id: &str, workflow_hash: &str) -> bool;
}

#[derive(Debug, Default)]
struct FailureWindow {
    consecutive: u32,
    blocks: u32,
    blocked_until: Option<Instant>,
}

/// Default strategy: consecutive-failure counting with exponential cooldown.
///
/// After `threshold` consecutive failures of the same workflow on the same
/// client, the pair is blocked for `base_cooldown * 2^(blocks-1)`, capped at
/// `max_cooldown`. Any success clears the pair entirely.
#[derive(Debug)]
pub struct CooldownStrategy {
    threshold: u32,
    base_cooldown: Duration,
    max_cooldown: Duration,
    state: Mutex<HashMap<(String, String), FailureWindow>>,
}

impl CooldownStrategy {
    /// Default consecutive-failure threshold.
    pub const DEFAULT_THRESHOLD: u32 = 3;
    /// Default first cooldown.
    pub const DEFAULT_BASE_COOLDOWN: Duration = Duration::from_secs(30);
    /// Default cooldown cap.
    pub const DEFAULT_MAX_COOLDOWN: Duration = Duration::from_secs(600);

    /// Strategy with explicit tuning.
    pub fn new(threshold: u32, base_cooldown: Duration, max_cooldown: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            base_cooldown,
            max_cooldown,
            state: Mutex::new(HashMap::new()),
        }
    }

    fn cooldown_for(&self, blocks: u32) -> Duration {
        let factor = 1u32 << blocks.saturating_sub(1).min(16);
        self.base_cooldown
            .saturating_mul(factor)
            .min(self.max_cooldown)
    }
}

impl Default for CooldownStrategy {
    fn default() -> Self {
        Self::new(
            Self::DEFAULT_THRESHOLD,
            Self::DEFAULT_BASE_COOLDOWN,
            Self::DEFAULT_MAX_COOLDOWN,
        )
    }
}

impl FailoverStrategy for CooldownStrategy {
    fn should_skip(&self, client_id: &str, workflow_hash: &str) -> bool {
        self.is_workflow_blocked(client_id, workflow_hash)
    }

    fn record_failure(&self, client_id: &str, workflow_hash: &str) -> bool {
        let mut state = self.state.lock().expect("failover lock poisoned");
        let window = state
            .entry((client_id.to_string(), workflow_hash.to_string()))
            .or_default();

        let was_blocked = window
            .blocked_until
            .is_some_and(|until| Instant::now() < until);

        window.consecutive += 1;
        if window.consecutive >= self.threshold {
            window.consecutive = 0;
            window.blocks += 1;
            let cooldown = self.cooldown_for(window.blocks);
            window.blocked_until = Some(Instant::now() + cooldown);
            tracing::debug!(
                client_id,
                workflow_hash,
                cooldown_ms = cooldown.as_millis() as u64,
                "workflow cooldown engaged"
            );
            return !was_blocked;
        }
        false
    }

    fn record_success(&self, client_id: &str, workflow_hash: &str) -> bool {
        let mut state = self.state.lock().expect("failover lock poisoned");
        let Some(window) = state.remove(&(client_id.to_string(), workflow_hash.to_string()))
        else {
            return false;
        };
        window
            .blocked_until
            .is_some_and(|until| Instant::now() < until)
    }

    fn is_workflow_blocked(&self, client_id: &str, workflow_hash: &str) -> bool {
        let state = self.state.lock().expect("failover lock poisoned");
        state
            .get(&(client_id.to_string(), workflow_hash.to_string()))
            .and_then(|window| window.blocked_until)
            .is_some_and(|until| Instant::now() < until)
    }
}
