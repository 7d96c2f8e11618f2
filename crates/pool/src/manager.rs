//! Managed client set: liveness, busy bookkeeping, claims, health checks.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use promptfleet_client::{ClientSession, ConnectionState, ExecError, SessionEvent};

use crate::api::{ClientSnapshot, PoolClientConfig, PoolEvent};
use crate::failover::FailoverStrategy;
use crate::sink::EventSink;

/// How long initialization waits for sessions to settle.
const READY_TIMEOUT: Duration = Duration::from_secs(20);

struct ClientEntry {
    session: Arc<ClientSession>,
    online: bool,
    busy: bool,
    last_error: Option<String>,
    last_seen_at: Option<DateTime<Utc>>,
}

/// Compatibility inputs for one (job, client) check.
pub(crate) struct CompatJob<'a> {
    pub(crate) workflow_hash: &'a str,
    pub(crate) preferred: &'a std::collections::BTreeSet<String>,
    pub(crate) excluded: &'a std::collections::BTreeSet<String>,
    pub(crate) permanently_failed: &'a std::collections::BTreeSet<String>,
}

/// Owns the pool's client sessions and their online/busy state.
pub(crate) struct ClientManager {
    clients: std::sync::Mutex<HashMap<String, ClientEntry>>,
    strategy: Arc<dyn FailoverStrategy>,
    sink: Arc<EventSink>,
    cancel: CancellationToken,
}

impl ClientManager {
    pub(crate) fn new(
        strategy: Arc<dyn FailoverStrategy>,
        sink: Arc<EventSink>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            clients: std::sync::Mutex::new(HashMap::new()),
            strategy,
            sink,
            cancel,
        })
    }

    /// Build and connect every session; emits `pool:ready` once the set has
    /// settled (each session connected, or gave up trying).
    pub(crate) async fn initialize(
        self: &Arc<Self>,
        configs: Vec<PoolClientConfig>,
    ) -> Result<Vec<String>, ExecError> {
        let mut watchers = Vec::new();
        for config in configs {
            let session = ClientSession::new(config.options)?;
            session.connect();
            self.spawn_session_watcher(config.id.clone(), &session);
            watchers.push((config.id.clone(), session.watch_state()));
            self.clients.lock().expect("client manager lock poisoned").insert(
                config.id,
                ClientEntry {
                    session,
                    online: false,
                    busy: false,
                    last_error: None,
                    last_seen_at: None,
                },
            );
        }

        let mut online = Vec::new();
        for (client_id, mut state) in watchers {
            let settled = tokio::time::timeout(READY_TIMEOUT, async {
                state.wait_for(|s| s.is_settled()).await.map(|s| *s)
            })
            .await;
            match settled {
                Ok(Ok(ConnectionState::Connected)) => {
                    self.set_online(&client_id, true, None);
                    online.push(client_id);
                }
                Ok(Ok(_)) | Ok(Err(_)) => {
                    self.set_online(&client_id, false, Some("connect failed".to_string()));
                }
                Err(_) => {
                    tracing::warn!(%client_id, "client did not settle before pool start");
                    self.set_online(&client_id, false, Some("connect timeout".to_string()));
                }
            }
        }

        self.sink.emit(PoolEvent::PoolReady {
            client_ids: online.clone(),
        });
        Ok(online)
    }

    fn spawn_session_watcher(self: &Arc<Self>, client_id: String, session: &Arc<ClientSession>) {
        let manager = Arc::clone(self);
        let mut events = session.subscribe();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => return,
                    event = events.recv() => event,
                };
                match event {
                    Ok(SessionEvent::Connected) | Ok(SessionEvent::Reconnected) => {
                        manager.set_online(&client_id, true, None);
                    }
                    Ok(SessionEvent::Disconnected) => {
                        manager.set_online(&client_id, false, Some("disconnected".to_string()));
                    }
                    Ok(SessionEvent::ReconnectionFailed) => {
                        manager.set_online(
                            &client_id,
                            false,
                            Some("reconnection failed".to_string()),
                        );
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(%client_id, skipped, "client watcher lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });
    }

    fn set_online(&self, client_id: &str, online: bool, error: Option<String>) {
        let (busy, last_error) = {
            let mut clients = self.clients.lock().expect("client manager lock poisoned");
            let Some(entry) = clients.get_mut(client_id) else {
                return;
            };
            if entry.online == online {
                // No transition; just refresh the error note.
                if let Some(error) = error {
                    entry.last_error = Some(error);
                }
                return;
            }
            entry.online = online;
            if let Some(error) = error {
                entry.last_error = Some(error);
            }
            if online {
                entry.last_seen_at = Some(Utc::now());
            }
            (entry.busy, entry.last_error.clone())
        };
        self.sink.emit(PoolEvent::ClientState {
            client_id: client_id.to_string(),
            online,
            busy,
            last_error,
        });
    }

    pub(crate) fn client_ids(&self) -> Vec<String> {
        self.clients
            .lock()
            .expect("client manager lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    pub(crate) fn session(&self, client_id: &str) -> Option<Arc<ClientSession>> {
        self.clients
            .lock()
            .expect("client manager lock poisoned")
            .get(client_id)
            .map(|entry| Arc::clone(&entry.session))
    }

    /// Clients that are online and idle.
    pub(crate) fn stable_ids(&self) -> Vec<String> {
        self.clients
            .lock()
            .expect("client manager lock poisoned")
            .iter()
            .filter(|(_, entry)| entry.online && !entry.busy)
            .map(|(id, _)| id.clone())
            .collect()
    }

    fn entry_can_run(&self, client_id: &str, entry: &ClientEntry, job: &CompatJob<'_>) -> bool {
        entry.online
            && !entry.busy
            && !job.excluded.contains(client_id)
            && (job.preferred.is_empty() || job.preferred.contains(client_id))
            && !job.permanently_failed.contains(client_id)
            && !self.strategy.should_skip(client_id, job.workflow_hash)
    }

    /// Full compatibility check for a scheduling candidate.
    pub(crate) fn can_run(&self, client_id: &str, job: &CompatJob<'_>) -> bool {
        let clients = self.clients.lock().expect("client manager lock poisoned");
        let Some(entry) = clients.get(client_id) else {
            return false;
        };
        self.entry_can_run(client_id, entry, job)
    }

    /// Atomically mark the client busy iff the compatibility check still
    /// holds. The returned claim must be released exactly once.
    pub(crate) fn claim(
        self: &Arc<Self>,
        client_id: &str,
        job: &CompatJob<'_>,
    ) -> Option<ClaimedClient> {
        let (session, online, last_error) = {
            let mut clients = self.clients.lock().expect("client manager lock poisoned");
            let entry = clients.get_mut(client_id)?;
            if !self.entry_can_run(client_id, entry, job) {
                return None;
            }
            entry.busy = true;
            (Arc::clone(&entry.session), entry.online, entry.last_error.clone())
        };
        self.sink.emit(PoolEvent::ClientState {
            client_id: client_id.to_string(),
            online,
            busy: true,
            last_error,
        });
        Some(ClaimedClient {
            manager: Arc::clone(self),
            client_id: client_id.to_string(),
            workflow_hash: job.workflow_hash.to_string(),
            session,
            released: false,
        })
    }

    /// Record a failed attempt: remembers the error on the client and feeds
    /// the failover strategy, announcing block edges.
    pub(crate) fn record_failure(&self, client_id: &str, workflow_hash: &str, error: &ExecError) {
        {
            let mut clients = self.clients.lock().expect("client manager lock poisoned");
            if let Some(entry) = clients.get_mut(client_id) {
                entry.last_error = Some(error.to_string());
            }
        }
        if self.strategy.record_failure(client_id, workflow_hash) {
            self.sink.emit(PoolEvent::ClientBlockedWorkflow {
                client_id: client_id.to_string(),
                workflow_hash: workflow_hash.to_string(),
            });
        }
    }

    fn finish_release(&self, client_id: &str, workflow_hash: &str, success: bool) {
        let (online, last_error) = {
            let mut clients = self.clients.lock().expect("client manager lock poisoned");
            let Some(entry) = clients.get_mut(client_id) else {
                return;
            };
            entry.busy = false;
            if success {
                entry.last_seen_at = Some(Utc::now());
            }
            (entry.online, entry.last_error.clone())
        };
        self.sink.emit(PoolEvent::ClientState {
            client_id: client_id.to_string(),
            online,
            busy: false,
            last_error,
        });
        if success && self.strategy.record_success(client_id, workflow_hash) {
            self.sink.emit(PoolEvent::ClientUnblockedWorkflow {
                client_id: client_id.to_string(),
                workflow_hash: workflow_hash.to_string(),
            });
        }
    }

    pub(crate) fn snapshots(&self) -> Vec<ClientSnapshot> {
        let clients = self.clients.lock().expect("client manager lock poisoned");
        let mut out: Vec<ClientSnapshot> = clients
            .iter()
            .map(|(id, entry)| ClientSnapshot {
                id: id.clone(),
                online: entry.online,
                busy: entry.busy,
                last_error: entry.last_error.clone(),
                last_seen_at: entry.last_seen_at,
            })
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Periodic keep-alive pings over every online client.
    ///
    /// Ping failures are recorded but do not flip a client offline; the
    /// session's own disconnect event is authoritative.
    pub(crate) fn spawn_health_loop(self: &Arc<Self>, interval: Duration) {
        if interval.is_zero() {
            return;
        }
        let manager = Arc::clone(self);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tick.tick() => {}
                }
                let targets: Vec<(String, Arc<ClientSession>)> = {
                    let clients = manager.clients.lock().expect("client manager lock poisoned");
                    clients
                        .iter()
                        .filter(|(_, entry)| entry.online)
                        .map(|(id, entry)| (id.clone(), Arc::clone(&entry.session)))
                        .collect()
                };
                for (client_id, session) in targets {
                    match session.get_queue().await {
                        Ok(_) => {
                            let mut clients =
                                manager.clients.lock().expect("client manager lock poisoned");
                            if let Some(entry) = clients.get_mut(&client_id) {
                                entry.last_seen_at = Some(Utc::now());
                            }
                        }
                        Err(err) => {
                            tracing::warn!(%client_id, error = %err, "health check failed");
                            let mut clients =
                                manager.clients.lock().expect("client manager lock poisoned");
                            if let Some(entry) = clients.get_mut(&client_id) {
                                entry.last_error = Some(err.to_string());
                            }
                        }
                    }
                }
            }
        });
    }

    /// Close every session. The cancel token is expected to be cancelled
    /// already so watcher and health tasks are winding down.
    pub(crate) async fn shutdown(&self) {
        let sessions: Vec<Arc<ClientSession>> = {
            let clients = self.clients.lock().expect("client manager lock poisoned");
            clients.values().map(|entry| Arc::clone(&entry.session)).collect()
        };
        for session in sessions {
            session.close().await;
        }
    }
}

/// Exclusive use of one client for one attempt.
pub(crate) struct ClaimedClient {
    manager: Arc<ClientManager>,
    client_id: String,
    workflow_hash: String,
    session: Arc<ClientSession>,
    released: bool,
}

impl ClaimedClient {
    pub(crate) fn client_id(&self) -> &str {
        &self.client_id
    }

    pub(crate) fn session(&self) -> Arc<ClientSession> {
        Arc::clone(&self.session)
    }

    /// Release the claim. `success` feeds the failover strategy.
    pub(crate) fn release(mut self, success: bool) {
        self.released = true;
        self.manager
            .finish_release(&self.client_id, &self.workflow_hash, success);
    }
}

impl Drop for ClaimedClient {
    fn drop(&mut self) {
        if !self.released {
            tracing::warn!(client_id = %self.client_id, "claim dropped without release");
            self.manager
                .finish_release(&self.client_id, &self.workflow_hash, false);
        }
    }
}
