//! In-process, single-node agent discovery.
//!
//! The registry maps agent names to endpoints and keeps registrations alive
//! through heartbeats: a registration whose `last_heartbeat` falls behind the
//! configured timeout is removed by [`Registry::prune_stale`], which a
//! background task runs on a fixed tick once [`Registry::start`] is invoked.
//!
//! All operations are safe under concurrent callers and fail locally — they
//! never sit on the hot path of request handling.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use agentrpc_core::AgentError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Registrations older than this without a heartbeat are pruned.
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(90);

/// Tick of the background prune task.
pub const DEFAULT_PRUNE_INTERVAL: Duration = Duration::from_secs(60);

/// One registry entry, keyed by agent name.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentRegistration {
    pub name: String,
    /// Endpoint URL (`unix://…`, `tcp://…`, `http://…`, …).
    pub endpoint: String,
    #[serde(default)]
    pub capabilities: Map<String, Value>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// Filled by the registry on first registration when unset.
    pub registered_at: Option<DateTime<Utc>>,
    /// Refreshed by [`Registry::heartbeat`].
    pub last_heartbeat: Option<DateTime<Utc>>,
}

impl AgentRegistration {
    pub fn new<N: Into<String>, E: Into<String>>(name: N, endpoint: E) -> Self {
        Self {
            name: name.into(),
            endpoint: endpoint.into(),
            capabilities: Map::new(),
            metadata: Map::new(),
            registered_at: None,
            last_heartbeat: None,
        }
    }

    pub fn with_capability<K: Into<String>, V: Into<Value>>(mut self, key: K, value: V) -> Self {
        self.capabilities.insert(key.into(), value.into());
        self
    }

    pub fn with_metadata<K: Into<String>, V: Into<Value>>(mut self, key: K, value: V) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// In-memory name → registration index with TTL.
pub struct Registry {
    entries: RwLock<HashMap<String, AgentRegistration>>,
    heartbeat_timeout: Duration,
    prune_interval: Duration,
    prune_task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::with_timeouts(DEFAULT_HEARTBEAT_TIMEOUT, DEFAULT_PRUNE_INTERVAL)
    }

    pub fn with_timeouts(heartbeat_timeout: Duration, prune_interval: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            heartbeat_timeout,
            prune_interval,
            prune_task: Mutex::new(None),
        }
    }

    /// Insert or replace a registration by name.
    ///
    /// `registered_at` and `last_heartbeat` are set to now when unset.
    pub fn register(&self, mut registration: AgentRegistration) -> Result<(), AgentError> {
        if registration.name.is_empty() {
            return Err(AgentError::invalid_request(
                "registration requires a non-empty agent name",
            ));
        }
        let now = Utc::now();
        registration.registered_at.get_or_insert(now);
        registration.last_heartbeat.get_or_insert(now);

        let mut entries = self.entries.write().expect("registry lock poisoned");
        debug!(agent = %registration.name, endpoint = %registration.endpoint, "agent registered");
        entries.insert(registration.name.clone(), registration);
        Ok(())
    }

    /// Remove a registration. Idempotent.
    pub fn unregister(&self, name: &str) {
        let mut entries = self.entries.write().expect("registry lock poisoned");
        if entries.remove(name).is_some() {
            debug!(agent = %name, "agent unregistered");
        }
    }

    /// Look up a registration by name.
    pub fn lookup(&self, name: &str) -> Option<AgentRegistration> {
        self.entries
            .read()
            .expect("registry lock poisoned")
            .get(name)
            .cloned()
    }

    /// All current registrations.
    pub fn list(&self) -> Vec<AgentRegistration> {
        self.entries
            .read()
            .expect("registry lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Refresh `last_heartbeat` for a registered agent.
    pub fn heartbeat(&self, name: &str) -> Result<(), AgentError> {
        let mut entries = self.entries.write().expect("registry lock poisoned");
        match entries.get_mut(name) {
            Some(entry) => {
                entry.last_heartbeat = Some(Utc::now());
                Ok(())
            }
            None => Err(AgentError::agent_not_found(format!(
                "agent '{name}' is not registered"
            ))),
        }
    }

    /// Remove every registration whose last heartbeat is older than the
    /// heartbeat timeout. Returns the number removed.
    pub fn prune_stale(&self) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.heartbeat_timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(i64::MAX / 1_000));
        let mut entries = self.entries.write().expect("registry lock poisoned");
        let before = entries.len();
        entries.retain(|name, entry| {
            let fresh = entry.last_heartbeat.is_some_and(|hb| hb > cutoff);
            if !fresh {
                warn!(agent = %name, "pruning stale registration");
            }
            fresh
        });
        before - entries.len()
    }

    /// Spawn the background prune task.
    ///
    /// The task ticks every prune interval until [`stop`](Self::stop) is
    /// called or `ctx` is cancelled. Calling `start` on an already started
    /// registry is a no-op.
    pub fn start(self: &Arc<Self>, ctx: &CancellationToken) {
        let mut guard = self.prune_task.lock().expect("registry lock poisoned");
        if guard.is_some() {
            return;
        }
        let token = ctx.child_token();
        let registry = Arc::clone(self);
        let task_token = token.clone();
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(registry.prune_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first interval tick fires immediately; skip it so a fresh
            // registry is not pruned at startup.
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    _ = tick.tick() => {
                        let removed = registry.prune_stale();
                        if removed > 0 {
                            debug!(removed, "prune tick removed stale agents");
                        }
                    }
                }
            }
        });
        *guard = Some((token, handle));
    }

    /// Stop the background prune task and wait for it to finish. Idempotent.
    pub async fn stop(&self) {
        let task = self
            .prune_task
            .lock()
            .expect("registry lock poisoned")
            .take();
        if let Some((token, handle)) = task {
            token.cancel();
            let _ = handle.await;
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

/// Emit periodic heartbeats for `name` until the agent is no longer
/// registered (the loop self-terminates) or `ctx` is cancelled.
pub async fn heartbeat_loop(
    ctx: CancellationToken,
    registry: Arc<Registry>,
    name: &str,
    interval: Duration,
) {
    let mut tick = tokio::time::interval(interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    tick.tick().await;
    loop {
        tokio::select! {
            _ = ctx.cancelled() => break,
            _ = tick.tick() => {
                if registry.heartbeat(name).is_err() {
                    debug!(agent = %name, "heartbeat loop stopping: agent unknown");
                    break;
                }
            }
        }
    }
}
