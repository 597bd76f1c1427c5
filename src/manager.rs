//! Sandbox session manager.
//!
//! Owns the registry mapping session keys to live sandbox instances, their
//! display channels, and driver handles. All registry mutations (acquire,
//! release, sweep, state transitions) are serialized per key through one
//! async mutex per entry: the map lock is only ever held long enough to
//! clone an entry handle, so one session's provisioning or step execution
//! never blocks another's.
//!
//! Teardown is idempotent by policy: an instance that is already gone or a
//! channel that is already closed is logged and treated as satisfied. A
//! torn-down session is evicted from the registry, so the map only ever
//! holds live or suspended entries.

use crate::display::{DisplayChannel, DisplayFactory};
use crate::driver::{Driver, DriverFactory};
use crate::error::{Error, Result};
use crate::provider::SandboxProvider;
use crate::session::{
    Session, SessionKey, SessionState, SessionSummary, generate_session_key,
};
use crate::takeover;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Everything owned for one live session.
pub struct SessionEntry {
    pub session: Session,
    pub display: Box<dyn DisplayChannel>,
    pub driver: Arc<dyn Driver>,
}

/// Registry slot. `None` only transiently, while the slot's first
/// provisioning is in flight or after it failed.
type Slot = Option<SessionEntry>;

/// Per-key handle; the mutex is the per-key serialization point.
pub type SharedEntry = Arc<Mutex<Slot>>;

/// Health snapshot for the surrounding layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Health {
    pub active_sessions: usize,
    pub reclaimed_last_sweep: usize,
}

pub struct SessionManager {
    registry: Mutex<HashMap<SessionKey, SharedEntry>>,
    provider: Arc<dyn SandboxProvider>,
    driver_factory: Arc<dyn DriverFactory>,
    display_factory: Arc<dyn DisplayFactory>,
    default_idle_timeout: Duration,
    reclaimed_last_sweep: AtomicUsize,
}

impl SessionManager {
    pub fn new(
        provider: Arc<dyn SandboxProvider>,
        driver_factory: Arc<dyn DriverFactory>,
        display_factory: Arc<dyn DisplayFactory>,
        default_idle_timeout: Duration,
    ) -> Self {
        Self {
            registry: Mutex::new(HashMap::new()),
            provider,
            driver_factory,
            display_factory,
            default_idle_timeout,
            reclaimed_last_sweep: AtomicUsize::new(0),
        }
    }

    /// Handle for an existing key.
    pub async fn get(&self, key: &str) -> Result<SharedEntry> {
        let registry = self.registry.lock().await;
        registry
            .get(key)
            .cloned()
            .ok_or_else(|| Error::SessionNotFound(key.to_string()))
    }

    async fn slot_for(&self, key: &str) -> SharedEntry {
        let mut registry = self.registry.lock().await;
        registry
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    async fn forget_if_empty(&self, key: &str, handle: &SharedEntry) {
        let mut registry = self.registry.lock().await;
        if let Some(existing) = registry.get(key) {
            if Arc::ptr_eq(existing, handle) {
                let slot = handle.lock().await;
                if slot.is_none() {
                    registry.remove(key);
                }
            }
        }
    }

    /// Return the live session for `key`, provisioning a new sandbox
    /// instance if none exists. Repeated calls on a live key are
    /// idempotent: same instance id, same display URL, idle clock reset.
    ///
    /// A key whose previous session is `Terminated`/`Reclaimed` gets a
    /// brand-new instance under the same key; a dead instance is never
    /// reattached.
    pub async fn acquire(
        &self,
        key: Option<String>,
        persistent: bool,
        idle_timeout: Option<Duration>,
    ) -> Result<(SessionKey, SharedEntry)> {
        let key = key.unwrap_or_else(generate_session_key);
        let idle_timeout = idle_timeout.unwrap_or(self.default_idle_timeout);

        let handle = self.slot_for(&key).await;
        // Holding the slot lock across provisioning is what makes a
        // concurrent second acquire for the same key wait instead of
        // provisioning twice.
        let mut slot = handle.lock().await;

        if let Some(entry) = slot.as_mut() {
            if entry.session.state.is_reusable() {
                if self.provider.is_alive(&entry.session.instance_id).await {
                    debug!(session = %key, instance = %entry.session.instance_id, "reusing live session");
                    entry.session.touch();
                    if entry.session.state == SessionState::Idle {
                        entry.session.state = SessionState::Ready;
                    }
                    drop(slot);
                    return Ok((key, handle));
                }
                warn!(session = %key, "registered instance no longer alive; reprovisioning");
                self.teardown_entry(entry, false).await;
            } else if entry.session.state.is_suspended() {
                // A suspended session is still alive; hand it back rather
                // than tearing down the operator's browser.
                entry.session.touch();
                drop(slot);
                return Ok((key, handle));
            }
            // Terminal states fall through to fresh provisioning.
            *slot = None;
        }

        match self.provision(&key, persistent, idle_timeout).await {
            Ok(entry) => {
                info!(session = %key, instance = %entry.session.instance_id, "session ready");
                *slot = Some(entry);
                drop(slot);
                Ok((key, handle))
            }
            Err(err) => {
                // No partial registry state survives a failed acquire.
                drop(slot);
                self.forget_if_empty(&key, &handle).await;
                Err(err)
            }
        }
    }

    async fn provision(
        &self,
        key: &str,
        persistent: bool,
        idle_timeout: Duration,
    ) -> Result<SessionEntry> {
        let info = self.provider.create_instance().await?;
        debug!(session = %key, instance = %info.id, cdp = %info.cdp_url, "instance provisioned");

        let mut display = self.display_factory.channel();
        let display_url = match display.start().await {
            Ok(url) => url,
            Err(err) => {
                self.destroy_instance_quietly(&info.id).await;
                return Err(err);
            }
        };

        let driver = match self.driver_factory.connect(&info.cdp_url).await {
            Ok(driver) => driver,
            Err(err) => {
                display.stop().await;
                self.destroy_instance_quietly(&info.id).await;
                return Err(Error::Provision(format!(
                    "driver connect to {} failed: {}",
                    info.cdp_url, err
                )));
            }
        };

        let mut session = Session::new(key, &info.id, persistent, idle_timeout);
        session.state = SessionState::Ready;
        session.display_url = Some(display_url);

        Ok(SessionEntry {
            session,
            display,
            driver,
        })
    }

    async fn destroy_instance_quietly(&self, id: &str) {
        if let Err(err) = self.provider.destroy_instance(id).await {
            warn!(instance = %id, error = %err, "instance teardown failed; treating as gone");
        }
    }

    async fn teardown_entry(&self, entry: &mut SessionEntry, reclaimed: bool) {
        self.destroy_instance_quietly(&entry.session.instance_id).await;
        entry.display.stop().await;
        takeover::terminate(&mut entry.session, reclaimed);
    }

    /// Release a session.
    ///
    /// Non-persistent sessions (or `force`) are terminated and torn down
    /// immediately; a persistent session is only marked `Idle` and its
    /// instance kept warm. Returns whether resources were actually freed.
    pub async fn release(&self, key: &str, force: bool) -> Result<bool> {
        let handle = self.get(key).await?;
        let mut slot = handle.lock().await;
        let entry = slot
            .as_mut()
            .ok_or_else(|| Error::SessionNotFound(key.to_string()))?;

        if entry.session.state.is_terminal() {
            return Ok(false);
        }

        if entry.session.persistent && !force {
            entry.session.state = SessionState::Idle;
            entry.session.touch();
            debug!(session = %key, "persistent session idled");
            return Ok(false);
        }

        info!(session = %key, force, "releasing session");
        self.teardown_entry(entry, false).await;
        *slot = None;
        drop(slot);
        self.forget_if_empty(key, &handle).await;
        Ok(true)
    }

    /// Reclaim every session whose idle budget is spent.
    ///
    /// A session mid-step is never reclaimed: its slot lock is held by the
    /// executor, `try_lock` fails, and the next sweep re-checks after the
    /// step boundary.
    pub async fn sweep(&self) -> usize {
        let handles: Vec<(SessionKey, SharedEntry)> = {
            let registry = self.registry.lock().await;
            registry
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        };

        let mut reclaimed = 0usize;
        for (key, handle) in handles {
            let Ok(mut slot) = handle.try_lock() else {
                debug!(session = %key, "sweep skipping busy session");
                continue;
            };
            let Some(entry) = slot.as_mut() else {
                continue;
            };
            if entry.session.state.is_terminal() || !entry.session.is_expired() {
                continue;
            }
            info!(
                session = %key,
                idle_secs = entry.session.idle_age().as_secs(),
                "reclaiming idle session"
            );
            self.teardown_entry(entry, true).await;
            reclaimed += 1;
            *slot = None;
            drop(slot);
            self.forget_if_empty(&key, &handle).await;
        }

        self.reclaimed_last_sweep.store(reclaimed, Ordering::SeqCst);
        reclaimed
    }

    /// Run `sweep` on a fixed interval until the token is cancelled.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let reclaimed = manager.sweep().await;
                        if reclaimed > 0 {
                            info!(reclaimed, "idle sweep reclaimed sessions");
                        }
                    }
                }
            }
        })
    }

    /// Resume automated control after a takeover.
    ///
    /// The transition guard verifies the backing instance and display
    /// channel are still healthy; if not, the session is forced to
    /// `Terminated` and `SessionLostError` surfaces.
    pub async fn resume(&self, key: &str) -> Result<SessionState> {
        let handle = self.get(key).await?;
        let mut slot = handle.lock().await;
        let entry = slot
            .as_mut()
            .ok_or_else(|| Error::SessionNotFound(key.to_string()))?;

        takeover::begin_resume(&mut entry.session)?;

        let instance_alive = self.provider.is_alive(&entry.session.instance_id).await;
        let display_healthy = entry.display.is_healthy().await;
        let healthy = instance_alive && display_healthy;
        if !healthy {
            warn!(
                session = %key,
                instance_alive,
                display_healthy,
                "resume guard failed"
            );
            self.destroy_instance_quietly(&entry.session.instance_id).await;
            entry.display.stop().await;
        }
        match takeover::complete_resume(&mut entry.session, healthy) {
            Ok(()) => Ok(entry.session.state),
            Err(err) => {
                *slot = None;
                drop(slot);
                self.forget_if_empty(key, &handle).await;
                Err(err)
            }
        }
    }

    pub async fn health(&self) -> Health {
        let handles: Vec<SharedEntry> = {
            let registry = self.registry.lock().await;
            registry.values().cloned().collect()
        };
        let mut active = 0usize;
        for handle in handles {
            // A busy slot is by definition live.
            match handle.try_lock() {
                Err(_) => active += 1,
                Ok(slot) => {
                    if slot
                        .as_ref()
                        .is_some_and(|e| !e.session.state.is_terminal())
                    {
                        active += 1;
                    }
                }
            }
        }
        Health {
            active_sessions: active,
            reclaimed_last_sweep: self.reclaimed_last_sweep.load(Ordering::SeqCst),
        }
    }

    pub async fn list(&self) -> Vec<SessionSummary> {
        let handles: Vec<SharedEntry> = {
            let registry = self.registry.lock().await;
            registry.values().cloned().collect()
        };
        let mut summaries = Vec::with_capacity(handles.len());
        for handle in handles {
            if let Ok(slot) = handle.try_lock() {
                if let Some(entry) = slot.as_ref() {
                    summaries.push(entry.session.summary());
                }
            }
        }
        summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        summaries
    }
}
