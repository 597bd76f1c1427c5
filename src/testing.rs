//! In-memory test doubles for the provider, driver, and display seams.
//!
//! Used by the integration suite to exercise session lifecycle, retry,
//! and takeover behavior without Docker, a browser, or X processes.

use crate::driver::{Driver, DriverError, DriverFactory, ElementRef, PageProbe};
use crate::display::{DisplayChannel, DisplayFactory};
use crate::error::{Error, Result};
use crate::provider::{InstanceInfo, SandboxProvider};
use crate::step::{Action, WaitCondition};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

/// Provider that hands out numbered in-memory instances.
#[derive(Default)]
pub struct FakeProvider {
    counter: AtomicUsize,
    live: Mutex<HashSet<String>>,
    /// When set, every create_instance call fails.
    pub fail_create: std::sync::atomic::AtomicBool,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn created_count(&self) -> usize {
        self.counter.load(Ordering::SeqCst)
    }

    /// Simulate the sandbox dying out from under the session.
    pub async fn kill(&self, id: &str) {
        self.live.lock().await.remove(id);
    }
}

#[async_trait]
impl SandboxProvider for FakeProvider {
    async fn create_instance(&self) -> Result<InstanceInfo> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(Error::Provision("fake provider set to fail".into()));
        }
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let id = format!("fake-instance-{n}");
        self.live.lock().await.insert(id.clone());
        Ok(InstanceInfo {
            cdp_url: format!("ws://fake/{id}"),
            id,
        })
    }

    async fn destroy_instance(&self, id: &str) -> Result<()> {
        self.live.lock().await.remove(id);
        Ok(())
    }

    async fn is_alive(&self, id: &str) -> bool {
        self.live.lock().await.contains(id)
    }
}

/// Scripted outcome for one dispatch against the fake driver.
#[derive(Debug, Clone)]
pub enum Scripted {
    Ok,
    Fail(FakeFailure),
}

#[derive(Debug, Clone)]
pub enum FakeFailure {
    Timeout,
    ElementAbsent,
    Navigation,
    Other,
}

impl FakeFailure {
    fn to_error(&self) -> DriverError {
        match self {
            Self::Timeout => DriverError::Timeout(Duration::from_secs(1)),
            Self::ElementAbsent => DriverError::ElementAbsent("scripted".into()),
            Self::Navigation => DriverError::Navigation("scripted".into()),
            Self::Other => DriverError::Other("scripted".into()),
        }
    }
}

#[derive(Default)]
struct FakeDriverState {
    /// Outcomes consumed front to back; empty means succeed.
    script: Vec<Scripted>,
    dispatches: usize,
    probe: PageProbe,
    /// Extra latency applied to every dispatch.
    dispatch_delay: Duration,
}

/// Driver whose dispatch outcomes follow a caller-provided script.
#[derive(Default)]
pub struct FakeDriver {
    state: Mutex<FakeDriverState>,
}

impl FakeDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue outcomes for upcoming dispatches, front first.
    pub async fn script(&self, outcomes: Vec<Scripted>) {
        self.state.lock().await.script = outcomes;
    }

    /// Page snapshot returned by subsequent probes.
    pub async fn set_probe(&self, url: &str, title: &str) {
        let mut state = self.state.lock().await;
        state.probe = PageProbe {
            url: url.to_string(),
            title: title.to_string(),
        };
    }

    pub async fn set_dispatch_delay(&self, delay: Duration) {
        self.state.lock().await.dispatch_delay = delay;
    }

    pub async fn dispatch_count(&self) -> usize {
        self.state.lock().await.dispatches
    }

    async fn dispatch(&self) -> std::result::Result<(), DriverError> {
        let (outcome, delay) = {
            let mut state = self.state.lock().await;
            state.dispatches += 1;
            let outcome = if state.script.is_empty() {
                Scripted::Ok
            } else {
                state.script.remove(0)
            };
            (outcome, state.dispatch_delay)
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        match outcome {
            Scripted::Ok => Ok(()),
            Scripted::Fail(failure) => Err(failure.to_error()),
        }
    }
}

#[async_trait]
impl Driver for FakeDriver {
    async fn navigate(&self, _url: &str) -> std::result::Result<(), DriverError> {
        self.dispatch().await
    }

    async fn locate(&self, selector: &str) -> std::result::Result<ElementRef, DriverError> {
        self.dispatch().await?;
        Ok(ElementRef {
            selector: selector.to_string(),
        })
    }

    async fn act(
        &self,
        _element: &ElementRef,
        action: &Action,
    ) -> std::result::Result<Option<String>, DriverError> {
        self.dispatch().await?;
        Ok(match action {
            Action::ReadText => Some("fake text".to_string()),
            _ => None,
        })
    }

    async fn wait(
        &self,
        _condition: &WaitCondition,
        _timeout: Duration,
    ) -> std::result::Result<(), DriverError> {
        self.dispatch().await
    }

    async fn screenshot(&self) -> std::result::Result<Vec<u8>, DriverError> {
        Ok(vec![0x89, 0x50, 0x4e, 0x47])
    }

    async fn probe(&self) -> std::result::Result<PageProbe, DriverError> {
        Ok(self.state.lock().await.probe.clone())
    }

    async fn run_script(&self, _script: &str) -> std::result::Result<String, DriverError> {
        self.dispatch().await?;
        Ok("null".to_string())
    }
}

/// Factory that hands every connection the same shared fake driver.
pub struct FakeDriverFactory {
    pub driver: Arc<FakeDriver>,
}

impl FakeDriverFactory {
    pub fn new() -> Self {
        Self {
            driver: Arc::new(FakeDriver::new()),
        }
    }
}

impl Default for FakeDriverFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DriverFactory for FakeDriverFactory {
    async fn connect(&self, _cdp_url: &str) -> std::result::Result<Arc<dyn Driver>, DriverError> {
        Ok(self.driver.clone())
    }
}

/// Display channel that tracks state without spawning processes.
pub struct FakeDisplay {
    slot: usize,
    url: Option<String>,
    pub healthy: bool,
}

#[async_trait]
impl DisplayChannel for FakeDisplay {
    async fn start(&mut self) -> Result<String> {
        let url = self
            .url
            .get_or_insert_with(|| format!("http://127.0.0.1:{}/vnc.html", 6080 + self.slot))
            .clone();
        self.healthy = true;
        Ok(url)
    }

    async fn stop(&mut self) {
        self.healthy = false;
    }

    fn url(&self) -> Option<String> {
        self.url.clone()
    }

    async fn is_healthy(&mut self) -> bool {
        self.healthy
    }
}

#[derive(Default)]
pub struct FakeDisplayFactory {
    next_slot: AtomicUsize,
}

impl FakeDisplayFactory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DisplayFactory for FakeDisplayFactory {
    fn channel(&self) -> Box<dyn DisplayChannel> {
        let slot = self.next_slot.fetch_add(1, Ordering::SeqCst);
        Box::new(FakeDisplay {
            slot,
            url: None,
            healthy: false,
        })
    }
}
