//! Remote display channel: virtual display + VNC server + web proxy.
//!
//! One channel per session exposes the sandbox browser's screen over a
//! browser-reachable URL. The concrete stack is Xvfb on display `:{n}`,
//! x11vnc on port `5901+n`, and websockify/noVNC on `6080+n`. Starting is
//! idempotent; stopping a never-started channel is a no-op; transient
//! start failures (port bind races) are retried a few times with short
//! backoff before surfacing `DisplayChannelError`.
//!
//! Slots are leased from a shared pool for the lifetime of a started
//! channel and returned on stop, so display numbers and port pairs are
//! recycled instead of growing with every session ever created.

use crate::error::{Error, Result};
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

/// Display stack configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisplayConfig {
    /// Host the web proxy URL is advertised under.
    #[serde(default = "default_host")]
    pub host: String,
    /// First virtual display number; sessions count up from here.
    #[serde(default = "default_display_base")]
    pub display_base: u16,
    /// First VNC server port.
    #[serde(default = "default_vnc_port")]
    pub vnc_port_base: u16,
    /// First web-proxy port.
    #[serde(default = "default_web_port")]
    pub web_port_base: u16,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_display_base() -> u16 {
    1
}
fn default_vnc_port() -> u16 {
    5901
}
fn default_web_port() -> u16 {
    6080
}
fn default_width() -> u32 {
    1920
}
fn default_height() -> u32 {
    1080
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            display_base: default_display_base(),
            vnc_port_base: default_vnc_port(),
            web_port_base: default_web_port(),
            width: default_width(),
            height: default_height(),
        }
    }
}

/// Per-session display channel.
#[async_trait]
pub trait DisplayChannel: Send + Sync {
    /// Bring the stack up and return the external URL. Idempotent: a
    /// started channel returns its existing URL unchanged.
    async fn start(&mut self) -> Result<String>;

    /// Tear the stack down. No-op on a never-started channel.
    async fn stop(&mut self);

    /// URL if started.
    fn url(&self) -> Option<String>;

    /// Whether the stack is still up (resume guard input).
    async fn is_healthy(&mut self) -> bool;
}

/// Allocates channels for new sessions.
pub trait DisplayFactory: Send + Sync {
    fn channel(&self) -> Box<dyn DisplayChannel>;
}

/// Lease pool for display slots. Freed slots are reissued before the
/// counter advances, keeping the display/port range dense.
#[derive(Default)]
pub struct SlotPool {
    state: StdMutex<PoolState>,
}

#[derive(Default)]
struct PoolState {
    free: Vec<u16>,
    next: u16,
}

impl SlotPool {
    fn acquire(&self) -> u16 {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(slot) = state.free.pop() {
            slot
        } else {
            let slot = state.next;
            state.next += 1;
            slot
        }
    }

    fn release(&self, slot: u16) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.free.push(slot);
    }
}

struct DisplayProcs {
    xvfb: Child,
    x11vnc: Child,
    websockify: Child,
}

/// Process-backed VNC channel on a pool-leased display slot.
pub struct VncChannel {
    config: DisplayConfig,
    pool: Arc<SlotPool>,
    /// Offset added to the configured base display/ports; leased while
    /// the stack is up, `None` otherwise.
    slot: Option<u16>,
    retry: RetryPolicy,
    procs: Option<DisplayProcs>,
    url: Option<String>,
}

impl VncChannel {
    pub fn new(config: DisplayConfig, pool: Arc<SlotPool>) -> Self {
        Self {
            config,
            pool,
            slot: None,
            retry: RetryPolicy::display_default(),
            procs: None,
            url: None,
        }
    }

    fn display_number(&self, slot: u16) -> u16 {
        self.config.display_base + slot
    }

    fn vnc_port(&self, slot: u16) -> u16 {
        self.config.vnc_port_base + slot
    }

    fn web_port(&self, slot: u16) -> u16 {
        self.config.web_port_base + slot
    }

    fn external_url(&self, slot: u16) -> String {
        format!("http://{}:{}/vnc.html", self.config.host, self.web_port(slot))
    }

    async fn spawn_stack(&self, slot: u16) -> Result<DisplayProcs> {
        let display = format!(":{}", self.display_number(slot));
        let screen = format!("{}x{}x24", self.config.width, self.config.height);

        let xvfb = Command::new("Xvfb")
            .arg(&display)
            .arg("-screen")
            .arg("0")
            .arg(&screen)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::DisplayChannel(format!("Xvfb spawn failed: {}", e)))?;

        let mut x11vnc = Command::new("x11vnc")
            .arg("-display")
            .arg(&display)
            .arg("-rfbport")
            .arg(self.vnc_port(slot).to_string())
            .arg("-forever")
            .arg("-shared")
            .arg("-nopw")
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::DisplayChannel(format!("x11vnc spawn failed: {}", e)));
        let x11vnc = match x11vnc {
            Ok(child) => child,
            Err(err) => {
                kill_quietly(xvfb, "Xvfb").await;
                return Err(err);
            }
        };

        let websockify = Command::new("websockify")
            .arg("--web")
            .arg("/usr/share/novnc")
            .arg(self.web_port(slot).to_string())
            .arg(format!("localhost:{}", self.vnc_port(slot)))
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::DisplayChannel(format!("websockify spawn failed: {}", e)));
        let websockify = match websockify {
            Ok(child) => child,
            Err(err) => {
                kill_quietly(x11vnc, "x11vnc").await;
                kill_quietly(xvfb, "Xvfb").await;
                return Err(err);
            }
        };

        Ok(DisplayProcs {
            xvfb,
            x11vnc,
            websockify,
        })
    }
}

async fn kill_quietly(mut child: Child, name: &str) {
    if let Err(err) = child.kill().await {
        // Already exited counts as stopped.
        debug!(process = name, error = %err, "kill on stopped process");
    }
}

fn child_running(child: &mut Child) -> bool {
    matches!(child.try_wait(), Ok(None))
}

#[async_trait]
impl DisplayChannel for VncChannel {
    async fn start(&mut self) -> Result<String> {
        if let Some(url) = &self.url {
            if self.procs.is_some() {
                return Ok(url.clone());
            }
        }

        let slot = match self.slot {
            Some(slot) => slot,
            None => self.pool.acquire(),
        };
        self.slot = Some(slot);

        let mut last_err = None;
        for attempt in 1..=self.retry.max_attempts.max(1) {
            match self.spawn_stack(slot).await {
                Ok(procs) => {
                    let url = self.external_url(slot);
                    debug!(display = self.display_number(slot), url = %url, "display channel up");
                    self.procs = Some(procs);
                    self.url = Some(url.clone());
                    return Ok(url);
                }
                Err(err) => {
                    warn!(attempt, error = %err, "display channel start failed");
                    last_err = Some(err);
                    if self.retry.budget_remains(attempt) {
                        tokio::time::sleep(self.retry.delay_for(attempt)).await;
                    }
                }
            }
        }
        // Failed to come up at all: hand the slot straight back.
        self.slot = None;
        self.pool.release(slot);
        Err(last_err
            .unwrap_or_else(|| Error::DisplayChannel("start failed with no attempts".into())))
    }

    async fn stop(&mut self) {
        if let Some(procs) = self.procs.take() {
            // Reverse start order: proxy first, virtual display last.
            kill_quietly(procs.websockify, "websockify").await;
            kill_quietly(procs.x11vnc, "x11vnc").await;
            kill_quietly(procs.xvfb, "Xvfb").await;
        }
        if let Some(slot) = self.slot.take() {
            self.pool.release(slot);
        }
        self.url = None;
    }

    fn url(&self) -> Option<String> {
        self.url.clone()
    }

    async fn is_healthy(&mut self) -> bool {
        // A never-started channel is not healthy; a started one is healthy
        // while all three children are still running.
        match &mut self.procs {
            None => false,
            Some(procs) => {
                child_running(&mut procs.xvfb)
                    && child_running(&mut procs.x11vnc)
                    && child_running(&mut procs.websockify)
            }
        }
    }
}

/// Hands each new session a channel backed by the shared slot pool.
pub struct VncDisplayFactory {
    config: DisplayConfig,
    pool: Arc<SlotPool>,
}

impl VncDisplayFactory {
    pub fn new(config: DisplayConfig) -> Self {
        Self {
            config,
            pool: Arc::new(SlotPool::default()),
        }
    }
}

impl DisplayFactory for VncDisplayFactory {
    fn channel(&self) -> Box<dyn DisplayChannel> {
        Box::new(VncChannel::new(self.config.clone(), Arc::clone(&self.pool)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_uses_web_port_and_slot() {
        let channel = VncChannel::new(DisplayConfig::default(), Arc::new(SlotPool::default()));
        assert_eq!(channel.display_number(2), 3);
        assert_eq!(channel.vnc_port(2), 5903);
        assert_eq!(channel.external_url(2), "http://127.0.0.1:6082/vnc.html");
    }

    #[tokio::test]
    async fn stop_before_start_is_noop() {
        let mut channel = VncChannel::new(DisplayConfig::default(), Arc::new(SlotPool::default()));
        channel.stop().await;
        assert!(channel.url().is_none());
        assert!(!channel.is_healthy().await);
    }

    #[test]
    fn pool_recycles_released_slots() {
        let pool = SlotPool::default();
        assert_eq!(pool.acquire(), 0);
        assert_eq!(pool.acquire(), 1);
        pool.release(0);
        assert_eq!(pool.acquire(), 0);
        assert_eq!(pool.acquire(), 2);
    }

    #[tokio::test]
    async fn stop_returns_slot_to_pool() {
        let pool = Arc::new(SlotPool::default());
        let mut channel = VncChannel::new(DisplayConfig::default(), Arc::clone(&pool));
        channel.slot = Some(pool.acquire());
        channel.stop().await;
        assert_eq!(pool.acquire(), 0);
    }
}
