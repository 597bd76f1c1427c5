//! Driver adapter over a browser-automation engine.
//!
//! [`Driver`] is the capability seam the executor dispatches through:
//! open page, locate element, act on element, wait for a condition,
//! screenshot, and a cheap page probe for failure classification. The
//! shipped implementation is [`CdpDriver`] over chromiumoxide; tests
//! inject a scripted fake.

use crate::step::{Action, WaitCondition};
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Classified driver failure. The failure detector consumes these, so the
/// variants deliberately mirror its heuristics.
#[derive(Debug, Clone, Error)]
pub enum DriverError {
    /// A bounded wait elapsed before the condition held.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The target element was absent after the wait window.
    #[error("no element matched selector '{0}'")]
    ElementAbsent(String),

    /// Navigation or network-level failure (connection reset, DNS).
    #[error("navigation failed: {0}")]
    Navigation(String),

    /// Anything else the engine raised while executing the action.
    #[error("driver error: {0}")]
    Other(String),
}

/// Cheap snapshot of the current page, used for challenge detection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageProbe {
    pub url: String,
    pub title: String,
}

/// Opaque handle to a located element.
#[derive(Debug, Clone, PartialEq)]
pub struct ElementRef {
    pub selector: String,
}

/// Capability set the executor drives the browser through.
///
/// Every call is bounded by the caller: the executor wraps dispatches in
/// `tokio::time::timeout`, so implementations may block until complete.
#[async_trait]
pub trait Driver: Send + Sync {
    async fn navigate(&self, url: &str) -> Result<(), DriverError>;

    async fn locate(&self, selector: &str) -> Result<ElementRef, DriverError>;

    /// Act on a previously located element. `ReadText` returns the text
    /// content; other actions return `None`.
    async fn act(&self, element: &ElementRef, action: &Action)
        -> Result<Option<String>, DriverError>;

    async fn wait(&self, condition: &WaitCondition, timeout: Duration)
        -> Result<(), DriverError>;

    /// Capture a PNG of the current page.
    async fn screenshot(&self) -> Result<Vec<u8>, DriverError>;

    /// Current URL and title, for failure classification.
    async fn probe(&self) -> Result<PageProbe, DriverError>;

    /// Evaluate a script in the page, returning its JSON result.
    async fn run_script(&self, script: &str) -> Result<String, DriverError>;
}

/// Creates a driver bound to a freshly provisioned instance.
#[async_trait]
pub trait DriverFactory: Send + Sync {
    async fn connect(&self, cdp_url: &str) -> Result<std::sync::Arc<dyn Driver>, DriverError>;
}

pub mod cdp {
    //! Chromium DevTools Protocol driver.

    use super::*;
    use chromiumoxide::{Browser, Page};
    use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
    use futures_util::StreamExt;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    const POLL_INTERVAL: Duration = Duration::from_millis(250);

    /// Driver over a remote Chromium instance via CDP.
    pub struct CdpDriver {
        page: Page,
        _browser: Mutex<Browser>,
        _handler_handle: tokio::task::JoinHandle<()>,
    }

    impl CdpDriver {
        /// Connect to a browser exposing a CDP endpoint and take over its
        /// first page (or open one).
        pub async fn connect(cdp_url: &str) -> Result<Self, DriverError> {
            let (browser, mut handler) = Browser::connect(cdp_url)
                .await
                .map_err(|e| DriverError::Other(format!("CDP connect failed: {}", e)))?;

            // The handler stream must be drained for the browser to function.
            let handler_handle = tokio::spawn(async move {
                while let Some(_event) = handler.next().await {}
            });

            let pages = browser
                .pages()
                .await
                .map_err(|e| DriverError::Other(format!("listing pages failed: {}", e)))?;
            let page = match pages.into_iter().next() {
                Some(page) => page,
                None => browser
                    .new_page("about:blank")
                    .await
                    .map_err(|e| DriverError::Other(format!("opening page failed: {}", e)))?,
            };

            Ok(Self {
                page,
                _browser: Mutex::new(browser),
                _handler_handle: handler_handle,
            })
        }

        fn classify_cdp(err: chromiumoxide::error::CdpError) -> DriverError {
            let text = err.to_string();
            let lower = text.to_lowercase();
            if lower.contains("timeout") || lower.contains("timed out") {
                DriverError::Timeout(Duration::ZERO)
            } else if lower.contains("net::")
                || lower.contains("dns")
                || lower.contains("connection")
            {
                DriverError::Navigation(text)
            } else {
                DriverError::Other(text)
            }
        }
    }

    #[async_trait]
    impl Driver for CdpDriver {
        async fn navigate(&self, url: &str) -> Result<(), DriverError> {
            self.page
                .goto(url)
                .await
                .map_err(Self::classify_cdp)?;
            self.page
                .wait_for_navigation()
                .await
                .map_err(Self::classify_cdp)?;
            Ok(())
        }

        async fn locate(&self, selector: &str) -> Result<ElementRef, DriverError> {
            self.page
                .find_element(selector)
                .await
                .map_err(|_| DriverError::ElementAbsent(selector.to_string()))?;
            Ok(ElementRef {
                selector: selector.to_string(),
            })
        }

        async fn act(
            &self,
            element: &ElementRef,
            action: &Action,
        ) -> Result<Option<String>, DriverError> {
            // Re-find at act time; the handle may be stale after settling.
            let el = self
                .page
                .find_element(&element.selector)
                .await
                .map_err(|_| DriverError::ElementAbsent(element.selector.clone()))?;

            match action {
                Action::Click => {
                    el.click().await.map_err(Self::classify_cdp)?;
                    Ok(None)
                }
                Action::Fill { text } => {
                    el.click().await.map_err(Self::classify_cdp)?;
                    el.type_str(text).await.map_err(Self::classify_cdp)?;
                    Ok(None)
                }
                Action::ReadText => {
                    let text: Option<String> = el
                        .inner_text()
                        .await
                        .map_err(Self::classify_cdp)?;
                    Ok(Some(text.unwrap_or_default()))
                }
            }
        }

        async fn wait(
            &self,
            condition: &WaitCondition,
            timeout: Duration,
        ) -> Result<(), DriverError> {
            match condition {
                WaitCondition::Fixed => {
                    tokio::time::sleep(timeout).await;
                    Ok(())
                }
                WaitCondition::SelectorVisible { selector } => {
                    let deadline = tokio::time::Instant::now() + timeout;
                    loop {
                        if self.page.find_element(selector.as_str()).await.is_ok() {
                            return Ok(());
                        }
                        if tokio::time::Instant::now() >= deadline {
                            return Err(DriverError::Timeout(timeout));
                        }
                        tokio::time::sleep(POLL_INTERVAL).await;
                    }
                }
                WaitCondition::UrlContains { fragment } => {
                    let deadline = tokio::time::Instant::now() + timeout;
                    loop {
                        let probe = self.probe().await?;
                        if probe.url.contains(fragment.as_str()) {
                            return Ok(());
                        }
                        if tokio::time::Instant::now() >= deadline {
                            return Err(DriverError::Timeout(timeout));
                        }
                        tokio::time::sleep(POLL_INTERVAL).await;
                    }
                }
            }
        }

        async fn screenshot(&self) -> Result<Vec<u8>, DriverError> {
            self.page
                .screenshot(
                    chromiumoxide::page::ScreenshotParams::builder()
                        .format(CaptureScreenshotFormat::Png)
                        .build(),
                )
                .await
                .map_err(Self::classify_cdp)
        }

        async fn probe(&self) -> Result<PageProbe, DriverError> {
            let url: String = self
                .page
                .evaluate("window.location.href")
                .await
                .map_err(Self::classify_cdp)?
                .into_value()
                .unwrap_or_default();
            let title: String = self
                .page
                .evaluate("document.title")
                .await
                .map_err(Self::classify_cdp)?
                .into_value()
                .unwrap_or_default();
            Ok(PageProbe { url, title })
        }

        async fn run_script(&self, script: &str) -> Result<String, DriverError> {
            let value: serde_json::Value = self
                .page
                .evaluate(script)
                .await
                .map_err(Self::classify_cdp)?
                .into_value()
                .unwrap_or(serde_json::Value::Null);
            Ok(value.to_string())
        }
    }

    /// Factory producing [`CdpDriver`]s for freshly provisioned instances.
    pub struct CdpDriverFactory;

    #[async_trait]
    impl DriverFactory for CdpDriverFactory {
        async fn connect(&self, cdp_url: &str) -> Result<Arc<dyn Driver>, DriverError> {
            Ok(Arc::new(CdpDriver::connect(cdp_url).await?))
        }
    }
}

pub use cdp::{CdpDriver, CdpDriverFactory};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn driver_error_messages_name_the_cause() {
        let err = DriverError::ElementAbsent("#login".into());
        assert!(err.to_string().contains("#login"));

        let err = DriverError::Navigation("net::ERR_CONNECTION_RESET".into());
        assert!(err.to_string().contains("ERR_CONNECTION_RESET"));
    }
}
