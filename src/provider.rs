//! Provisioning provider boundary.
//!
//! [`SandboxProvider`] is the seam over whatever actually creates the
//! disposable browser environments. The shipped implementation shells out
//! to the docker CLI and runs one browser container per instance; tests
//! use an in-memory fake. Destruction is idempotent by contract: tearing
//! down an instance that is already gone must succeed.

use crate::error::{Error, Result};
use crate::session::InstanceId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, warn};

/// Endpoints of a freshly provisioned instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceInfo {
    pub id: InstanceId,
    /// CDP websocket or HTTP endpoint the driver connects to.
    pub cdp_url: String,
}

/// Creates and destroys sandbox instances.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    /// Provision a new instance and return its endpoints.
    async fn create_instance(&self) -> Result<InstanceInfo>;

    /// Tear down an instance. Succeeds if the instance is already gone.
    async fn destroy_instance(&self, id: &str) -> Result<()>;

    /// Cheap liveness ping, used before reusing a registry entry and as
    /// the resume guard.
    async fn is_alive(&self, id: &str) -> bool;
}

/// Docker provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerProviderConfig {
    /// Image hosting the browser (must expose a CDP port).
    #[serde(default = "default_image")]
    pub image: String,
    /// CDP port inside the container.
    #[serde(default = "default_cdp_port")]
    pub cdp_port: u16,
    /// Memory limit in MB (optional).
    #[serde(default)]
    pub memory_limit_mb: Option<u64>,
    /// CPU limit (e.g. 1.5 = 1.5 CPUs).
    #[serde(default)]
    pub cpu_limit: Option<f64>,
}

fn default_image() -> String {
    "chromedp/headless-shell:latest".to_string()
}

fn default_cdp_port() -> u16 {
    9222
}

impl Default for DockerProviderConfig {
    fn default() -> Self {
        Self {
            image: default_image(),
            cdp_port: default_cdp_port(),
            memory_limit_mb: None,
            cpu_limit: None,
        }
    }
}

/// Provisions one browser container per instance through the docker CLI.
#[derive(Debug, Clone)]
pub struct DockerProvider {
    config: DockerProviderConfig,
}

impl DockerProvider {
    pub fn new(config: DockerProviderConfig) -> Self {
        Self { config }
    }

    async fn docker(args: &[&str]) -> Result<std::process::Output> {
        debug!(?args, "docker invocation");
        let output = Command::new("docker").args(args).output().await?;
        Ok(output)
    }
}

#[async_trait]
impl SandboxProvider for DockerProvider {
    async fn create_instance(&self) -> Result<InstanceInfo> {
        let mut args: Vec<String> = vec![
            "run".into(),
            "--detach".into(),
            "--init".into(),
            "--publish-all".into(),
        ];

        if let Some(mb) = self.config.memory_limit_mb.filter(|mb| *mb > 0) {
            args.push("--memory".into());
            args.push(format!("{mb}m"));
        }
        if let Some(cpus) = self.config.cpu_limit.filter(|c| *c > 0.0) {
            args.push("--cpus".into());
            args.push(cpus.to_string());
        }

        args.push(self.config.image.trim().to_string());

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = Self::docker(&arg_refs).await?;
        if !output.status.success() {
            return Err(Error::Provision(format!(
                "docker run failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if id.is_empty() {
            return Err(Error::Provision("docker run returned no container id".into()));
        }

        // Resolve the host port docker mapped the CDP port to.
        let spec = format!("{}/tcp", self.config.cdp_port);
        let port_output = Self::docker(&["port", &id, &spec]).await?;
        if !port_output.status.success() {
            // Leave no half-provisioned instance behind.
            let _ = Self::docker(&["rm", "-f", &id]).await;
            return Err(Error::Provision(format!(
                "docker port lookup failed for {}: {}",
                id,
                String::from_utf8_lossy(&port_output.stderr).trim()
            )));
        }
        let mapping = String::from_utf8_lossy(&port_output.stdout);
        let host_port = mapping
            .lines()
            .next()
            .and_then(|line| line.rsplit(':').next())
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .ok_or_else(|| Error::Provision(format!("unparseable port mapping '{}'", mapping)))?
            .to_string();

        Ok(InstanceInfo {
            cdp_url: format!("http://127.0.0.1:{}", host_port),
            id,
        })
    }

    async fn destroy_instance(&self, id: &str) -> Result<()> {
        let output = Self::docker(&["rm", "-f", id]).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            // An instance that is already gone counts as destroyed.
            if stderr.contains("No such container") {
                debug!(instance = %id, "container already gone");
                return Ok(());
            }
            warn!(instance = %id, error = %stderr.trim(), "docker rm failed");
            return Err(Error::Provision(format!(
                "docker rm failed for {}: {}",
                id,
                stderr.trim()
            )));
        }
        Ok(())
    }

    async fn is_alive(&self, id: &str) -> bool {
        match Self::docker(&["inspect", "--format", "{{.State.Running}}", id]).await {
            Ok(output) => {
                output.status.success()
                    && String::from_utf8_lossy(&output.stdout).trim() == "true"
            }
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_targets_cdp() {
        let config = DockerProviderConfig::default();
        assert_eq!(config.cdp_port, 9222);
        assert!(config.image.contains("headless-shell"));
    }
}
