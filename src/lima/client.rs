/// Lima VM operations client
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{ClusterError, Result};
use crate::utils::command::{check_tool_installed, parse_json_lines, CommandBuilder, Executor};

/// Where k3s writes its admin kubeconfig inside the VM
const K3S_KUBECONFIG: &str = "/etc/rancher/k3s/k3s.yaml";

/// One entry of `limactl ls --json`
#[derive(Debug, Clone, Deserialize)]
pub struct LimaInstance {
    pub name: String,
    #[serde(default)]
    pub status: String,
}

/// Lima client for VM operations
#[derive(Clone)]
pub struct LimaClient {
    executor: Arc<dyn Executor>,
}

impl LimaClient {
    /// Create a new Lima client
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        Self { executor }
    }

    /// Check if limactl is installed
    pub async fn check_installed(&self) -> Result<()> {
        check_tool_installed(
            self.executor.as_ref(),
            "limactl",
            &["--version"],
            "https://github.com/lima-vm/lima",
        )
        .await
    }

    /// Print the limactl version
    pub async fn version(&self) -> Result<()> {
        CommandBuilder::new("limactl")
            .arg("--version")
            .stream()
            .context("limactl --version")
            .run_silent(self.executor.as_ref())
            .await
    }

    /// List all Lima instances
    pub async fn list(&self) -> Result<Vec<LimaInstance>> {
        let stdout = CommandBuilder::new("limactl")
            .args(["ls", "--json"])
            .context("Listing Lima VMs")
            .run(self.executor.as_ref())
            .await?;

        parse_json_lines(&stdout).map_err(|e| ClusterError::UnexpectedOutput {
            tool: "limactl".to_string(),
            reason: format!("cannot parse `limactl ls --json`: {}", e),
        })
    }

    /// Check whether a VM with this name exists
    pub async fn exists(&self, name: &str) -> Result<bool> {
        let found = self.list().await?.into_iter().find(|vm| vm.name == name);
        if let Some(vm) = &found {
            debug!("VM {} is {}", vm.name, vm.status);
        }
        Ok(found.is_some())
    }

    /// Validate a VM template file
    pub async fn validate(&self, template: &Path) -> Result<()> {
        CommandBuilder::new("limactl")
            .arg("validate")
            .arg(template)
            .context("Validating the Lima VM template")
            .run_silent(self.executor.as_ref())
            .await
    }

    /// Create and boot a VM from a template; the VM takes the file's stem as name
    pub async fn create(&self, template: &Path) -> Result<()> {
        info!("Creating Lima VM from {}", template.display());
        CommandBuilder::new("limactl")
            .args(["start", "--tty=false"])
            .arg(template)
            .stream()
            .context("Creating the Lima VM")
            .remediation("Inspect the VM with `limactl ls` and remove it with `fieldctl vm rm` before retrying")
            .run_silent(self.executor.as_ref())
            .await
    }

    /// Start an existing VM
    pub async fn start(&self, name: &str) -> Result<()> {
        CommandBuilder::new("limactl")
            .args(["start", "--tty=false", name])
            .stream()
            .context(format!("Starting Lima VM {}", name))
            .run_silent(self.executor.as_ref())
            .await
    }

    /// Stop a running VM
    pub async fn stop(&self, name: &str) -> Result<()> {
        CommandBuilder::new("limactl")
            .args(["stop", name])
            .stream()
            .context(format!("Stopping Lima VM {}", name))
            .run_silent(self.executor.as_ref())
            .await
    }

    /// Remove a VM, stopping it first if needed
    pub async fn remove(&self, name: &str) -> Result<()> {
        CommandBuilder::new("limactl")
            .args(["rm", name, "-f"])
            .context(format!("Removing Lima VM {}", name))
            .run_silent(self.executor.as_ref())
            .await
    }

    /// The ssh command line to reach the VM
    pub async fn show_ssh(&self, name: &str) -> Result<String> {
        let stdout = CommandBuilder::new("limactl")
            .args(["show-ssh", name])
            .context(format!("Showing ssh command for {}", name))
            .run(self.executor.as_ref())
            .await?;
        Ok(stdout.trim().to_string())
    }

    /// Read the k3s admin kubeconfig from inside the VM
    pub async fn read_k3s_kubeconfig(&self, name: &str) -> Result<String> {
        CommandBuilder::new("limactl")
            .args(["shell", "--workdir=/", name, "sudo", "cat", K3S_KUBECONFIG])
            .context("Reading the k3s kubeconfig from the VM")
            .remediation(format!(
                "Check that k3s is running: limactl shell {} sudo systemctl status k3s",
                name
            ))
            .run(self.executor.as_ref())
            .await
    }

    /// Run a script from the persisted folder inside the VM
    pub async fn run_persisted_script(&self, name: &str, script: &str) -> Result<()> {
        let command = format!("cd ${}; ./{}", super::template::PERSISTED_HOME_VAR, script);
        CommandBuilder::new("limactl")
            .args(["shell", name, "sh", "-c", command.as_str()])
            .context(format!("Running {} in the VM", script))
            .run_silent(self.executor.as_ref())
            .await
    }
}
