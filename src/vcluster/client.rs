/// vcluster operations client
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use crate::error::{ClusterError, Result};
use crate::utils::command::{check_tool_installed, CommandBuilder, Executor};

/// One entry of `vcluster list --output json`
#[derive(Debug, Clone, Deserialize)]
pub struct VirtualClusterInfo {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Namespace", default)]
    pub namespace: String,
    #[serde(rename = "Status", default)]
    pub status: String,
}

/// vcluster client bound to a main cluster context
#[derive(Clone)]
pub struct VclusterClient {
    executor: Arc<dyn Executor>,
    main_context: String,
    kubeconfig: PathBuf,
}

impl VclusterClient {
    /// Create a new vcluster client operating against `main_context`
    pub fn new(executor: Arc<dyn Executor>, main_context: String, kubeconfig: PathBuf) -> Self {
        Self {
            executor,
            main_context,
            kubeconfig,
        }
    }

    /// Check if vcluster is installed
    pub async fn check_installed(&self) -> Result<()> {
        check_tool_installed(
            self.executor.as_ref(),
            "vcluster",
            &["--version"],
            "https://www.vcluster.com/docs/getting-started/setup",
        )
        .await
    }

    fn command(&self) -> CommandBuilder {
        CommandBuilder::new("vcluster")
            .args(["--context", self.main_context.as_str()])
            .kubeconfig(&self.kubeconfig)
    }

    /// Print the vcluster version
    pub async fn version(&self) -> Result<()> {
        CommandBuilder::new("vcluster")
            .arg("--version")
            .stream()
            .context("vcluster --version")
            .run_silent(self.executor.as_ref())
            .await
    }

    /// Print the virtual clusters of the main cluster as vcluster formats them
    pub async fn print_list(&self) -> Result<()> {
        self.command()
            .arg("list")
            .stream()
            .context("Listing virtual clusters")
            .run_silent(self.executor.as_ref())
            .await
    }

    /// List the virtual clusters installed in the main cluster
    pub async fn list(&self) -> Result<Vec<VirtualClusterInfo>> {
        let stdout = self
            .command()
            .args(["list", "--output", "json"])
            .context("Listing virtual clusters")
            .run(self.executor.as_ref())
            .await?;

        let trimmed = stdout.trim();
        if trimmed.is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str::<Option<Vec<VirtualClusterInfo>>>(trimmed)
            .map(Option::unwrap_or_default)
            .map_err(|e| ClusterError::UnexpectedOutput {
                tool: "vcluster".to_string(),
                reason: format!("cannot parse `vcluster list --output json`: {}", e),
            })
    }

    /// Check whether a virtual cluster with this name exists
    pub async fn exists(&self, name: &str) -> Result<bool> {
        debug!("Checking if virtual cluster {} exists", name);
        let found = self.list().await?.into_iter().find(|vc| vc.name == name);
        if let Some(vc) = &found {
            debug!(
                "Virtual cluster {} in namespace {} is {}",
                vc.name, vc.namespace, vc.status
            );
        }
        Ok(found.is_some())
    }

    /// Create a virtual cluster in namespace `name`
    pub async fn create(&self, name: &str, values_file: &Path) -> Result<()> {
        self.command()
            .args(["create", name, "-n", name, "--expose", "-f"])
            .arg(values_file)
            .context(format!("Creating virtual cluster {}", name))
            .remediation(format!(
                "If it already exists, try:\n\n  fieldctl virtual connect --name {}",
                name
            ))
            .run_silent(self.executor.as_ref())
            .await
    }

    /// Print the virtual cluster's kubeconfig without touching any file
    pub async fn print_kubeconfig(&self, name: &str) -> Result<String> {
        self.command()
            .args(["connect", name, "-n", name, "--print", "--silent"])
            .context(format!("Retrieving the kubeconfig of {}", name))
            .remediation(format!(
                "Check the status of the vcluster pod in namespace {}. Or try:\n\n  fieldctl virtual connect --name {}",
                name, name
            ))
            .run(self.executor.as_ref())
            .await
    }

    /// Delete a virtual cluster; removal completes asynchronously
    pub async fn delete(&self, name: &str) -> Result<()> {
        self.command()
            .args(["delete", name, "-n", name])
            .context(format!("Deleting virtual cluster {}", name))
            .run_silent(self.executor.as_ref())
            .await
    }
}
