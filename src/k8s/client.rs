/// Kubernetes operations client
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use crate::error::Result;
use crate::utils::command::{check_tool_installed, CommandBuilder, Executor};

/// Kubernetes client for kubectl operations
#[derive(Clone)]
pub struct KubectlClient {
    executor: Arc<dyn Executor>,
    kubeconfig: PathBuf,
}

impl KubectlClient {
    /// Create a kubectl client operating on the given kubeconfig file
    pub fn new(executor: Arc<dyn Executor>, kubeconfig: PathBuf) -> Self {
        Self {
            executor,
            kubeconfig,
        }
    }

    /// Check if kubectl is installed
    pub async fn check_installed(&self) -> Result<()> {
        check_tool_installed(
            self.executor.as_ref(),
            "kubectl",
            &["version", "--client"],
            "https://kubernetes.io/docs/tasks/tools/",
        )
        .await
    }

    /// Make `name` the active context
    pub async fn use_context(&self, name: &str) -> Result<()> {
        info!("Switching to context {}", name);
        CommandBuilder::new("kubectl")
            .args(["config", "use-context", name])
            .kubeconfig(&self.kubeconfig)
            .context(format!("Switching to context {}", name))
            .remediation(format!(
                "Switch manually with:\n\n  kubectl config use-context {}",
                name
            ))
            .run_silent(self.executor.as_ref())
            .await
    }

    /// Delete a namespace without waiting for its finalizers
    pub async fn delete_namespace(&self, context: &str, namespace: &str) -> Result<()> {
        info!("Deleting namespace {} in {}", namespace, context);
        CommandBuilder::new("kubectl")
            .args(["--context", context, "delete", "ns", namespace, "--wait=false"])
            .kubeconfig(&self.kubeconfig)
            .context(format!("Deleting namespace {}", namespace))
            .remediation(format!(
                "Please, delete it manually:\n\n  kubectl --context {} delete ns {}",
                context, namespace
            ))
            .run_silent(self.executor.as_ref())
            .await
    }
}
