/// Cluster lifecycle: create, connect and delete the main cluster and virtual clusters
pub mod main_cluster;
pub mod virtual_cluster;

pub use main_cluster::{MainClusterManager, VmCreateOptions};
pub use virtual_cluster::VirtualClusterManager;

use std::future::Future;
use tracing::{debug, info};

use crate::error::{ClusterError, ResourceKind, Result};
use crate::k8s::KubectlClient;
use crate::kubeconfig::{CredentialFragment, KubeconfigStore, MergeOutcome};
use crate::utils::polling::PollingConfig;

/// Seconds between two listings while waiting for a deletion
const DELETE_POLL_INTERVAL_SECS: u64 = 1;

/// Merge credentials printed by a cluster tool under `name` and make it the active context
pub(crate) async fn adopt_credentials(
    store: &KubeconfigStore,
    kubectl: &KubectlClient,
    raw_kubeconfig: &str,
    name: &str,
    server: Option<&str>,
) -> Result<MergeOutcome> {
    let mut fragment = CredentialFragment::parse(raw_kubeconfig)?;
    if let Some(server) = server {
        fragment.set_server(server);
    }
    debug!("Credentials for {} target {}", name, fragment.server());

    let outcome = store.merge_fragment(fragment, name)?;
    match &outcome {
        MergeOutcome::Created => {
            info!("Created {} with context {}", store.path().display(), name)
        }
        MergeOutcome::Merged { replaced, backup } => {
            let action = if *replaced { "Replaced" } else { "Added" };
            info!("{} context {} in {}", action, name, store.path().display());
            if let Some(backup) = backup {
                info!("Previous kubeconfig saved as {}", backup.display());
            }
        }
    }

    kubectl.use_context(name).await?;
    Ok(outcome)
}

/// Poll `exists` every second until it reports false or `timeout_secs` elapse
pub(crate) async fn wait_until_deleted<F, Fut>(
    kind: ResourceKind,
    name: &str,
    timeout_secs: u64,
    remediation: String,
    exists: F,
) -> Result<()>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let exists = &exists;
    let gone = PollingConfig::new(
        timeout_secs,
        DELETE_POLL_INTERVAL_SECS,
        format!("Waiting for {} {} to be deleted", kind, name),
    )
    .poll_until(move || async move { Ok::<_, ClusterError>(!exists().await?) })
    .await?;

    if gone {
        Ok(())
    } else {
        Err(ClusterError::Timeout {
            kind,
            name: name.to_string(),
            timeout_secs,
            remediation,
        })
    }
}
