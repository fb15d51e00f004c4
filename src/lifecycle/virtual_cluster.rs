/// Virtual cluster lifecycle on top of a main cluster
use serde::Serialize;
use std::io::Write;
use std::sync::Arc;
use tracing::{info, warn};

use super::{adopt_credentials, wait_until_deleted};
use crate::config::VclusterSettings;
use crate::error::{ClusterError, ResourceKind, Result, StoreError};
use crate::k8s::KubectlClient;
use crate::kubeconfig::{KubeconfigStore, MergeOutcome};
use crate::utils::command::Executor;
use crate::vcluster::VclusterClient;

/// Helm values handed to `vcluster create`
#[derive(Debug, Serialize)]
struct HelmValues<'a> {
    rbac: RbacValues,
    vcluster: ImageValues<'a>,
    syncer: SyncerValues<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RbacValues {
    cluster_role: ClusterRoleValues,
}

#[derive(Debug, Serialize)]
struct ClusterRoleValues {
    create: bool,
}

#[derive(Debug, Serialize)]
struct ImageValues<'a> {
    image: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SyncerValues<'a> {
    extra_args: &'a [String],
}

impl<'a> HelmValues<'a> {
    fn from_settings(settings: &'a VclusterSettings) -> Self {
        Self {
            rbac: RbacValues {
                cluster_role: ClusterRoleValues { create: true },
            },
            vcluster: ImageValues {
                image: &settings.image,
            },
            syncer: SyncerValues {
                extra_args: &settings.syncer_args,
            },
        }
    }
}

/// Creates, connects and deletes virtual clusters living in a main cluster context
pub struct VirtualClusterManager {
    vcluster: VclusterClient,
    kubectl: KubectlClient,
    store: KubeconfigStore,
    main_context: String,
    settings: VclusterSettings,
}

impl VirtualClusterManager {
    pub fn new(
        executor: Arc<dyn Executor>,
        store: KubeconfigStore,
        main_context: String,
        settings: VclusterSettings,
    ) -> Self {
        let kubeconfig = store.path().to_path_buf();
        Self {
            vcluster: VclusterClient::new(executor.clone(), main_context.clone(), kubeconfig.clone()),
            kubectl: KubectlClient::new(executor, kubeconfig),
            store,
            main_context,
            settings,
        }
    }

    pub fn main_context(&self) -> &str {
        &self.main_context
    }

    /// Verify vcluster and kubectl are available
    pub async fn check_prerequisites(&self) -> Result<()> {
        self.vcluster.check_installed().await?;
        self.kubectl.check_installed().await
    }

    /// Print the virtual clusters of the main cluster
    pub async fn list(&self) -> Result<()> {
        self.vcluster.print_list().await
    }

    pub async fn version(&self) -> Result<()> {
        self.vcluster.version().await
    }

    /// Create a virtual cluster and switch the kubeconfig to it
    pub async fn create(&self, name: &str) -> Result<MergeOutcome> {
        info!("Creating virtual cluster {} in {}", name, self.main_context);

        let values = self.write_values()?;
        self.vcluster.create(name, values.path()).await?;
        info!("Virtual cluster {} created", name);

        self.connect_created(name)
            .await
            .map_err(|source| ClusterError::ConnectAfterCreate {
                name: name.to_string(),
                retry: format!("fieldctl virtual connect --name {}", name),
                source: Box::new(source),
            })
    }

    async fn connect_created(&self, name: &str) -> Result<MergeOutcome> {
        let raw = self.vcluster.print_kubeconfig(name).await?;
        adopt_credentials(&self.store, &self.kubectl, &raw, name, None).await
    }

    fn write_values(&self) -> Result<tempfile::NamedTempFile> {
        let yaml = serde_yaml::to_string(&HelmValues::from_settings(&self.settings))
            .map_err(StoreError::Serialize)?;
        let mut file = tempfile::Builder::new()
            .prefix("vcluster-values-")
            .suffix(".yaml")
            .tempfile()?;
        file.write_all(yaml.as_bytes())?;
        file.flush()?;
        Ok(file)
    }

    /// Merge the credentials of an existing virtual cluster and switch to it
    pub async fn connect(&self, name: &str) -> Result<MergeOutcome> {
        self.ensure_exists(name).await?;
        info!("Connecting to virtual cluster {}", name);
        self.connect_created(name).await
    }

    /// Delete a virtual cluster, its namespace and its kubeconfig entries
    pub async fn delete(&self, name: &str, timeout_secs: u64) -> Result<()> {
        self.ensure_exists(name).await?;

        info!("Deleting virtual cluster {}", name);
        self.vcluster.delete(name).await?;

        let vcluster = &self.vcluster;
        wait_until_deleted(
            ResourceKind::VirtualCluster,
            name,
            timeout_secs,
            format!(
                "Please, fix manually by deleting the namespace {} directly in the main cluster",
                name
            ),
            move || vcluster.exists(name),
        )
        .await?;

        self.kubectl
            .delete_namespace(&self.main_context, name)
            .await?;

        if !self.store.evict(name)? {
            warn!(
                "No kubeconfig entries named {} in {}",
                name,
                self.store.path().display()
            );
        }

        self.kubectl.use_context(&self.main_context).await?;
        info!("Virtual cluster {} deleted", name);
        Ok(())
    }

    async fn ensure_exists(&self, name: &str) -> Result<()> {
        if self.vcluster.exists(name).await? {
            Ok(())
        } else {
            Err(ClusterError::NotFound {
                kind: ResourceKind::VirtualCluster,
                name: name.to_string(),
            })
        }
    }
}
