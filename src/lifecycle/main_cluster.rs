/// Main cluster lifecycle: a k3s server inside a Lima VM
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use super::{adopt_credentials, wait_until_deleted};
use crate::config::Settings;
use crate::error::{ClusterError, ResourceKind, Result};
use crate::k8s::KubectlClient;
use crate::kubeconfig::{KubeconfigStore, MergeOutcome};
use crate::lima::{LimaClient, VmTemplate};
use crate::utils::command::Executor;

/// Script in the persisted folder that installs registry caches once k3s is up
const DEPLOY_CACHES_SCRIPT: &str = "deploy-caches.sh";

/// Sizing and follow-up for `vm create`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmCreateOptions {
    pub cpus: u32,
    pub disk_gib: u32,
    pub memory_gib: u32,
    /// Merge the cluster credentials once the VM is up
    pub connect: bool,
}

impl VmCreateOptions {
    /// Sizing from the settings file, without connecting
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            cpus: settings.vm.cpus,
            disk_gib: settings.vm.disk_gib,
            memory_gib: settings.vm.memory_gib,
            connect: false,
        }
    }
}

/// Manages the Lima VM hosting the main cluster and its kubeconfig context
pub struct MainClusterManager {
    lima: LimaClient,
    kubectl: KubectlClient,
    store: KubeconfigStore,
    settings: Settings,
}

impl MainClusterManager {
    pub fn new(executor: Arc<dyn Executor>, store: KubeconfigStore, settings: Settings) -> Self {
        Self {
            lima: LimaClient::new(executor.clone()),
            kubectl: KubectlClient::new(executor, store.path().to_path_buf()),
            store,
            settings,
        }
    }

    fn vm_name(&self) -> &str {
        &self.settings.vm_name
    }

    pub async fn check_prerequisites(&self) -> Result<()> {
        self.lima.check_installed().await
    }

    pub async fn version(&self) -> Result<()> {
        self.lima.version().await
    }

    /// Create the VM from the template and, if asked, connect to it
    pub async fn create(&self, options: &VmCreateOptions) -> Result<Option<MergeOutcome>> {
        let name = self.vm_name();
        if self.lima.exists(name).await? {
            return Err(ClusterError::AlreadyExists {
                kind: ResourceKind::Vm,
                name: name.to_string(),
            });
        }

        self.prepare_persisted_folder()?;

        let workdir = tempfile::tempdir()?;
        // limactl names the VM after the template file
        let template_path = workdir.path().join(format!("{}.yaml", name));
        self.render_template(options, &template_path)
            .map_err(ClusterError::Template)?;

        self.lima.validate(&template_path).await?;
        info!("Creating the Lima VM with name: {}", name);
        self.lima.create(&template_path).await?;

        if self.settings.persisted_folder.join(DEPLOY_CACHES_SCRIPT).is_file() {
            info!("Installing cache registries");
            self.lima.run_persisted_script(name, DEPLOY_CACHES_SCRIPT).await?;
        } else {
            debug!(
                "No {} in {}, skipping cache registries",
                DEPLOY_CACHES_SCRIPT,
                self.settings.persisted_folder.display()
            );
        }

        if !options.connect {
            return Ok(None);
        }

        info!("Downloading the kubeconfig from the VM and merging it");
        self.adopt_vm_credentials()
            .await
            .map(Some)
            .map_err(|source| ClusterError::ConnectAfterCreate {
                name: name.to_string(),
                retry: "fieldctl vm connect".to_string(),
                source: Box::new(source),
            })
    }

    fn prepare_persisted_folder(&self) -> Result<()> {
        let folder = &self.settings.persisted_folder;
        info!("Persisted data will be kept in {}", folder.display());
        fs::create_dir_all(folder)?;

        if let Some(provision) = &self.settings.vm.provision_dir {
            info!("Copying {} into {}", provision.display(), folder.display());
            copy_dir_all(provision, folder)?;
        }
        Ok(())
    }

    fn render_template(&self, options: &VmCreateOptions, path: &Path) -> anyhow::Result<()> {
        let mut template = match &self.settings.vm.template {
            Some(custom) => VmTemplate::from_file(custom)?,
            None => VmTemplate::builtin()?,
        };
        template.set_resources(options.cpus, options.disk_gib, options.memory_gib);
        template.add_persisted_folder(&self.settings.persisted_folder);
        template.add_port_forward(self.settings.port_forward);
        template.write_to(path)
    }

    /// Merge the k3s credentials of the VM under the VM name and switch to it
    pub async fn connect(&self) -> Result<MergeOutcome> {
        self.kubectl.check_installed().await?;
        self.ensure_exists().await?;
        self.adopt_vm_credentials().await
    }

    async fn adopt_vm_credentials(&self) -> Result<MergeOutcome> {
        let raw = self.lima.read_k3s_kubeconfig(self.vm_name()).await?;
        let server = format!("https://127.0.0.1:{}", self.settings.port_forward);
        adopt_credentials(&self.store, &self.kubectl, &raw, self.vm_name(), Some(&server)).await
    }

    pub async fn start(&self) -> Result<()> {
        self.ensure_exists().await?;
        self.lima.start(self.vm_name()).await
    }

    pub async fn stop(&self) -> Result<()> {
        self.ensure_exists().await?;
        self.lima.stop(self.vm_name()).await
    }

    /// Command line that opens a shell in the VM
    pub async fn show_ssh(&self) -> Result<String> {
        self.ensure_exists().await?;
        self.lima.show_ssh(self.vm_name()).await
    }

    /// Remove the VM and forget its kubeconfig entries
    pub async fn remove(&self, timeout_secs: u64) -> Result<()> {
        let name = self.vm_name();
        self.ensure_exists().await?;

        info!("Removing Lima VM {}", name);
        self.lima.remove(name).await?;

        let lima = &self.lima;
        wait_until_deleted(
            ResourceKind::Vm,
            name,
            timeout_secs,
            format!("Check it with `limactl ls` and remove it with `limactl rm {} -f`", name),
            move || lima.exists(name),
        )
        .await?;

        self.store.evict(name)?;
        info!("VM {} deleted", name);
        Ok(())
    }

    async fn ensure_exists(&self) -> Result<()> {
        if self.lima.exists(self.vm_name()).await? {
            Ok(())
        } else {
            Err(ClusterError::NotFound {
                kind: ResourceKind::Vm,
                name: self.vm_name().to_string(),
            })
        }
    }
}

/// Recursively copy `src` into `dst`, overwriting files that already exist
fn copy_dir_all(src: &Path, dst: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_all(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
