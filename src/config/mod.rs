/// Configuration management for fieldctl
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Settings file read when `--config` is not given
pub const DEFAULT_SETTINGS_FILE: &str = "config.yaml";

/// Main fieldctl settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Name of the Lima VM, also the kubeconfig context of the main cluster
    #[serde(default = "default_vm_name")]
    pub vm_name: String,

    /// Host folder mounted into the VM to persist images across recreations
    #[serde(default = "default_persisted_folder")]
    pub persisted_folder: PathBuf,

    /// Kubeconfig used when neither --kubeconfig nor $KUBECONFIG is set
    #[serde(default = "default_kubeconfig")]
    pub default_kubeconfig: PathBuf,

    /// Host port forwarded to the k3s API server (guest port 6443)
    #[serde(default = "default_port_forward")]
    pub port_forward: u16,

    /// Seconds to wait for an asynchronous deletion to complete
    #[serde(default = "default_delete_timeout")]
    pub delete_timeout_secs: u64,

    /// VM sizing and provisioning
    #[serde(default)]
    pub vm: VmSettings,

    /// Virtual cluster Helm values
    #[serde(default)]
    pub vcluster: VclusterSettings,
}

/// Lima VM configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmSettings {
    #[serde(default = "default_cpus")]
    pub cpus: u32,

    /// Disk size in GiB
    #[serde(default = "default_disk")]
    pub disk_gib: u32,

    /// Memory size in GiB
    #[serde(default = "default_memory")]
    pub memory_gib: u32,

    /// Lima template to use instead of the built-in one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template: Option<PathBuf>,

    /// Folder copied into the persisted folder before the VM is created
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provision_dir: Option<PathBuf>,
}

/// vcluster configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VclusterSettings {
    /// k3s image backing each virtual cluster
    #[serde(default = "default_k3s_image")]
    pub image: String,

    /// Extra arguments for the vcluster syncer
    #[serde(default = "default_syncer_args")]
    pub syncer_args: Vec<String>,
}

fn home() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

fn default_vm_name() -> String {
    "field-main".to_string()
}

fn default_persisted_folder() -> PathBuf {
    home().join(".field")
}

fn default_kubeconfig() -> PathBuf {
    home().join(".kube").join("config")
}

fn default_port_forward() -> u16 {
    11443
}

fn default_delete_timeout() -> u64 {
    20
}

fn default_cpus() -> u32 {
    4
}

fn default_disk() -> u32 {
    50
}

fn default_memory() -> u32 {
    8
}

fn default_k3s_image() -> String {
    "rancher/k3s:v1.22.5-k3s1".to_string()
}

fn default_syncer_args() -> Vec<String> {
    vec!["--fake-nodes=false".to_string(), "--sync-all-nodes".to_string()]
}

impl Default for VmSettings {
    fn default() -> Self {
        Self {
            cpus: default_cpus(),
            disk_gib: default_disk(),
            memory_gib: default_memory(),
            template: None,
            provision_dir: None,
        }
    }
}

impl Default for VclusterSettings {
    fn default() -> Self {
        Self {
            image: default_k3s_image(),
            syncer_args: default_syncer_args(),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            vm_name: default_vm_name(),
            persisted_folder: default_persisted_folder(),
            default_kubeconfig: default_kubeconfig(),
            port_forward: default_port_forward(),
            delete_timeout_secs: default_delete_timeout(),
            vm: VmSettings::default(),
            vcluster: VclusterSettings::default(),
        }
    }
}

/// Expand a leading `~` to the home directory
pub fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => home().join(rest),
        Err(_) => path.to_path_buf(),
    }
}

impl Settings {
    /// Where settings live by default: `~/.field/config.yaml`
    pub fn default_path() -> PathBuf {
        default_persisted_folder().join(DEFAULT_SETTINGS_FILE)
    }

    /// Load settings from an explicit file, else the default file if present, else defaults
    pub fn load(explicit: Option<&Path>) -> anyhow::Result<Self> {
        let settings = match explicit {
            Some(path) => Self::from_file(path)
                .with_context(|| format!("Failed to load settings from {}", path.display()))?,
            None => {
                let path = Self::default_path();
                if path.exists() {
                    Self::from_file(&path).with_context(|| {
                        format!("Failed to load settings from {}", path.display())
                    })?
                } else {
                    debug!("No settings file at {}, using defaults", path.display());
                    Self::default()
                }
            }
        };
        settings.validate()?;
        Ok(settings)
    }

    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut settings: Settings = serde_yaml::from_str(&content)?;
        settings.expand_paths();
        Ok(settings)
    }

    fn expand_paths(&mut self) {
        self.persisted_folder = expand_home(&self.persisted_folder);
        self.default_kubeconfig = expand_home(&self.default_kubeconfig);
        self.vm.template = self.vm.template.as_deref().map(expand_home);
        self.vm.provision_dir = self.vm.provision_dir.as_deref().map(expand_home);
    }

    /// Validate the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.vm_name.is_empty() {
            anyhow::bail!("vm_name cannot be empty");
        }

        if self.port_forward == 0 {
            anyhow::bail!("port_forward must be a valid port");
        }

        if self.delete_timeout_secs == 0 {
            anyhow::bail!("delete_timeout_secs must be greater than zero");
        }

        if self.vm.cpus == 0 || self.vm.disk_gib == 0 || self.vm.memory_gib == 0 {
            anyhow::bail!("vm cpus, disk_gib and memory_gib must be greater than zero");
        }

        if self.vcluster.image.is_empty() {
            anyhow::bail!("vcluster image cannot be empty");
        }

        Ok(())
    }

    /// Generate an example configuration file
    pub fn example() -> Self {
        Self {
            persisted_folder: PathBuf::from("~/.field"),
            default_kubeconfig: PathBuf::from("~/.kube/config"),
            ..Self::default()
        }
    }
}
