/// Lima VM template editing
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;

use crate::utils::yaml::null_as_empty;

/// Environment variable inside the VM naming the persisted folder
pub const PERSISTED_HOME_VAR: &str = "FIELDCTL_HOME";

/// Port the k3s API server listens on inside the VM
pub const API_SERVER_GUEST_PORT: u16 = 6443;

const BUILTIN_TEMPLATE: &str = include_str!("../../provision/lima-vm.yaml.template");

type Extra = BTreeMap<String, serde_yaml::Value>;

/// The parts of a Lima VM template fieldctl edits; the rest is kept as is.
///
/// Lima's own templates leave most keys `null` and describe forwards with
/// ranges or sockets, so everything fieldctl overwrites or appends to is lenient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmTemplate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpus: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk: Option<String>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub mounts: Vec<Mount>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub port_forwards: Vec<PortForward>,
    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mount {
    pub location: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub writable: Option<bool>,
    #[serde(flatten)]
    pub extra: Extra,
}

/// One `portForwards` rule. Rules written with `guestPortRange` or
/// `guestSocket` keep those keys in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortForward {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guest_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_port: Option<u16>,
    #[serde(flatten)]
    pub extra: Extra,
}

impl VmTemplate {
    /// The template shipped with fieldctl
    pub fn builtin() -> Result<Self> {
        Self::from_yaml(BUILTIN_TEMPLATE).context("Built-in Lima template is invalid")
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read Lima template {}", path.display()))?;
        Self::from_yaml(&content)
            .with_context(|| format!("Failed to parse Lima template {}", path.display()))
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Size the VM. Disk and memory are in GiB.
    pub fn set_resources(&mut self, cpus: u32, disk_gib: u32, memory_gib: u32) {
        info!(
            "Allocating cpus: {}, disk: {}GiB, memory: {}GiB",
            cpus, disk_gib, memory_gib
        );
        self.cpus = Some(cpus);
        self.disk = Some(format!("{}Gib", disk_gib));
        self.memory = Some(format!("{}Gib", memory_gib));
    }

    /// Mount the persisted folder writable and expose it to provisioning scripts
    pub fn add_persisted_folder(&mut self, folder: &Path) {
        let location = folder.display().to_string();
        info!("Adding persisted volume {}", location);
        self.mounts.push(Mount {
            location: location.clone(),
            writable: Some(true),
            extra: Extra::new(),
        });
        self.env.insert(PERSISTED_HOME_VAR.to_string(), location);
    }

    /// Forward the API server to `host_port` on the host
    pub fn add_port_forward(&mut self, host_port: u16) {
        info!(
            "Forwarding guest port {} to host port {}",
            API_SERVER_GUEST_PORT, host_port
        );
        self.port_forwards.push(PortForward {
            guest_port: Some(API_SERVER_GUEST_PORT),
            host_port: Some(host_port),
            extra: Extra::new(),
        });
    }

    pub fn write_to(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_yaml()?)
            .with_context(|| format!("Failed to write Lima template {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_template_parses() {
        let template = VmTemplate::builtin().unwrap();
        assert!(template.mounts.is_empty());
        assert!(template.port_forwards.is_empty());
        assert!(template.extra.contains_key("images"));
        assert!(template.extra.contains_key("provision"));
    }

    #[test]
    fn test_edits() {
        let mut template = VmTemplate::builtin().unwrap();
        template.set_resources(6, 80, 12);
        template.add_persisted_folder(Path::new("/home/me/.field"));
        template.add_port_forward(11443);

        let yaml = template.to_yaml().unwrap();
        let reloaded = VmTemplate::from_yaml(&yaml).unwrap();
        assert_eq!(reloaded, template);

        assert_eq!(reloaded.cpus, Some(6));
        assert_eq!(reloaded.disk.as_deref(), Some("80Gib"));
        assert_eq!(reloaded.memory.as_deref(), Some("12Gib"));
        assert_eq!(reloaded.mounts.len(), 1);
        assert_eq!(reloaded.mounts[0].location, "/home/me/.field");
        assert_eq!(reloaded.mounts[0].writable, Some(true));
        assert_eq!(
            reloaded.env.get(PERSISTED_HOME_VAR).map(String::as_str),
            Some("/home/me/.field")
        );
        assert_eq!(reloaded.port_forwards[0].guest_port, Some(6443));
        assert_eq!(reloaded.port_forwards[0].host_port, Some(11443));
        assert!(yaml.contains("portForwards"));
        assert!(yaml.contains("guestPort: 6443"));
    }

    #[test]
    fn test_existing_entries_are_kept() {
        let text = r#"
cpus: 2
memory: 4Gib
disk: 20Gib
mounts:
- location: "~"
  writable: false
env:
  FOO: bar
portForwards:
- guestPort: 80
  hostPort: 8080
  proto: tcp
vmType: vz
"#;
        let mut template = VmTemplate::from_yaml(text).unwrap();
        template.add_persisted_folder(Path::new("/data"));
        template.add_port_forward(12000);

        assert_eq!(template.mounts.len(), 2);
        assert_eq!(template.mounts[0].location, "~");
        assert_eq!(template.env.get("FOO").map(String::as_str), Some("bar"));
        assert_eq!(template.port_forwards.len(), 2);
        assert!(template.port_forwards[0].extra.contains_key("proto"));
        assert!(template.extra.contains_key("vmType"));
    }

    #[test]
    fn test_lima_default_style_template() {
        let text = r#"
vmType: null
cpus: null
memory: null
disk: null
mounts:
- location: "~"
  writable: null
- location: "/tmp/lima"
  writable: true
env: null
portForwards:
- guestPortRange: [1, 65535]
  hostIP: "0.0.0.0"
- guestSocket: "/run/user/{{.UID}}/podman/podman.sock"
  hostSocket: "{{.Dir}}/sock/podman.sock"
- guestPort: 8888
"#;
        let mut template = VmTemplate::from_yaml(text).unwrap();
        assert_eq!(template.cpus, None);
        assert_eq!(template.mounts[0].writable, None);
        assert!(template.env.is_empty());
        assert_eq!(template.port_forwards.len(), 3);
        assert_eq!(template.port_forwards[0].guest_port, None);
        assert_eq!(template.port_forwards[2].host_port, None);

        template.set_resources(4, 50, 8);
        template.add_persisted_folder(Path::new("/home/me/.field"));
        template.add_port_forward(11443);

        let yaml = template.to_yaml().unwrap();
        let reloaded = VmTemplate::from_yaml(&yaml).unwrap();
        assert_eq!(reloaded, template);
        assert_eq!(reloaded.cpus, Some(4));
        assert_eq!(reloaded.port_forwards.len(), 4);
        assert!(reloaded.port_forwards[0].extra.contains_key("guestPortRange"));
        assert!(reloaded.port_forwards[1].extra.contains_key("guestSocket"));
        assert_eq!(reloaded.port_forwards[3].guest_port, Some(6443));
        assert!(!yaml.contains("writable: null"));
        assert!(reloaded.extra.contains_key("vmType"));
    }
}
