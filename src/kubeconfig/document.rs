/// Typed kubeconfig document
///
/// Only the fields fieldctl reads or rewrites are typed. Everything else a
/// user or another tool put in the file is carried through `extra` so a
/// merge never drops it.
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::StoreError;
use crate::utils::yaml::null_as_empty;

/// Keys not modelled explicitly, preserved verbatim
pub type Extra = BTreeMap<String, serde_yaml::Value>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Kubeconfig {
    #[serde(rename = "apiVersion", default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub clusters: Vec<ClusterEntry>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub contexts: Vec<ContextEntry>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub users: Vec<UserEntry>,
    #[serde(rename = "current-context", default, deserialize_with = "null_as_empty")]
    pub current_context: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferences: Option<serde_yaml::Value>,
    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterEntry {
    pub name: String,
    #[serde(default)]
    pub cluster: ClusterDetail,
    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterDetail {
    #[serde(default)]
    pub server: String,
    #[serde(
        rename = "certificate-authority-data",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub certificate_authority_data: Option<String>,
    /// Display name some tools (vcluster) nest inside the cluster record
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextEntry {
    pub name: String,
    #[serde(default)]
    pub context: ContextDetail,
    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextDetail {
    #[serde(default)]
    pub cluster: String,
    #[serde(default)]
    pub user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserEntry {
    pub name: String,
    #[serde(default)]
    pub user: UserDetail,
    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserDetail {
    #[serde(
        rename = "client-certificate-data",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub client_certificate_data: Option<String>,
    #[serde(
        rename = "client-key-data",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub client_key_data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(flatten)]
    pub extra: Extra,
}

impl Kubeconfig {
    /// Parse a kubeconfig. An empty file is an empty document.
    pub fn from_yaml(text: &str) -> Result<Self, serde_yaml::Error> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(text)
    }

    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }

    #[cfg(test)]
    pub fn cluster(&self, name: &str) -> Option<&ClusterEntry> {
        self.clusters.iter().find(|c| c.name == name)
    }

    pub fn context(&self, name: &str) -> Option<&ContextEntry> {
        self.contexts.iter().find(|c| c.name == name)
    }

    #[cfg(test)]
    pub fn user(&self, name: &str) -> Option<&UserEntry> {
        self.users.iter().find(|u| u.name == name)
    }

    /// Remove every cluster, context and user named `name`.
    ///
    /// Returns true if anything was removed. `current-context` is untouched.
    pub fn remove_named(&mut self, name: &str) -> bool {
        let before = self.clusters.len() + self.contexts.len() + self.users.len();
        self.clusters.retain(|c| c.name != name);
        self.contexts.retain(|c| c.name != name);
        self.users.retain(|u| u.name != name);
        before != self.clusters.len() + self.contexts.len() + self.users.len()
    }

    /// Replace-by-name insert of a renamed fragment, which becomes current.
    ///
    /// Returns true if an entry with the fragment's name was replaced.
    pub fn upsert(&mut self, fragment: CredentialFragment) -> bool {
        let name = fragment.name().to_string();
        let replaced = self.remove_named(&name);

        let mut doc = fragment.into_document();
        self.clusters.append(&mut doc.clusters);
        self.contexts.append(&mut doc.contexts);
        self.users.append(&mut doc.users);
        self.current_context = name;
        replaced
    }
}

/// A single cluster/context/user kubeconfig printed by a cluster tool
#[derive(Debug, Clone, PartialEq)]
pub struct CredentialFragment(Kubeconfig);

impl CredentialFragment {
    /// Parse tool output into a fragment
    pub fn parse(text: &str) -> Result<Self, StoreError> {
        let doc = Kubeconfig::from_yaml(text)
            .map_err(|e| StoreError::InvalidFragment(format!("not a kubeconfig: {}", e)))?;
        Self::from_document(doc)
    }

    pub fn from_document(doc: Kubeconfig) -> Result<Self, StoreError> {
        let counts = [
            ("clusters", doc.clusters.len()),
            ("contexts", doc.contexts.len()),
            ("users", doc.users.len()),
        ];
        for (list, count) in counts {
            if count != 1 {
                return Err(StoreError::InvalidFragment(format!(
                    "expected exactly one entry in {}, found {}",
                    list, count
                )));
            }
        }
        Ok(Self(doc))
    }

    /// Name of the fragment's context
    pub fn name(&self) -> &str {
        &self.0.contexts[0].name
    }

    pub fn server(&self) -> &str {
        &self.0.clusters[0].cluster.server
    }

    /// Point the fragment at a different API server URL
    pub fn set_server(&mut self, server: impl Into<String>) {
        self.0.clusters[0].cluster.server = server.into();
    }

    /// Rename every reference inside the fragment to `name`
    pub fn rename(&mut self, name: &str) {
        let doc = &mut self.0;

        let cluster = &mut doc.clusters[0];
        cluster.name = name.to_string();
        if cluster.cluster.name.is_some() {
            cluster.cluster.name = Some(name.to_string());
        }

        let context = &mut doc.contexts[0];
        context.name = name.to_string();
        context.context.cluster = name.to_string();
        context.context.user = name.to_string();

        doc.users[0].name = name.to_string();
        doc.current_context = name.to_string();
    }

    pub fn into_document(self) -> Kubeconfig {
        self.0
    }
}
