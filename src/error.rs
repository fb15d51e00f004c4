/// Error types shared by the kubeconfig store and the cluster lifecycle
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Failures while reading, merging or writing a kubeconfig file
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Kubeconfig {path} is not a valid kubeconfig document: {source}")]
    MalformedDocument {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid credential fragment: {0}")]
    InvalidFragment(String),

    #[error("Failed to serialize kubeconfig: {0}")]
    Serialize(#[source] serde_yaml::Error),
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Kind of resource managed by fieldctl
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Vm,
    VirtualCluster,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Vm => write!(f, "VM"),
            ResourceKind::VirtualCluster => write!(f, "virtual cluster"),
        }
    }
}

/// Failures surfaced by cluster lifecycle operations
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("{tool} is not installed or not in PATH. Please install from {install_url}")]
    ToolMissing { tool: String, install_url: String },

    #[error("Failed to execute {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{step} failed: {output}{remediation}")]
    CommandFailed {
        step: String,
        output: String,
        remediation: String,
    },

    #[error("{kind} {name} does not exist")]
    NotFound { kind: ResourceKind, name: String },

    #[error("{kind} {name} already exists")]
    AlreadyExists { kind: ResourceKind, name: String },

    #[error("Timeout after {timeout_secs} seconds waiting for {kind} {name} to be deleted. {remediation}")]
    Timeout {
        kind: ResourceKind,
        name: String,
        timeout_secs: u64,
        remediation: String,
    },

    #[error("{name} was created but its credentials could not be merged into the kubeconfig. Retry with:\n\n  {retry}\n")]
    ConnectAfterCreate {
        name: String,
        retry: String,
        #[source]
        source: Box<ClusterError>,
    },

    #[error("Unexpected output from {tool}: {reason}")]
    UnexpectedOutput { tool: String, reason: String },

    #[error("Lima template error: {0:#}")]
    Template(anyhow::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = ClusterError> = std::result::Result<T, E>;
