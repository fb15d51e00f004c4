/// Kubeconfig document model and on-disk store
pub mod document;
pub mod store;

pub use document::CredentialFragment;
pub use store::{KubeconfigStore, MergeOutcome};
