/// Kubeconfig persistence: merge, evict, backup and atomic replace
use std::ffi::OsStr;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::document::{CredentialFragment, Kubeconfig};
use crate::error::StoreError;

/// Result of merging a credential fragment
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// No kubeconfig existed, the fragment became the whole file
    Created,
    /// The fragment was merged into an existing kubeconfig
    Merged {
        replaced: bool,
        backup: Option<PathBuf>,
    },
}

/// A kubeconfig file on disk
#[derive(Debug, Clone)]
pub struct KubeconfigStore {
    path: PathBuf,
}

/// Pick the kubeconfig path: explicit flag, then `KUBECONFIG`, then fallback.
///
/// `KUBECONFIG` may hold a path list; fieldctl writes to its first entry.
pub fn resolve_path(explicit: Option<&Path>, env: Option<&OsStr>, fallback: &Path) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    if let Some(first) = env
        .filter(|value| !value.is_empty())
        .and_then(|value| std::env::split_paths(value).find(|p| !p.as_os_str().is_empty()))
    {
        return first;
    }
    fallback.to_path_buf()
}

impl KubeconfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Resolve the path against the process environment
    pub fn from_env(explicit: Option<&Path>, fallback: &Path) -> Self {
        let env = std::env::var_os("KUBECONFIG");
        Self::new(resolve_path(explicit, env.as_deref(), fallback))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the kubeconfig, `None` if the file does not exist
    pub fn load(&self) -> Result<Option<Kubeconfig>, StoreError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::io(&self.path, e)),
        };
        Kubeconfig::from_yaml(&content)
            .map(Some)
            .map_err(|source| StoreError::MalformedDocument {
                path: self.path.clone(),
                source,
            })
    }

    /// The file's `current-context`, if the file exists and sets one
    pub fn current_context(&self) -> Result<Option<String>, StoreError> {
        let Some(doc) = self.load()? else {
            return Ok(None);
        };
        if doc.current_context.is_empty() {
            return Ok(None);
        }
        if doc.context(&doc.current_context).is_none() {
            warn!(
                "current-context {} has no matching context in {}",
                doc.current_context,
                self.path.display()
            );
        }
        Ok(Some(doc.current_context))
    }

    /// Merge a fragment under `target_name`, replacing any entries with that name
    pub fn merge_fragment(
        &self,
        mut fragment: CredentialFragment,
        target_name: &str,
    ) -> Result<MergeOutcome, StoreError> {
        fragment.rename(target_name);
        info!("Merge new context {} into {}", target_name, self.path.display());

        let Some(mut doc) = self.load()? else {
            warn!(
                "No kubeconfig found in {}. Creating a new one",
                self.path.display()
            );
            self.write(&fragment.into_document())?;
            return Ok(MergeOutcome::Created);
        };

        let replaced = doc.upsert(fragment);
        if replaced {
            debug!("Replaced existing entries named {}", target_name);
        }

        let backup = self.backup();
        self.write(&doc)?;
        Ok(MergeOutcome::Merged { replaced, backup })
    }

    /// Remove the cluster, context and user named `name`.
    ///
    /// Nothing is written when no entry matches. Returns true if the file changed.
    pub fn evict(&self, name: &str) -> Result<bool, StoreError> {
        let Some(mut doc) = self.load()? else {
            debug!("No kubeconfig at {}, nothing to remove", self.path.display());
            return Ok(false);
        };

        if !doc.remove_named(name) {
            debug!("No entries named {} in {}", name, self.path.display());
            return Ok(false);
        }

        info!("Removing context {} from {}", name, self.path.display());
        self.backup();
        self.write(&doc)?;
        Ok(true)
    }

    /// Existing backups of this kubeconfig, oldest first
    pub fn backups(&self) -> Result<Vec<PathBuf>, StoreError> {
        let dir = self.parent_dir();
        let prefix = self.backup_prefix();

        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(&dir, e)),
        };

        let mut stamped = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io(&dir, e))?;
            let file_name = entry.file_name();
            let Some(stamp) = file_name
                .to_str()
                .and_then(|n| n.strip_prefix(&prefix))
                .and_then(parse_backup_stamp)
            else {
                continue;
            };
            stamped.push((stamp, entry.path()));
        }
        stamped.sort();
        Ok(stamped.into_iter().map(|(_, path)| path).collect())
    }

    /// Copy the current file aside. Failure is logged, never fatal.
    fn backup(&self) -> Option<PathBuf> {
        let result = self
            .next_backup_path()
            .and_then(|target| match fs::copy(self.target(), &target) {
                Ok(_) => Ok(target),
                Err(e) => Err(StoreError::io(&target, e)),
            });

        match result {
            Ok(target) => {
                info!("Kubeconfig backed up to {}", target.display());
                Some(target)
            }
            Err(e) => {
                warn!("!!! Could not back up {}: {}", self.path.display(), e);
                warn!("!!! Continuing without a backup of the previous kubeconfig");
                None
            }
        }
    }

    /// `<path>_<seconds>.<micros>`, strictly newer than every existing backup
    fn next_backup_path(&self) -> Result<PathBuf, StoreError> {
        let prefix = self.backup_prefix();
        let newest = self.backups()?.last().and_then(|p| {
            p.file_name()?
                .to_str()?
                .strip_prefix(&prefix)
                .and_then(parse_backup_stamp)
        });

        let now = chrono::Utc::now().timestamp_micros();
        let stamp = match newest {
            Some(newest) if newest >= now => newest.checked_add(1).ok_or_else(|| {
                StoreError::io(
                    self.parent_dir(),
                    std::io::Error::new(
                        std::io::ErrorKind::Other,
                        "no backup timestamp left after the newest backup",
                    ),
                )
            })?,
            _ => now,
        };

        let name = format!(
            "{}{}.{:06}",
            prefix,
            stamp.div_euclid(1_000_000),
            stamp.rem_euclid(1_000_000)
        );
        Ok(self.parent_dir().join(name))
    }

    fn backup_prefix(&self) -> String {
        let file_name = self
            .target()
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        format!("{}_", file_name)
    }

    fn parent_dir(&self) -> PathBuf {
        match self.target().parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    /// The file the kubeconfig path points at.
    ///
    /// A symlinked kubeconfig is written through, so the link survives and
    /// backups sit next to the real file.
    fn target(&self) -> PathBuf {
        let is_link = fs::symlink_metadata(&self.path)
            .map(|meta| meta.file_type().is_symlink())
            .unwrap_or(false);
        if !is_link {
            return self.path.clone();
        }
        if let Ok(resolved) = fs::canonicalize(&self.path) {
            return resolved;
        }
        // Dangling link: follow one level so the write creates its target
        match fs::read_link(&self.path) {
            Ok(link) if link.is_relative() => self
                .path
                .parent()
                .map(|parent| parent.join(&link))
                .unwrap_or(link),
            Ok(link) => link,
            Err(_) => self.path.clone(),
        }
    }

    /// Write through a temporary file in the same directory, then rename
    fn write(&self, doc: &Kubeconfig) -> Result<(), StoreError> {
        let yaml = doc.to_yaml().map_err(StoreError::Serialize)?;
        let target = self.target();
        let dir = self.parent_dir();
        fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;

        let mut tmp = tempfile::Builder::new()
            .prefix(".fieldctl-kubeconfig-")
            .tempfile_in(&dir)
            .map_err(|e| StoreError::io(&dir, e))?;
        tmp.write_all(yaml.as_bytes())
            .map_err(|e| StoreError::io(tmp.path(), e))?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| StoreError::io(tmp.path(), e))?;
        tmp.persist(&target)
            .map_err(|e| StoreError::io(&target, e.error))?;

        debug!("Kubeconfig written to {}", target.display());
        Ok(())
    }
}

/// Parse `<seconds>[.<fraction>]` into microseconds
fn parse_backup_stamp(stamp: &str) -> Option<i64> {
    let (secs, frac) = stamp.split_once('.').unwrap_or((stamp, ""));
    if secs.is_empty() || !secs.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if frac.len() > 6 || !frac.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let secs: i64 = secs.parse().ok()?;
    let micros: i64 = if frac.is_empty() {
        0
    } else {
        format!("{:0<6}", frac).parse().ok()?
    };
    secs.checked_mul(1_000_000)?.checked_add(micros)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_ok;

    fn fragment(name: &str, server: &str) -> CredentialFragment {
        let text = format!(
            r#"apiVersion: v1
kind: Config
clusters:
- name: {name}
  cluster:
    server: {server}
    certificate-authority-data: Q0E=
contexts:
- name: {name}
  context:
    cluster: {name}
    user: {name}
current-context: {name}
users:
- name: {name}
  user:
    token: secret-{name}
"#
        );
        CredentialFragment::parse(&text).unwrap()
    }

    const EXISTING: &str = r#"apiVersion: v1
kind: Config
clusters:
- name: prod
  cluster:
    server: https://prod.example.com
    insecure-skip-tls-verify: true
- name: demo-1
  cluster:
    server: https://a
contexts:
- name: prod
  context:
    cluster: prod
    user: prod-admin
    namespace: payments
- name: demo-1
  context:
    cluster: demo-1
    user: demo-1
current-context: prod
preferences: {}
users:
- name: prod-admin
  user:
    exec:
      apiVersion: client.authentication.k8s.io/v1beta1
      command: aws
- name: demo-1
  user:
    token: old
"#;

    fn store_with(dir: &tempfile::TempDir, content: Option<&str>) -> KubeconfigStore {
        let path = dir.path().join("config");
        if let Some(content) = content {
            fs::write(&path, content).unwrap();
        }
        KubeconfigStore::new(path)
    }

    fn count_named(doc: &Kubeconfig, name: &str) -> (usize, usize, usize) {
        (
            doc.clusters.iter().filter(|c| c.name == name).count(),
            doc.contexts.iter().filter(|c| c.name == name).count(),
            doc.users.iter().filter(|u| u.name == name).count(),
        )
    }

    #[test]
    fn test_resolve_path_precedence() {
        let fallback = Path::new("/home/me/.kube/config");
        let env = OsStr::new("/tmp/env-config");

        assert_eq!(
            resolve_path(Some(Path::new("/tmp/flag")), Some(env), fallback),
            PathBuf::from("/tmp/flag")
        );
        assert_eq!(
            resolve_path(None, Some(env), fallback),
            PathBuf::from("/tmp/env-config")
        );
        assert_eq!(resolve_path(None, None, fallback), fallback);
        assert_eq!(resolve_path(None, Some(OsStr::new("")), fallback), fallback);
    }

    #[test]
    fn test_resolve_path_uses_first_kubeconfig_entry() {
        let joined = std::env::join_paths(["/tmp/one", "/tmp/two"]).unwrap();
        assert_eq!(
            resolve_path(None, Some(joined.as_os_str()), Path::new("/fallback")),
            PathBuf::from("/tmp/one")
        );
    }

    #[test]
    fn test_merge_into_absent_file_creates_it() {
        let dir = tempfile::tempdir().unwrap();
        let store = KubeconfigStore::new(dir.path().join("nested").join("config"));

        let outcome = store
            .merge_fragment(fragment("vcluster_demo", "https://x"), "demo-1")
            .unwrap();
        assert_eq!(outcome, MergeOutcome::Created);

        let doc = store.load().unwrap().unwrap();
        assert_eq!(doc.clusters.len(), 1);
        assert_eq!(doc.contexts.len(), 1);
        assert_eq!(doc.users.len(), 1);
        assert_eq!(count_named(&doc, "demo-1"), (1, 1, 1));
        assert_eq!(doc.current_context, "demo-1");
        assert!(store.backups().unwrap().is_empty());
    }

    #[test]
    fn test_merge_replaces_by_name() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(&dir, Some(EXISTING));
        let before = store.load().unwrap().unwrap();

        let outcome = store
            .merge_fragment(fragment("whatever", "https://b"), "demo-1")
            .unwrap();
        assert!(matches!(
            outcome,
            MergeOutcome::Merged {
                replaced: true,
                backup: Some(_)
            }
        ));

        let doc = store.load().unwrap().unwrap();
        assert_eq!(count_named(&doc, "demo-1"), (1, 1, 1));
        assert_eq!(doc.cluster("demo-1").unwrap().cluster.server, "https://b");
        assert_eq!(
            doc.user("demo-1").unwrap().user.token.as_deref(),
            Some("secret-whatever")
        );
        assert_eq!(doc.current_context, "demo-1");

        // Everything not named demo-1 is unchanged
        for cluster in before.clusters.iter().filter(|c| c.name != "demo-1") {
            assert_eq!(doc.cluster(&cluster.name), Some(cluster));
        }
        for context in before.contexts.iter().filter(|c| c.name != "demo-1") {
            assert_eq!(doc.context(&context.name), Some(context));
        }
        for user in before.users.iter().filter(|u| u.name != "demo-1") {
            assert_eq!(doc.user(&user.name), Some(user));
        }
        assert_eq!(doc.preferences, before.preferences);
    }

    #[test]
    fn test_merge_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(&dir, Some(EXISTING));

        assert_ok!(store.merge_fragment(fragment("x", "https://b"), "demo-2"));
        let once = store.load().unwrap().unwrap();
        assert_ok!(store.merge_fragment(fragment("x", "https://b"), "demo-2"));
        let twice = store.load().unwrap().unwrap();

        assert_eq!(once, twice);
        assert_eq!(count_named(&twice, "demo-2"), (1, 1, 1));
    }

    #[test]
    fn test_merge_malformed_document() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(&dir, Some("clusters: {this is: [not a list"));

        let err = store
            .merge_fragment(fragment("x", "https://b"), "demo-1")
            .unwrap_err();
        assert!(matches!(err, StoreError::MalformedDocument { .. }));
        // The broken file is left as it was
        assert_eq!(
            fs::read_to_string(store.path()).unwrap(),
            "clusters: {this is: [not a list"
        );
    }

    #[test]
    fn test_merge_wrong_shape_is_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(&dir, Some("clusters: \"not a list\"\n"));

        let err = store
            .merge_fragment(fragment("x", "https://b"), "demo-1")
            .unwrap_err();
        assert!(matches!(err, StoreError::MalformedDocument { .. }));
    }

    #[test]
    fn test_merge_into_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(&dir, Some(""));

        let outcome = store
            .merge_fragment(fragment("x", "https://b"), "demo-1")
            .unwrap();
        assert!(matches!(outcome, MergeOutcome::Merged { replaced: false, .. }));
        let doc = store.load().unwrap().unwrap();
        assert_eq!(count_named(&doc, "demo-1"), (1, 1, 1));
    }

    #[test]
    fn test_every_write_backs_up_with_increasing_stamp() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(&dir, Some(EXISTING));

        store
            .merge_fragment(fragment("x", "https://b"), "demo-2")
            .unwrap();
        store
            .merge_fragment(fragment("x", "https://c"), "demo-3")
            .unwrap();
        assert!(store.evict("demo-2").unwrap());

        let backups = store.backups().unwrap();
        assert_eq!(backups.len(), 3);

        let stamps: Vec<i64> = backups
            .iter()
            .map(|p| {
                let name = p.file_name().unwrap().to_str().unwrap();
                parse_backup_stamp(name.strip_prefix("config_").unwrap()).unwrap()
            })
            .collect();
        assert!(stamps.windows(2).all(|w| w[0] < w[1]));

        // The first backup holds the original content
        assert_eq!(fs::read_to_string(&backups[0]).unwrap(), EXISTING);
    }

    #[test]
    fn test_backup_failure_does_not_block_write() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(&dir, Some(EXISTING));
        // Newest possible stamp, nothing can sort after it
        fs::write(dir.path().join("config_9223372036854.775807"), "old").unwrap();

        let outcome = store
            .merge_fragment(fragment("x", "https://b"), "demo-1")
            .unwrap();
        assert_eq!(
            outcome,
            MergeOutcome::Merged {
                replaced: true,
                backup: None
            }
        );

        let doc = store.load().unwrap().unwrap();
        assert_eq!(count_named(&doc, "demo-1"), (1, 1, 1));
        assert_eq!(doc.cluster("demo-1").unwrap().cluster.server, "https://b");
        assert_eq!(doc.current_context, "demo-1");
    }

    #[cfg(unix)]
    #[test]
    fn test_merge_through_symlink() {
        let dir = tempfile::tempdir().unwrap();
        let real_dir = dir.path().join("dotfiles");
        fs::create_dir(&real_dir).unwrap();
        let real = real_dir.join("kubeconfig");
        fs::write(&real, EXISTING).unwrap();
        let link = dir.path().join("config");
        std::os::unix::fs::symlink(&real, &link).unwrap();

        let store = KubeconfigStore::new(&link);
        let outcome = store
            .merge_fragment(fragment("x", "https://b"), "demo-1")
            .unwrap();

        assert!(fs::symlink_metadata(&link).unwrap().file_type().is_symlink());
        let doc = Kubeconfig::from_yaml(&fs::read_to_string(&real).unwrap()).unwrap();
        assert_eq!(doc.cluster("demo-1").unwrap().cluster.server, "https://b");
        assert_eq!(doc.current_context, "demo-1");

        let backup = match outcome {
            MergeOutcome::Merged {
                backup: Some(backup),
                ..
            } => backup,
            other => panic!("expected a backup, got {:?}", other),
        };
        assert_eq!(backup.parent(), Some(fs::canonicalize(&real_dir).unwrap().as_path()));
        assert_eq!(fs::read_to_string(&backup).unwrap(), EXISTING);
        assert_eq!(store.backups().unwrap(), vec![backup]);
    }

    #[test]
    fn test_backup_stamp_beats_existing_future_backup() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(&dir, Some(EXISTING));
        let future = dir.path().join("config_99999999999.5");
        fs::write(&future, "old").unwrap();

        store
            .merge_fragment(fragment("x", "https://b"), "demo-2")
            .unwrap();

        let backups = store.backups().unwrap();
        assert_eq!(backups.len(), 2);
        assert_eq!(backups[0], future);
        assert_eq!(
            backups[1].file_name().unwrap().to_str().unwrap(),
            "config_99999999999.500001"
        );
    }

    #[test]
    fn test_evict_removes_only_named_entries() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(&dir, Some(EXISTING));

        assert!(store.evict("demo-1").unwrap());
        let doc = store.load().unwrap().unwrap();
        assert_eq!(count_named(&doc, "demo-1"), (0, 0, 0));
        assert!(doc.cluster("prod").is_some());
        assert!(doc.context("prod").is_some());
        assert!(doc.user("prod-admin").is_some());
        assert_eq!(doc.current_context, "prod");

        // Second eviction is a no-op and writes nothing
        let backups = store.backups().unwrap().len();
        assert!(!store.evict("demo-1").unwrap());
        assert_eq!(store.load().unwrap().unwrap(), doc);
        assert_eq!(store.backups().unwrap().len(), backups);
    }

    #[test]
    fn test_evict_ghost_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(&dir, Some(EXISTING));

        assert!(!store.evict("ghost").unwrap());
        assert_eq!(fs::read_to_string(store.path()).unwrap(), EXISTING);
        assert!(store.backups().unwrap().is_empty());
    }

    #[test]
    fn test_evict_keeps_current_context() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(&dir, None);
        store
            .merge_fragment(fragment("x", "https://b"), "demo-1")
            .unwrap();

        assert!(store.evict("demo-1").unwrap());
        assert_eq!(store.current_context().unwrap().as_deref(), Some("demo-1"));
    }

    #[test]
    fn test_evict_absent_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(&dir, None);
        assert!(!store.evict("demo-1").unwrap());
        assert!(!store.path().exists());
    }

    #[test]
    fn test_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(&dir, Some(EXISTING));
        store
            .merge_fragment(fragment("x", "https://b"), "demo-9")
            .unwrap();
        let doc = store.load().unwrap().unwrap();

        let other = KubeconfigStore::new(dir.path().join("copy"));
        other.write(&doc).unwrap();
        assert_eq!(other.load().unwrap().unwrap(), doc);
    }

    #[test]
    fn test_current_context() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(store_with(&dir, None).current_context().unwrap(), None);
        let store = store_with(&dir, Some(EXISTING));
        assert_eq!(store.current_context().unwrap().as_deref(), Some("prod"));
    }

    #[test]
    fn test_parse_backup_stamp() {
        assert_eq!(parse_backup_stamp("1700000000.123456"), Some(1_700_000_000_123_456));
        assert_eq!(parse_backup_stamp("1700000000.5"), Some(1_700_000_000_500_000));
        assert_eq!(parse_backup_stamp("1700000000"), Some(1_700_000_000_000_000));
        assert_eq!(parse_backup_stamp("abc"), None);
        assert_eq!(parse_backup_stamp(""), None);
        assert_eq!(parse_backup_stamp("1.1234567"), None);
        assert_eq!(parse_backup_stamp("9223372036855"), None);
    }
}
