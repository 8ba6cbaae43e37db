//! Addon manifest deployment
//!
//! Bundled addon manifests are staged into `<data-dir>/manifests/`. A watcher
//! then polls that directory and applies every new or changed manifest to the
//! cluster with server-side apply. Operators can drop their own manifests into
//! the same directory, or suppress bundled ones with `--no-deploy <name>`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::api::{Api, DynamicObject, GroupVersionKind, Patch, PatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::discovery::Discovery;
use kube::{Client, Config};
#[cfg(test)]
use mockall::automock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bootstrap::datadir::create_private_dir;
use crate::bootstrap::token::write_private;
use crate::{Error, Result};

/// Subdirectory of the data directory holding addon manifests
pub const MANIFESTS_SUBDIR: &str = "manifests";

/// Field manager used for server-side apply
pub const FIELD_MANAGER: &str = "lattice-server";

const DEFAULT_WATCH_INTERVAL: Duration = Duration::from_secs(15);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Manifests shipped with the server, as `(file name, contents)`
const BUNDLED_MANIFESTS: &[(&str, &str)] = &[(
    "lattice-system.yaml",
    "apiVersion: v1\nkind: Namespace\nmetadata:\n  name: lattice-system\n  labels:\n    app.kubernetes.io/managed-by: lattice-server\n",
)];

/// Stages and applies addon manifests
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ManifestDeployer: Send + Sync {
    /// Write bundled manifests into `dir`
    fn stage(&self, dir: &Path) -> Result<()>;

    /// Apply manifests found in `dir` until `cancel` fires
    async fn watch(&self, cancel: CancellationToken, skips: Vec<String>, dir: PathBuf)
        -> Result<()>;
}

/// Applies a single manifest document to the cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ManifestApplier: Send + Sync {
    /// Apply one YAML or JSON document
    async fn apply(&self, manifest: &str) -> Result<()>;
}

/// Whether `file_name` is suppressed by the skip list
///
/// An entry matches the full file name or the name without its extension.
pub fn is_skipped(file_name: &str, skips: &[String]) -> bool {
    let stem = Path::new(file_name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(file_name);
    skips.iter().any(|s| s == file_name || s == stem)
}

fn is_manifest(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml" | "yml" | "json")
    )
}

/// Split a multi-document YAML file into its documents
pub fn split_documents(contents: &str) -> Vec<String> {
    contents
        .split("\n---")
        .map(|doc| doc.trim().trim_start_matches("---").trim().to_string())
        .filter(|doc| !doc.is_empty() && doc.contains("kind"))
        .collect()
}

/// Content fingerprint used to notice changed manifests
fn fingerprint(contents: &str) -> String {
    let digest = aws_lc_rs::digest::digest(&aws_lc_rs::digest::SHA256, contents.as_bytes());
    hex::encode(digest.as_ref())
}

/// Directory-backed deployer
pub struct FileManifestDeployer {
    applier: Arc<dyn ManifestApplier>,
    interval: Duration,
}

impl FileManifestDeployer {
    /// Create a deployer that applies through `applier`
    pub fn new(applier: Arc<dyn ManifestApplier>) -> Self {
        Self {
            applier,
            interval: DEFAULT_WATCH_INTERVAL,
        }
    }

    /// Override the directory poll interval
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Apply every new or changed manifest in `dir` once
    ///
    /// `applied` maps each path to the fingerprint last applied successfully.
    /// Failed files are left out so the next pass retries them.
    pub async fn apply_pending(
        &self,
        dir: &Path,
        skips: &[String],
        applied: &mut HashMap<PathBuf, String>,
    ) -> Result<usize> {
        let entries = std::fs::read_dir(dir).map_err(|e| Error::io(dir, e))?;

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && is_manifest(p))
            .collect();
        paths.sort();

        // Forget removed files so they apply again if they come back.
        applied.retain(|path, _| paths.contains(path));

        let mut count = 0;
        for path in paths {
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if is_skipped(name, skips) {
                debug!(file = %name, "Skipping manifest");
                continue;
            }

            let contents = match std::fs::read_to_string(&path) {
                Ok(c) => c,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to read manifest");
                    continue;
                }
            };
            let digest = fingerprint(&contents);
            if applied.get(&path) == Some(&digest) {
                continue;
            }

            match self.apply_file(&contents).await {
                Ok(()) => {
                    info!(path = %path.display(), "Applied manifest");
                    applied.insert(path, digest);
                    count += 1;
                }
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to apply manifest"),
            }
        }
        Ok(count)
    }

    async fn apply_file(&self, contents: &str) -> Result<()> {
        for doc in split_documents(contents) {
            self.applier.apply(&doc).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl ManifestDeployer for FileManifestDeployer {
    fn stage(&self, dir: &Path) -> Result<()> {
        create_private_dir(dir)
            .map_err(|e| Error::deploy(dir, format!("failed to create directory: {}", e)))?;

        for (name, contents) in BUNDLED_MANIFESTS {
            let path = dir.join(name);
            // Never overwrite operator edits.
            if path.exists() {
                continue;
            }
            write_private(&path, contents.as_bytes())
                .map_err(|e| Error::deploy(&path, e.to_string()))?;
            debug!(path = %path.display(), "Staged manifest");
        }
        Ok(())
    }

    async fn watch(
        &self,
        cancel: CancellationToken,
        skips: Vec<String>,
        dir: PathBuf,
    ) -> Result<()> {
        let mut applied = HashMap::new();
        loop {
            if let Err(e) = self.apply_pending(&dir, &skips, &mut applied).await {
                warn!(path = %dir.display(), error = %e, "Failed to scan manifests");
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Manifest watcher stopped");
                    return Ok(());
                }
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
    }
}

/// Server-side applies manifests with kube-rs
///
/// The client is built on every call: the API server may not be up yet when
/// the watcher starts, and a failed apply is simply retried on the next pass.
#[derive(Debug, Default, Clone)]
pub struct KubeApplier {
    kubeconfig: Option<PathBuf>,
}

impl KubeApplier {
    /// Apply against the cluster in `kubeconfig`, or the inferred config
    pub fn new(kubeconfig: Option<PathBuf>) -> Self {
        Self { kubeconfig }
    }

    async fn client(&self) -> Result<Client> {
        let mut config = match &self.kubeconfig {
            Some(path) => {
                let kubeconfig = Kubeconfig::read_from(path)
                    .map_err(|e| Error::kube(format!("failed to read kubeconfig: {}", e)))?;
                Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                    .await
                    .map_err(|e| Error::kube(format!("failed to load kubeconfig: {}", e)))?
            }
            None => Config::infer()
                .await
                .map_err(|e| Error::kube(format!("failed to infer config: {}", e)))?,
        };
        config.connect_timeout = Some(CONNECT_TIMEOUT);
        config.read_timeout = Some(READ_TIMEOUT);
        Client::try_from(config)
            .map_err(|e| Error::kube(format!("failed to create client: {}", e)))
    }
}

#[async_trait]
impl ManifestApplier for KubeApplier {
    async fn apply(&self, manifest: &str) -> Result<()> {
        let obj: serde_json::Value = serde_yaml::from_str(manifest)
            .map_err(|e| Error::kube(format!("invalid YAML: {}", e)))?;

        let kind = obj
            .get("kind")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::kube("missing kind"))?;
        let api_version = obj
            .get("apiVersion")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::kube("missing apiVersion"))?;
        let name = obj
            .pointer("/metadata/name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::kube("missing metadata.name"))?;
        let namespace = obj.pointer("/metadata/namespace").and_then(|v| v.as_str());

        let (group, version) = api_version.split_once('/').unwrap_or(("", api_version));
        let gvk = GroupVersionKind {
            group: group.to_string(),
            version: version.to_string(),
            kind: kind.to_string(),
        };

        let client = self.client().await?;
        let discovery = Discovery::new(client.clone())
            .run()
            .await
            .map_err(|e| Error::kube(format!("API discovery failed: {}", e)))?;
        let (api_resource, _) = discovery
            .resolve_gvk(&gvk)
            .ok_or_else(|| Error::kube(format!("unknown resource type {}/{}", api_version, kind)))?;

        let api: Api<DynamicObject> = match namespace {
            Some(ns) => Api::namespaced_with(client, ns, &api_resource),
            None => Api::all_with(client, &api_resource),
        };

        api.patch(name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(&obj))
            .await
            .map_err(|e| Error::kube(format!("failed to apply {}/{}: {}", kind, name, e)))?;

        debug!(kind = %kind, name = %name, namespace = ?namespace, "Applied object");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn deployer_with(applier: MockManifestApplier) -> FileManifestDeployer {
        FileManifestDeployer::new(Arc::new(applier)).with_interval(Duration::from_millis(10))
    }

    // ==========================================================================
    // Story: Staging bundled manifests
    // ==========================================================================

    #[test]
    fn story_stage_writes_bundled_manifests_once() {
        let dir = tempfile::tempdir().unwrap();
        let manifests = dir.path().join(MANIFESTS_SUBDIR);
        let deployer = deployer_with(MockManifestApplier::new());

        deployer.stage(&manifests).unwrap();
        let staged = manifests.join("lattice-system.yaml");
        assert!(staged.exists());

        // Operator edits survive a restart
        std::fs::write(&staged, "edited").unwrap();
        deployer.stage(&manifests).unwrap();
        assert_eq!(std::fs::read_to_string(&staged).unwrap(), "edited");
    }

    #[test]
    fn stage_fails_when_directory_cannot_be_created() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, "x").unwrap();

        let err = deployer_with(MockManifestApplier::new())
            .stage(&blocker.join(MANIFESTS_SUBDIR))
            .unwrap_err();
        assert!(err.to_string().contains("failed to create directory"));
    }

    // ==========================================================================
    // Story: Applying manifests from the directory
    // ==========================================================================

    #[tokio::test]
    async fn story_skipped_manifests_are_never_applied() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("coredns.yaml"), "kind: ConfigMap").unwrap();
        std::fs::write(dir.path().join("traefik.yml"), "kind: Deployment").unwrap();
        std::fs::write(dir.path().join("README.md"), "kind: nothing").unwrap();

        let mut applier = MockManifestApplier::new();
        applier
            .expect_apply()
            .withf(|m| m.contains("Deployment"))
            .times(1)
            .returning(|_| Ok(()));

        let deployer = deployer_with(applier);
        let mut applied = HashMap::new();
        let count = deployer
            .apply_pending(dir.path(), &["coredns".to_string()], &mut applied)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn story_unchanged_manifests_are_applied_once_and_changes_reapplied() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("addon.yaml");
        std::fs::write(&path, "kind: ConfigMap\ndata: a").unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut applier = MockManifestApplier::new();
        applier.expect_apply().returning(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let deployer = deployer_with(applier);
        let mut applied = HashMap::new();
        deployer.apply_pending(dir.path(), &[], &mut applied).await.unwrap();
        deployer.apply_pending(dir.path(), &[], &mut applied).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        std::fs::write(&path, "kind: ConfigMap\ndata: b").unwrap();
        deployer.apply_pending(dir.path(), &[], &mut applied).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn story_deleted_manifest_is_forgotten_and_reapplied_when_restored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("addon.yaml");
        std::fs::write(&path, "kind: ConfigMap").unwrap();

        let mut applier = MockManifestApplier::new();
        applier.expect_apply().times(2).returning(|_| Ok(()));

        let deployer = deployer_with(applier);
        let mut applied = HashMap::new();
        deployer.apply_pending(dir.path(), &[], &mut applied).await.unwrap();
        assert!(applied.contains_key(&path));

        std::fs::remove_file(&path).unwrap();
        deployer.apply_pending(dir.path(), &[], &mut applied).await.unwrap();
        assert!(applied.is_empty());

        // Same contents as before still count as new
        std::fs::write(&path, "kind: ConfigMap").unwrap();
        let count = deployer.apply_pending(dir.path(), &[], &mut applied).await.unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn fingerprint_is_hex_sha256() {
        assert_eq!(
            fingerprint(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[tokio::test]
    async fn failed_apply_is_retried_on_next_pass() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("addon.yaml"), "kind: ConfigMap").unwrap();

        let mut applier = MockManifestApplier::new();
        let mut seq = mockall::Sequence::new();
        applier
            .expect_apply()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(Error::kube("api server not ready")));
        applier
            .expect_apply()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        let deployer = deployer_with(applier);
        let mut applied = HashMap::new();
        assert_eq!(deployer.apply_pending(dir.path(), &[], &mut applied).await.unwrap(), 0);
        assert_eq!(deployer.apply_pending(dir.path(), &[], &mut applied).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn watch_returns_when_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = deployer_with(MockManifestApplier::new())
            .watch(cancel, Vec::new(), dir.path().to_path_buf())
            .await;
        assert!(result.is_ok());
    }

    // ==========================================================================
    // Helpers
    // ==========================================================================

    #[test]
    fn skip_matches_file_name_or_stem() {
        let skips = vec!["coredns".to_string(), "extra.yaml".to_string()];
        assert!(is_skipped("coredns.yaml", &skips));
        assert!(is_skipped("extra.yaml", &skips));
        assert!(!is_skipped("extra.yml", &skips));
        assert!(!is_skipped("traefik.yaml", &skips));
    }

    #[test]
    fn split_documents_drops_separators_and_empty_docs() {
        let docs = split_documents("---\nkind: A\n---\nkind: B\n---\n");
        assert_eq!(docs, vec!["kind: A", "kind: B"]);
    }
}
