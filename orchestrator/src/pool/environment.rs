//! Pool of shared interpreter environments keyed by dependency fingerprint.
//!
//! Tasks that declare the same dependency set share one environment
//! concurrently. Environments are only ever populated at creation, so a shared
//! handle is never modified while tasks use it. Release only disassociates the
//! task; environments stay warm until evicted or cleaned up.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, info, instrument, warn};

use crate::core::hash::{fingerprint, normalize_dependencies};
use crate::error::OrchestratorError;
use crate::io::venv::{EnvMetadata, write_metadata};
use crate::pool::workspace::CleanupReport;

/// Directory name of a task's private fallback environment inside its workspace.
pub const PRIVATE_ENV_DIR: &str = ".venv-private";

/// Creates and destroys interpreter environments. Calls may block.
pub trait EnvironmentBackend: Send + Sync + 'static {
    /// Create an environment at `path` with `packages` installed.
    fn provision(&self, path: &Path, packages: &[String]) -> Result<()>;

    fn destroy(&self, path: &Path) -> Result<()>;

    fn size_bytes(&self, path: &Path) -> u64;
}

/// Snapshot of one shared environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnvironmentHandle {
    pub id: String,
    pub env_path: PathBuf,
    pub fingerprint: String,
    pub packages: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub usage_count: u64,
    pub tags: BTreeSet<String>,
    pub size_estimate: u64,
}

#[derive(Debug, Clone)]
pub struct EnvironmentPoolSettings {
    pub root: PathBuf,
    pub max_environments: usize,
    /// How long a miss may wait for an environment to become evictable.
    pub wait: Duration,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EnvironmentPoolStatus {
    pub total: usize,
    /// Environments referenced by at least one running task.
    pub active: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub total_size_bytes: u64,
}

#[derive(Debug)]
struct EnvEntry {
    handle: EnvironmentHandle,
    users: HashSet<String>,
    last_used: Instant,
}

#[derive(Debug, Default)]
struct EnvState {
    envs: HashMap<String, EnvEntry>,
    /// task id -> fingerprint
    assignments: HashMap<String, String>,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl EnvState {
    fn attach(&mut self, fp: &str, task_id: &str, tags: &[String]) -> Option<EnvironmentHandle> {
        let entry = self.envs.get_mut(fp)?;
        entry.users.insert(task_id.to_string());
        entry.last_used = Instant::now();
        entry.handle.usage_count += 1;
        entry.handle.last_used_at = Utc::now();
        entry.handle.tags.extend(tags.iter().cloned());
        let handle = entry.handle.clone();
        self.assignments.insert(task_id.to_string(), fp.to_string());
        Some(handle)
    }

    /// Least recently used environment with no active users.
    fn lru_idle(&self) -> Option<String> {
        self.envs
            .iter()
            .filter(|(_, entry)| entry.users.is_empty())
            .min_by_key(|(_, entry)| entry.last_used)
            .map(|(fp, _)| fp.clone())
    }
}

pub struct EnvironmentPool<B: EnvironmentBackend> {
    backend: Arc<B>,
    settings: EnvironmentPoolSettings,
    state: Mutex<EnvState>,
    provisioning: tokio::sync::Mutex<()>,
    freed: Notify,
}

impl<B: EnvironmentBackend> EnvironmentPool<B> {
    pub fn new(backend: B, settings: EnvironmentPoolSettings) -> Self {
        let settings = EnvironmentPoolSettings {
            max_environments: settings.max_environments.max(1),
            ..settings
        };
        Self {
            backend: Arc::new(backend),
            settings,
            state: Mutex::new(EnvState::default()),
            provisioning: tokio::sync::Mutex::new(()),
            freed: Notify::new(),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    fn state(&self) -> MutexGuard<'_, EnvState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Find or create the environment for `dependencies` and attach `task_id` to it.
    ///
    /// Returns `ProvisioningFailure` when the environment cannot be created (callers
    /// fall back to a private environment) and `AllocationTimeout` when the pool is
    /// full of environments in use for longer than the wait bound.
    #[instrument(skip_all, fields(task_id, deps = dependencies.len()))]
    pub async fn allocate(
        &self,
        task_id: &str,
        dependencies: &[String],
        tags: &[String],
    ) -> Result<EnvironmentHandle, OrchestratorError> {
        let fp = fingerprint(dependencies);
        if let Some(handle) = self.try_hit(&fp, task_id, tags) {
            return Ok(handle);
        }

        // One provisioning at a time; re-check after waiting in case it was ours.
        let _guard = self.provisioning.lock().await;
        if let Some(handle) = self.try_hit(&fp, task_id, tags) {
            return Ok(handle);
        }

        self.await_capacity().await?;

        let packages = normalize_dependencies(dependencies);
        let id = format!("env-{}", &fp[..16]);
        let env_path = self.settings.root.join(&id);
        let now = Utc::now();
        let metadata = EnvMetadata {
            fingerprint: fp.clone(),
            packages: packages.clone(),
            created_at: now,
            tags: tags.to_vec(),
        };

        let backend = Arc::clone(&self.backend);
        let path = env_path.clone();
        let provision_packages = packages.clone();
        let provisioned = tokio::task::spawn_blocking(move || -> Result<u64> {
            if path.exists() {
                backend.destroy(&path)?;
            }
            backend.provision(&path, &provision_packages)?;
            if let Err(err) = write_metadata(&path, &metadata) {
                warn!(err = %format!("{err:#}"), "failed to write environment metadata");
            }
            Ok(backend.size_bytes(&path))
        })
        .await;

        let size_estimate = match provisioned {
            Ok(Ok(size)) => size,
            Ok(Err(err)) => {
                warn!(err = %format!("{err:#}"), "environment provisioning failed");
                self.destroy_path(env_path).await;
                return Err(OrchestratorError::provisioning(&err));
            }
            Err(err) => {
                return Err(OrchestratorError::ProvisioningFailure(format!(
                    "environment provisioning panicked: {err}"
                )));
            }
        };

        let handle = EnvironmentHandle {
            id,
            env_path,
            fingerprint: fp.clone(),
            packages,
            created_at: now,
            last_used_at: now,
            usage_count: 0,
            tags: BTreeSet::new(),
            size_estimate,
        };
        // The replacement exists now; evict in the same critical section that inserts it.
        let (attached, evicted) = {
            let mut state = self.state();
            let evicted = if state.envs.len() >= self.settings.max_environments {
                state.lru_idle().and_then(|victim| state.envs.remove(&victim))
            } else {
                None
            };
            if evicted.is_some() {
                state.evictions += 1;
            } else if state.envs.len() >= self.settings.max_environments {
                warn!("no idle environment to evict, pool over capacity until one is released");
            }
            state.misses += 1;
            state.envs.insert(
                fp.clone(),
                EnvEntry {
                    handle,
                    users: HashSet::new(),
                    last_used: Instant::now(),
                },
            );
            (state.attach(&fp, task_id, tags), evicted)
        };
        info!(fingerprint = %fp, "provisioned environment");

        if let Some(entry) = evicted {
            info!(id = %entry.handle.id, "evicted least recently used environment");
            self.destroy_path(entry.handle.env_path).await;
        }
        attached.ok_or_else(|| {
            OrchestratorError::ProvisioningFailure("environment vanished after provisioning".to_string())
        })
    }

    fn try_hit(&self, fp: &str, task_id: &str, tags: &[String]) -> Option<EnvironmentHandle> {
        let mut state = self.state();
        let handle = state.attach(fp, task_id, tags)?;
        state.hits += 1;
        debug!(id = %handle.id, usage_count = handle.usage_count, "environment cache hit");
        Some(handle)
    }

    /// Wait until the pool has a free slot or an idle environment that a new one may replace.
    async fn await_capacity(&self) -> Result<(), OrchestratorError> {
        let wait = self.settings.wait;
        let deadline = Instant::now() + wait;
        loop {
            let notified = self.freed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let ready = {
                let state = self.state();
                state.envs.len() < self.settings.max_environments || state.lru_idle().is_some()
            };
            if ready {
                return Ok(());
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() || tokio::time::timeout(remaining, notified).await.is_err() {
                warn!(waited = ?wait, "all environments in use");
                return Err(OrchestratorError::AllocationTimeout {
                    resource: "environment",
                    waited: wait,
                });
            }
        }
    }

    /// Create an unshared environment inside a task's workspace.
    pub async fn provision_private(
        &self,
        workdir: &Path,
        dependencies: &[String],
    ) -> Result<PathBuf, OrchestratorError> {
        let path = workdir.join(PRIVATE_ENV_DIR);
        let packages = normalize_dependencies(dependencies);
        let backend = Arc::clone(&self.backend);
        let target = path.clone();
        tokio::task::spawn_blocking(move || backend.provision(&target, &packages))
            .await
            .map_err(|err| {
                OrchestratorError::ProvisioningFailure(format!("private provisioning panicked: {err}"))
            })?
            .map_err(|err| OrchestratorError::provisioning(&err))?;
        Ok(path)
    }

    /// Detach `task_id` from its environment. The environment itself stays warm.
    pub fn release(&self, task_id: &str) {
        let mut state = self.state();
        let Some(fp) = state.assignments.remove(task_id) else {
            debug!(task_id, "no environment to release");
            return;
        };
        let now_idle = match state.envs.get_mut(&fp) {
            Some(entry) => {
                entry.users.remove(task_id);
                entry.last_used = Instant::now();
                entry.users.is_empty()
            }
            None => false,
        };
        // Trim an overflow left by a provisioning that found nothing idle to evict.
        let surplus = if now_idle && state.envs.len() > self.settings.max_environments {
            state.evictions += 1;
            state.envs.remove(&fp)
        } else {
            None
        };
        drop(state);
        if let Some(entry) = surplus {
            self.destroy_detached(entry.handle.env_path);
        }
        if now_idle {
            self.freed.notify_waiters();
        }
    }

    fn destroy_detached(&self, path: PathBuf) {
        let backend = Arc::clone(&self.backend);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn_blocking(move || {
                    if let Err(err) = backend.destroy(&path) {
                        warn!(path = %path.display(), err = %format!("{err:#}"), "failed to destroy environment");
                    }
                });
            }
            Err(_) => warn!(path = %path.display(), "environment leaked: no runtime to destroy it"),
        }
    }

    /// Destroy every environment and clear the fingerprint index.
    pub async fn cleanup(&self) -> CleanupReport {
        let entries: Vec<EnvEntry> = {
            let mut state = self.state();
            state.assignments.clear();
            state.envs.drain().map(|(_, entry)| entry).collect()
        };
        let mut report = CleanupReport::default();
        for entry in entries {
            if self.destroy_path(entry.handle.env_path).await {
                report.removed += 1;
            } else {
                report.failed += 1;
            }
        }
        self.freed.notify_waiters();
        report
    }

    async fn destroy_path(&self, path: PathBuf) -> bool {
        let backend = Arc::clone(&self.backend);
        let shown = path.display().to_string();
        match tokio::task::spawn_blocking(move || backend.destroy(&path)).await {
            Ok(Ok(())) => true,
            Ok(Err(err)) => {
                warn!(path = %shown, err = %format!("{err:#}"), "failed to destroy environment");
                false
            }
            Err(err) => {
                warn!(path = %shown, err = %err, "environment destroy panicked");
                false
            }
        }
    }

    pub fn status(&self) -> EnvironmentPoolStatus {
        let state = self.state();
        EnvironmentPoolStatus {
            total: state.envs.len(),
            active: state.envs.values().filter(|e| !e.users.is_empty()).count(),
            hits: state.hits,
            misses: state.misses,
            evictions: state.evictions,
            total_size_bytes: state.envs.values().map(|e| e.handle.size_estimate).sum(),
        }
    }

    pub fn handles(&self) -> Vec<EnvironmentHandle> {
        let mut handles: Vec<EnvironmentHandle> = self
            .state()
            .envs
            .values()
            .map(|entry| entry.handle.clone())
            .collect();
        handles.sort_by(|a, b| a.id.cmp(&b.id));
        handles
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeEnvironments;

    fn deps(list: &[&str]) -> Vec<String> {
        list.iter().map(|d| d.to_string()).collect()
    }

    fn pool(max: usize, root: &Path) -> EnvironmentPool<FakeEnvironments> {
        EnvironmentPool::new(
            FakeEnvironments::default(),
            EnvironmentPoolSettings {
                root: root.to_path_buf(),
                max_environments: max,
                wait: Duration::from_millis(200),
            },
        )
    }

    #[tokio::test]
    async fn identical_dependencies_share_one_environment() {
        let temp = tempfile::tempdir().expect("tempdir");
        let pool = pool(4, temp.path());

        let a = pool
            .allocate("a", &deps(&["requests", "numpy"]), &deps(&["tester"]))
            .await
            .expect("a");
        let b = pool
            .allocate("b", &deps(&["numpy", "requests"]), &deps(&["documenter"]))
            .await
            .expect("b");

        assert_eq!(a.id, b.id);
        assert_eq!(b.usage_count, 2);
        assert!(b.tags.contains("tester") && b.tags.contains("documenter"));
        assert_eq!(pool.backend().provision_count(), 1);
        let status = pool.status();
        assert_eq!((status.hits, status.misses), (1, 1));
        assert!(a.env_path.join(crate::io::venv::METADATA_FILE).is_file());
    }

    #[tokio::test]
    async fn release_keeps_environment_warm() {
        let temp = tempfile::tempdir().expect("tempdir");
        let pool = pool(4, temp.path());
        let handle = pool.allocate("a", &deps(&["x"]), &[]).await.expect("a");
        pool.release("a");
        pool.release("a");

        assert!(handle.env_path.exists());
        let status = pool.status();
        assert_eq!(status.total, 1);
        assert_eq!(status.active, 0);
    }

    #[tokio::test]
    async fn evicts_least_recently_used_idle_environment() {
        let temp = tempfile::tempdir().expect("tempdir");
        let pool = pool(2, temp.path());
        let first = pool.allocate("a", &deps(&["one"]), &[]).await.expect("a");
        pool.release("a");
        pool.allocate("b", &deps(&["two"]), &[]).await.expect("b");
        pool.release("b");

        pool.allocate("c", &deps(&["three"]), &[]).await.expect("c");
        let status = pool.status();
        assert_eq!(status.total, 2);
        assert_eq!(status.evictions, 1);
        assert!(!first.env_path.exists());
    }

    #[tokio::test]
    async fn failed_replacement_keeps_the_warm_environment() {
        let temp = tempfile::tempdir().expect("tempdir");
        let pool = pool(1, temp.path());
        let warm = pool.allocate("a", &deps(&["one"]), &[]).await.expect("a");
        pool.release("a");

        pool.backend().fail_provisions(1);
        let err = pool.allocate("b", &deps(&["two"]), &[]).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::ProvisioningFailure(_)));
        assert!(warm.env_path.exists());
        assert_eq!(pool.status().evictions, 0);

        let again = pool.allocate("c", &deps(&["one"]), &[]).await.expect("c");
        assert_eq!(again.id, warm.id);
        assert_eq!(pool.backend().provision_count(), 1);
    }

    #[tokio::test]
    async fn full_pool_of_active_environments_times_out() {
        let temp = tempfile::tempdir().expect("tempdir");
        let pool = pool(1, temp.path());
        pool.allocate("a", &deps(&["one"]), &[]).await.expect("a");
        let err = pool.allocate("b", &deps(&["two"]), &[]).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::AllocationTimeout { .. }));
    }

    #[tokio::test]
    async fn waiter_proceeds_when_an_environment_frees_up() {
        let temp = tempfile::tempdir().expect("tempdir");
        let pool = Arc::new(pool(1, temp.path()));
        pool.allocate("a", &deps(&["one"]), &[]).await.expect("a");

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.allocate("b", &deps(&["two"]), &[]).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        pool.release("a");
        let handle = waiter.await.expect("join").expect("b");
        assert_eq!(handle.packages, vec!["two"]);
    }

    #[tokio::test]
    async fn provisioning_failure_is_reported() {
        let temp = tempfile::tempdir().expect("tempdir");
        let pool = pool(2, temp.path());
        pool.backend().fail_provisions(1);
        let err = pool.allocate("a", &deps(&["x"]), &[]).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::ProvisioningFailure(_)));
        assert_eq!(pool.status().total, 0);

        let private = pool
            .provision_private(temp.path(), &deps(&["x"]))
            .await
            .expect("private");
        assert!(private.ends_with(PRIVATE_ENV_DIR));
    }

    #[tokio::test]
    async fn cleanup_destroys_all() {
        let temp = tempfile::tempdir().expect("tempdir");
        let pool = pool(2, temp.path());
        let a = pool.allocate("a", &deps(&["x"]), &[]).await.expect("a");
        let report = pool.cleanup().await;
        assert_eq!(report.removed, 1);
        assert!(!a.env_path.exists());
        assert_eq!(pool.status().total, 0);
    }
}
