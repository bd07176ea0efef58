//! Pool of isolated workspaces.
//!
//! Capacity is a counting semaphore sized to the pool ceiling. Every workspace
//! that is owned by a task (or being reset after one) holds a permit; idle
//! workspaces hold none. Allocation waits for a permit, then takes an idle
//! workspace or creates one on demand.
//!
//! A workspace whose reset fails is destroyed rather than reused; the pool
//! recreates capacity lazily on the next allocation.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use crate::error::OrchestratorError;

/// A freshly created workspace, as reported by a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedWorkspace {
    pub id: String,
    pub path: PathBuf,
    pub branch: String,
}

/// Creates, resets, and destroys workspaces. Calls may block.
pub trait WorkspaceBackend: Send + Sync + 'static {
    /// Create a workspace on a new, uniquely named branch. `slot` is a pool-local counter.
    fn create(&self, slot: usize) -> Result<CreatedWorkspace>;

    /// Discard uncommitted changes and task artifacts, moving the workspace to
    /// `target` (or the pool's base revision when `None`).
    fn reset(&self, path: &Path, target: Option<&str>) -> Result<()>;

    /// Remove the workspace directory and its branch.
    fn destroy(&self, path: &Path, branch: &str) -> Result<()>;
}

/// Snapshot of one pooled workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkspaceHandle {
    pub id: String,
    pub path: PathBuf,
    pub branch_name: String,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub is_available: bool,
    pub owning_task_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkspacePoolSettings {
    /// Maximum number of workspaces alive at once.
    pub capacity: usize,
    pub allocation_wait: Duration,
    /// Idle workspaces unused for longer than this are evicted by [`WorkspacePool::evict_stale`].
    pub ttl: Duration,
    pub init_parallelism: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkspacePoolStatus {
    pub capacity: usize,
    pub total: usize,
    pub available: usize,
    pub in_use: usize,
    pub allocations: u64,
    pub allocation_timeouts: u64,
    pub replacements: u64,
    pub evictions: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub removed: usize,
    pub failed: usize,
}

#[derive(Debug)]
enum SlotState {
    Idle,
    Owned {
        task_id: String,
        permit: OwnedSemaphorePermit,
    },
    /// Released by its task, reset in progress. Still holds the permit.
    Resetting,
}

#[derive(Debug)]
struct Slot {
    handle: WorkspaceHandle,
    last_used: Instant,
    state: SlotState,
}

#[derive(Debug, Default)]
struct PoolState {
    slots: HashMap<String, Slot>,
    idle: VecDeque<String>,
    next_slot: usize,
    allocations: u64,
    allocation_timeouts: u64,
    replacements: u64,
    evictions: u64,
}

impl PoolState {
    fn owned_by(&self, task_id: &str) -> Option<String> {
        self.slots.iter().find_map(|(id, slot)| match &slot.state {
            SlotState::Owned { task_id: owner, .. } if owner == task_id => Some(id.clone()),
            _ => None,
        })
    }

    fn insert(&mut self, created: CreatedWorkspace, state: SlotState) -> WorkspaceHandle {
        let now = Utc::now();
        let owner = match &state {
            SlotState::Owned { task_id, .. } => Some(task_id.clone()),
            _ => None,
        };
        let handle = WorkspaceHandle {
            id: created.id.clone(),
            path: created.path,
            branch_name: created.branch,
            created_at: now,
            last_used_at: now,
            is_available: owner.is_none(),
            owning_task_id: owner,
        };
        if matches!(state, SlotState::Idle) {
            self.idle.push_back(created.id.clone());
        }
        self.slots.insert(
            created.id,
            Slot {
                handle: handle.clone(),
                last_used: Instant::now(),
                state,
            },
        );
        handle
    }

    fn reserve_slot(&mut self) -> usize {
        let slot = self.next_slot;
        self.next_slot += 1;
        slot
    }
}

pub struct WorkspacePool<B: WorkspaceBackend> {
    backend: Arc<B>,
    settings: WorkspacePoolSettings,
    permits: Arc<Semaphore>,
    state: Mutex<PoolState>,
}

impl<B: WorkspaceBackend> WorkspacePool<B> {
    pub fn new(backend: B, settings: WorkspacePoolSettings) -> Self {
        let settings = WorkspacePoolSettings {
            capacity: settings.capacity.max(1),
            init_parallelism: settings.init_parallelism.max(1),
            ..settings
        };
        Self {
            backend: Arc::new(backend),
            permits: Arc::new(Semaphore::new(settings.capacity)),
            settings,
            state: Mutex::new(PoolState::default()),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn capacity(&self) -> usize {
        self.settings.capacity
    }

    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pre-create up to `pool_size` workspaces (bounded by capacity) in parallel.
    ///
    /// Individual failures are logged and shrink the warm pool; the realized
    /// number of workspaces is returned. Intended to run before tasks are scheduled.
    #[instrument(skip_all, fields(pool_size))]
    pub async fn initialize(&self, pool_size: usize) -> usize {
        let target = pool_size.min(self.settings.capacity);
        let missing = target.saturating_sub(self.state().slots.len());
        let limiter = Arc::new(Semaphore::new(self.settings.init_parallelism));
        let mut set = JoinSet::new();

        for _ in 0..missing {
            // Creation holds a capacity permit so concurrent allocation cannot overshoot.
            let Ok(permit) = self.permits.clone().try_acquire_owned() else {
                break;
            };
            let slot = self.state().reserve_slot();
            let backend = Arc::clone(&self.backend);
            let limiter = Arc::clone(&limiter);
            set.spawn(async move {
                let _throttle = limiter.acquire_owned().await;
                let created = tokio::task::spawn_blocking(move || backend.create(slot)).await;
                (slot, created, permit)
            });
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((_, Ok(Ok(created)), permit)) => {
                    debug!(id = %created.id, "workspace warmed");
                    self.state().insert(created, SlotState::Idle);
                    drop(permit);
                }
                Ok((slot, Ok(Err(err)), _)) => {
                    warn!(slot, err = %format!("{err:#}"), "workspace creation failed during warm-up");
                }
                Ok((slot, Err(err), _)) => {
                    warn!(slot, err = %err, "workspace creation panicked during warm-up");
                }
                Err(err) => warn!(err = %err, "warm-up worker failed"),
            }
        }

        let realized = self.state().slots.len();
        if realized < target {
            warn!(realized, target, "workspace pool below requested size");
        } else {
            info!(realized, "workspace pool ready");
        }
        realized
    }

    /// Take exclusive ownership of a workspace for `task_id`.
    #[instrument(skip_all, fields(task_id))]
    pub async fn allocate(&self, task_id: &str) -> Result<WorkspaceHandle, OrchestratorError> {
        if self.state().owned_by(task_id).is_some() {
            return Err(OrchestratorError::InvalidEnvelope(format!(
                "task {task_id} already holds a workspace"
            )));
        }

        let wait = self.settings.allocation_wait;
        let permit = match tokio::time::timeout(wait, self.permits.clone().acquire_owned()).await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                return Err(OrchestratorError::ProvisioningFailure(
                    "workspace pool is shut down".to_string(),
                ));
            }
            Err(_) => {
                self.state().allocation_timeouts += 1;
                warn!(waited = ?wait, "no workspace became available");
                return Err(OrchestratorError::AllocationTimeout {
                    resource: "workspace",
                    waited: wait,
                });
            }
        };

        let slot_number = {
            let mut state = self.state();
            if let Some(id) = state.idle.pop_front() {
                state.allocations += 1;
                if let Some(slot) = state.slots.get_mut(&id) {
                    slot.state = SlotState::Owned {
                        task_id: task_id.to_string(),
                        permit,
                    };
                    slot.last_used = Instant::now();
                    slot.handle.is_available = false;
                    slot.handle.owning_task_id = Some(task_id.to_string());
                    slot.handle.last_used_at = Utc::now();
                    debug!(id = %id, "allocated pooled workspace");
                    return Ok(slot.handle.clone());
                }
                return Err(OrchestratorError::ProvisioningFailure(format!(
                    "idle workspace {id} missing from pool"
                )));
            }
            state.reserve_slot()
        };

        // Capacity was free but nothing idle: create on demand.
        let backend = Arc::clone(&self.backend);
        let created = tokio::task::spawn_blocking(move || backend.create(slot_number))
            .await
            .map_err(|err| {
                OrchestratorError::ProvisioningFailure(format!("workspace creation panicked: {err}"))
            })?
            .map_err(|err| OrchestratorError::provisioning(&err))?;

        let mut state = self.state();
        state.allocations += 1;
        info!(id = %created.id, "created workspace on demand");
        Ok(state.insert(
            created,
            SlotState::Owned {
                task_id: task_id.to_string(),
                permit,
            },
        ))
    }

    /// Reset the workspace owned by `task_id` while keeping ownership.
    ///
    /// Used to move to a task's base branch and to clean up between attempts.
    pub async fn refresh(&self, task_id: &str, target: Option<&str>) -> Result<(), OrchestratorError> {
        let path = {
            let state = self.state();
            let id = state.owned_by(task_id).ok_or_else(|| {
                OrchestratorError::ProvisioningFailure(format!("task {task_id} holds no workspace"))
            })?;
            state.slots[&id].handle.path.clone()
        };
        let backend = Arc::clone(&self.backend);
        let target = target.map(str::to_string);
        tokio::task::spawn_blocking(move || backend.reset(&path, target.as_deref()))
            .await
            .map_err(|err| OrchestratorError::ProvisioningFailure(format!("reset panicked: {err}")))?
            .map_err(|err| OrchestratorError::provisioning(&err))
    }

    /// Return the workspace owned by `task_id` to the pool.
    ///
    /// Releasing a task that owns nothing logs a warning and does nothing.
    #[instrument(skip_all, fields(task_id))]
    pub async fn release(&self, task_id: &str) {
        let (id, path, branch, permit) = {
            let mut state = self.state();
            let Some(id) = state.owned_by(task_id) else {
                warn!("release for task without a workspace ignored");
                return;
            };
            let Some(slot) = state.slots.get_mut(&id) else {
                return;
            };
            let previous = std::mem::replace(&mut slot.state, SlotState::Resetting);
            slot.handle.owning_task_id = None;
            let permit = match previous {
                SlotState::Owned { permit, .. } => Some(permit),
                _ => None,
            };
            (
                id,
                slot.handle.path.clone(),
                slot.handle.branch_name.clone(),
                permit,
            )
        };

        let backend = Arc::clone(&self.backend);
        let reset_path = path.clone();
        let reset = tokio::task::spawn_blocking(move || backend.reset(&reset_path, None)).await;
        let reset_error = match reset {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(format!("{err:#}")),
            Err(err) => Some(format!("reset panicked: {err}")),
        };

        match reset_error {
            None => {
                let mut state = self.state();
                if let Some(slot) = state.slots.get_mut(&id) {
                    slot.state = SlotState::Idle;
                    slot.last_used = Instant::now();
                    slot.handle.is_available = true;
                    slot.handle.last_used_at = Utc::now();
                    state.idle.push_back(id.clone());
                    debug!(id = %id, "workspace returned to pool");
                }
            }
            Some(err) => {
                warn!(id = %id, err = %err, "workspace reset failed, discarding it");
                {
                    let mut state = self.state();
                    state.slots.remove(&id);
                    state.replacements += 1;
                }
                let backend = Arc::clone(&self.backend);
                let destroyed =
                    tokio::task::spawn_blocking(move || backend.destroy(&path, &branch)).await;
                if !matches!(destroyed, Ok(Ok(()))) {
                    warn!(id = %id, "failed to destroy discarded workspace");
                }
            }
        }
        drop(permit);
    }

    /// Destroy idle workspaces unused for longer than the TTL. Returns how many were evicted.
    pub async fn evict_stale(&self) -> usize {
        let ttl = self.settings.ttl;
        let stale: Vec<Slot> = {
            let mut state = self.state();
            let ids: Vec<String> = state
                .idle
                .iter()
                .filter(|id| {
                    state
                        .slots
                        .get(*id)
                        .is_some_and(|slot| slot.last_used.elapsed() > ttl)
                })
                .cloned()
                .collect();
            state.idle.retain(|id| !ids.contains(id));
            state.evictions += ids.len() as u64;
            ids.iter().filter_map(|id| state.slots.remove(id)).collect()
        };

        let evicted = stale.len();
        for slot in stale {
            info!(id = %slot.handle.id, "evicting stale workspace");
            self.destroy_handle(slot.handle).await;
        }
        evicted
    }

    /// Destroy every workspace, owned or idle, and stop further allocation.
    #[instrument(skip_all)]
    pub async fn cleanup(&self) -> CleanupReport {
        self.permits.close();
        let slots: Vec<Slot> = {
            let mut state = self.state();
            state.idle.clear();
            state.slots.drain().map(|(_, slot)| slot).collect()
        };

        let mut report = CleanupReport::default();
        for slot in slots {
            if let SlotState::Owned { task_id, .. } = &slot.state {
                warn!(task_id = %task_id, id = %slot.handle.id, "destroying workspace still in use");
            }
            if self.destroy_handle(slot.handle).await {
                report.removed += 1;
            } else {
                report.failed += 1;
            }
        }
        info!(removed = report.removed, failed = report.failed, "workspace pool cleaned up");
        report
    }

    async fn destroy_handle(&self, handle: WorkspaceHandle) -> bool {
        let backend = Arc::clone(&self.backend);
        let id = handle.id.clone();
        let result =
            tokio::task::spawn_blocking(move || backend.destroy(&handle.path, &handle.branch_name))
                .await;
        match result {
            Ok(Ok(())) => true,
            Ok(Err(err)) => {
                warn!(id = %id, err = %format!("{err:#}"), "failed to destroy workspace");
                false
            }
            Err(err) => {
                warn!(id = %id, err = %err, "workspace destroy panicked");
                false
            }
        }
    }

    pub fn status(&self) -> WorkspacePoolStatus {
        let state = self.state();
        let available = state.idle.len();
        let total = state.slots.len();
        WorkspacePoolStatus {
            capacity: self.settings.capacity,
            total,
            available,
            in_use: total - available,
            allocations: state.allocations,
            allocation_timeouts: state.allocation_timeouts,
            replacements: state.replacements,
            evictions: state.evictions,
        }
    }

    /// Snapshot of all handles, sorted by id.
    pub fn handles(&self) -> Vec<WorkspaceHandle> {
        let mut handles: Vec<WorkspaceHandle> = self
            .state()
            .slots
            .values()
            .map(|slot| slot.handle.clone())
            .collect();
        handles.sort_by(|a, b| a.id.cmp(&b.id));
        handles
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeWorkspaces;

    fn settings(capacity: usize) -> WorkspacePoolSettings {
        WorkspacePoolSettings {
            capacity,
            allocation_wait: Duration::from_millis(200),
            ttl: Duration::from_secs(60),
            init_parallelism: 2,
        }
    }

    fn assert_balanced<B: WorkspaceBackend>(pool: &WorkspacePool<B>) {
        let status = pool.status();
        assert_eq!(status.available + status.in_use, status.total);
    }

    #[tokio::test]
    async fn initialize_reports_realized_size() {
        let backend = FakeWorkspaces::default();
        backend.fail_creates(1);
        let pool = WorkspacePool::new(backend, settings(3));
        assert_eq!(pool.initialize(3).await, 2);
        assert_eq!(pool.status().available, 2);
    }

    #[tokio::test]
    async fn allocation_is_exclusive_and_times_out() {
        let pool = WorkspacePool::new(FakeWorkspaces::default(), settings(2));
        pool.initialize(2).await;

        let a = pool.allocate("a").await.expect("a");
        let b = pool.allocate("b").await.expect("b");
        assert_ne!(a.id, b.id);
        assert_eq!(a.owning_task_id.as_deref(), Some("a"));
        assert_balanced(&pool);

        let err = pool.allocate("c").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::AllocationTimeout { .. }));
        assert_eq!(pool.status().allocation_timeouts, 1);

        pool.release("a").await;
        let c = pool.allocate("c").await.expect("c");
        assert_eq!(c.id, a.id);
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let pool = WorkspacePool::new(FakeWorkspaces::default(), settings(1));
        pool.initialize(1).await;
        pool.allocate("a").await.expect("a");

        pool.release("a").await;
        pool.release("a").await;
        pool.release("never-allocated").await;

        let status = pool.status();
        assert_eq!(status.total, 1);
        assert_eq!(status.available, 1);
        assert_eq!(status.in_use, 0);
        pool.allocate("b").await.expect("capacity restored");
    }

    #[tokio::test]
    async fn creates_on_demand_without_warm_up() {
        let backend = FakeWorkspaces::default();
        let pool = WorkspacePool::new(backend, settings(2));
        let handle = pool.allocate("a").await.expect("a");
        assert!(handle.path.exists());
        assert_eq!(pool.status().total, 1);
        assert_eq!(pool.backend().create_count(), 1);
    }

    #[tokio::test]
    async fn failed_reset_discards_workspace() {
        let backend = FakeWorkspaces::default();
        let pool = WorkspacePool::new(backend, settings(1));
        pool.initialize(1).await;
        let first = pool.allocate("a").await.expect("a");

        pool.backend().fail_resets(1);
        pool.release("a").await;

        let status = pool.status();
        assert_eq!(status.total, 0);
        assert_eq!(status.replacements, 1);
        assert!(!first.path.exists());

        let second = pool.allocate("b").await.expect("recreated");
        assert_ne!(second.id, first.id);
    }

    #[tokio::test]
    async fn evicts_only_stale_idle_workspaces() {
        let pool = WorkspacePool::new(
            FakeWorkspaces::default(),
            WorkspacePoolSettings {
                ttl: Duration::from_millis(20),
                ..settings(2)
            },
        );
        pool.initialize(2).await;
        pool.allocate("busy").await.expect("busy");
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(pool.evict_stale().await, 1);
        let status = pool.status();
        assert_eq!(status.total, 1);
        assert_eq!(status.in_use, 1);
        assert_balanced(&pool);
    }

    #[tokio::test]
    async fn cleanup_destroys_everything() {
        let pool = WorkspacePool::new(FakeWorkspaces::default(), settings(2));
        pool.initialize(2).await;
        let held = pool.allocate("a").await.expect("a");

        let report = pool.cleanup().await;
        assert_eq!(report, CleanupReport { removed: 2, failed: 0 });
        assert_eq!(pool.status().total, 0);
        assert!(!held.path.exists());
        assert!(pool.allocate("b").await.is_err());
    }
}
