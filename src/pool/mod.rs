//! Multi-project state pool.
//!
//! The pool is the single owner of per-project long-lived resources: state
//! store, event bus, report-writer factory, worktree manager, and the
//! configuration snapshot. Contexts are built lazily on first reference and
//! evicted LRU, but never while the project has live workflows; when every
//! candidate is live, admission fails with `<PoolExhausted>` instead. The
//! pool map is guarded by a short mutex and is never held across I/O.

mod registry;

pub use registry::{ProjectEntry, ProjectRegistry, ProjectStatus};

use crate::config::{ConfigLoader, ConfigSnapshot};
use crate::errors::{QuorumError, Result};
use crate::event::EventBus;
use crate::report::ReportWriterFactory;
use crate::runner::RunnerRegistry;
use crate::state::StateStore;
use crate::worktree::WorktreeManager;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Per-project bundle of long-lived resources.
#[derive(Debug)]
pub struct ProjectContext {
    pub project_id: String,
    pub root: PathBuf,
    pub store: StateStore,
    pub bus: EventBus,
    pub reports: ReportWriterFactory,
    pub worktrees: WorktreeManager,
    pub config: Arc<ConfigSnapshot>,
    last_access: Mutex<DateTime<Utc>>,
    closed: AtomicBool,
}

impl ProjectContext {
    fn open(project_id: &str, root: &Path, config: Arc<ConfigSnapshot>) -> Result<Self> {
        let quorum_dir = root.join(".quorum");
        let store = StateStore::open(&quorum_dir.join("state"))?;
        let bus = EventBus::new(config.event_queue_capacity);
        let reports = ReportWriterFactory::new(&quorum_dir.join("runs"));
        let worktrees = WorktreeManager::new(root);
        debug!(%project_id, root = %root.display(), "project context opened");
        Ok(Self {
            project_id: project_id.to_string(),
            root: root.to_path_buf(),
            store,
            bus,
            reports,
            worktrees,
            config,
            last_access: Mutex::new(Utc::now()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn touch(&self) {
        *self.last_access.lock().unwrap_or_else(|p| p.into_inner()) = Utc::now();
    }

    pub fn last_access(&self) -> DateTime<Utc> {
        *self.last_access.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Close shared resources. Only the pool calls this, and only when the
    /// project has no live workflows (or the process is shutting down).
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.bus.close();
        debug!(project_id = %self.project_id, "project context closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Map of project id → context, with LRU eviction and registry management.
pub struct ProjectPool {
    registry_path: PathBuf,
    max_projects: usize,
    loader: Arc<dyn ConfigLoader>,
    registry: Mutex<ProjectRegistry>,
    contexts: Mutex<HashMap<String, Arc<ProjectContext>>>,
}

impl ProjectPool {
    /// Read the registry once and start with an empty context map.
    pub fn new(
        registry_path: PathBuf,
        max_projects: usize,
        loader: Arc<dyn ConfigLoader>,
    ) -> Result<Self> {
        let registry = ProjectRegistry::load(&registry_path)?;
        Ok(Self {
            registry_path,
            max_projects: max_projects.max(1),
            loader,
            registry: Mutex::new(registry),
            contexts: Mutex::new(HashMap::new()),
        })
    }

    /// Fetch (or lazily construct) the context for a project.
    pub fn get(&self, project_id: &str) -> Result<Arc<ProjectContext>> {
        let hit = {
            let contexts = self.lock_contexts();
            contexts.get(project_id).cloned()
        };
        if let Some(ctx) = hit {
            // Marker validation happens outside the map lock.
            if !ctx.root.exists() {
                self.lock_contexts().remove(project_id);
                ctx.close();
                return Err(QuorumError::ProjectGone {
                    project_id: project_id.to_string(),
                });
            }
            ctx.touch();
            self.lock_registry().touch(project_id);
            return Ok(ctx);
        }

        let entry = self
            .lock_registry()
            .find(project_id)
            .cloned()
            .ok_or_else(|| {
                QuorumError::InvalidArgument(format!("unknown project {project_id}"))
            })?;
        if !entry.path.exists() {
            return Err(QuorumError::ProjectGone {
                project_id: project_id.to_string(),
            });
        }

        // Construction does I/O, so it happens before re-taking the lock.
        let config = Arc::new(self.loader.load(&entry.path)?);
        let ctx = Arc::new(ProjectContext::open(project_id, &entry.path, config)?);

        loop {
            let candidates = {
                let mut contexts = self.lock_contexts();
                if let Some(existing) = contexts.get(project_id) {
                    // Lost a construction race; the earlier context wins.
                    return Ok(Arc::clone(existing));
                }
                if contexts.len() < self.max_projects {
                    contexts.insert(project_id.to_string(), Arc::clone(&ctx));
                    self.lock_registry().touch(project_id);
                    return Ok(ctx);
                }
                let mut entries: Vec<Arc<ProjectContext>> = contexts.values().cloned().collect();
                entries.sort_by_key(|c| c.last_access());
                entries
            };

            let mut victim = None;
            for candidate in candidates {
                match candidate.store.list_running() {
                    Ok(running) if running.is_empty() => {
                        victim = Some(candidate);
                        break;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        warn!(project_id = %candidate.project_id, %err, "eviction probe failed");
                    }
                }
            }

            let Some(victim) = victim else {
                return Err(QuorumError::PoolExhausted);
            };
            info!(evicted = %victim.project_id, "evicting idle project from pool");
            self.lock_contexts().remove(&victim.project_id);
            victim.close();
        }
    }

    /// Register a project (creating its `.quorum` marker) and persist the
    /// registry file.
    pub fn add_project(&self, id: &str, path: &Path, name: &str) -> Result<()> {
        if !path.exists() {
            return Err(QuorumError::InvalidArgument(format!(
                "project path {} does not exist",
                path.display()
            )));
        }
        std::fs::create_dir_all(path.join(".quorum"))
            .map_err(|e| QuorumError::Io(format!("create project marker: {e}")))?;
        let mut registry = self.lock_registry();
        registry.upsert(ProjectEntry {
            id: id.to_string(),
            path: path.to_path_buf(),
            name: name.to_string(),
            last_accessed: Some(Utc::now()),
            status: ProjectStatus::Active,
        });
        registry.save(&self.registry_path)
    }

    /// Remove a project from the registry. Refuses while workflows run.
    pub fn remove_project(&self, id: &str) -> Result<()> {
        let resident = {
            let contexts = self.lock_contexts();
            contexts.get(id).cloned()
        };
        if let Some(ctx) = resident {
            if !ctx.store.list_running()?.is_empty() {
                return Err(QuorumError::Conflict {
                    workflow_id: id.to_string(),
                    status: "running".to_string(),
                });
            }
            self.lock_contexts().remove(id);
            ctx.close();
        }
        let mut registry = self.lock_registry();
        registry.remove(id);
        registry.save(&self.registry_path)
    }

    pub fn list_projects(&self) -> Vec<ProjectEntry> {
        self.lock_registry().projects.clone()
    }

    pub fn default_project(&self) -> Option<String> {
        self.lock_registry().default_project.clone()
    }

    /// Snapshot of resident contexts, for the sweeper.
    pub fn contexts(&self) -> Vec<Arc<ProjectContext>> {
        self.lock_contexts().values().cloned().collect()
    }

    /// Wait for in-flight workflows to finish (bounded by `drain_timeout`),
    /// then close every context and flush the registry.
    pub async fn shutdown(&self, runners: &RunnerRegistry, drain_timeout: Duration) {
        let deadline = tokio::time::Instant::now() + drain_timeout;
        while !runners.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        if !runners.is_empty() {
            warn!("drain timeout elapsed with workflows still running");
        }
        let drained: Vec<Arc<ProjectContext>> = {
            let mut contexts = self.lock_contexts();
            contexts.drain().map(|(_, ctx)| ctx).collect()
        };
        for ctx in drained {
            ctx.close();
        }
        let registry = self.lock_registry();
        if let Err(err) = registry.save(&self.registry_path) {
            warn!(%err, "failed to flush project registry");
        }
        info!("project pool shut down");
    }

    fn lock_contexts(&self) -> MutexGuard<'_, HashMap<String, Arc<ProjectContext>>> {
        self.contexts.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn lock_registry(&self) -> MutexGuard<'_, ProjectRegistry> {
        self.registry.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::YamlConfigLoader;
    use tempfile::TempDir;

    fn pool_with(dir: &TempDir, max_projects: usize) -> ProjectPool {
        ProjectPool::new(
            dir.path().join("projects.yaml"),
            max_projects,
            Arc::new(YamlConfigLoader),
        )
        .unwrap()
    }

    fn add_project(pool: &ProjectPool, dir: &TempDir, id: &str) -> PathBuf {
        let path = dir.path().join(id);
        std::fs::create_dir_all(&path).unwrap();
        pool.add_project(id, &path, id).unwrap();
        path
    }

    #[test]
    fn test_get_is_lazy_and_cached() {
        let dir = TempDir::new().unwrap();
        let pool = pool_with(&dir, 4);
        add_project(&pool, &dir, "alpha");

        let first = pool.get("alpha").unwrap();
        let second = pool.get("alpha").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(pool.contexts().len(), 1);
    }

    #[test]
    fn test_unknown_project_rejected() {
        let dir = TempDir::new().unwrap();
        let pool = pool_with(&dir, 4);
        let err = pool.get("ghost").unwrap_err();
        assert_eq!(err.kind(), "invalid_argument");
    }

    #[test]
    fn test_vanished_project_is_gone() {
        let dir = TempDir::new().unwrap();
        let pool = pool_with(&dir, 4);
        let path = add_project(&pool, &dir, "alpha");
        pool.get("alpha").unwrap();

        std::fs::remove_dir_all(&path).unwrap();
        let err = pool.get("alpha").unwrap_err();
        assert_eq!(err.kind(), "project_gone");
    }

    #[test]
    fn test_lru_eviction_prefers_idle_projects() {
        let dir = TempDir::new().unwrap();
        let pool = pool_with(&dir, 1);
        add_project(&pool, &dir, "alpha");
        add_project(&pool, &dir, "beta");

        let alpha = pool.get("alpha").unwrap();
        let beta = pool.get("beta").unwrap();
        assert!(alpha.is_closed());
        assert!(!beta.is_closed());
        assert_eq!(pool.contexts().len(), 1);
    }

    #[test]
    fn test_live_project_never_evicted() {
        let dir = TempDir::new().unwrap();
        let pool = pool_with(&dir, 1);
        add_project(&pool, &dir, "alpha");
        add_project(&pool, &dir, "beta");

        let alpha = pool.get("alpha").unwrap();
        alpha.store.mark_running("wf-live").unwrap();

        let err = pool.get("beta").unwrap_err();
        assert_eq!(err.kind(), "pool_exhausted");
        assert!(!alpha.is_closed());

        alpha.store.unmark_running("wf-live").unwrap();
        pool.get("beta").unwrap();
        assert!(alpha.is_closed());
    }

    #[test]
    fn test_remove_project_refuses_live() {
        let dir = TempDir::new().unwrap();
        let pool = pool_with(&dir, 4);
        add_project(&pool, &dir, "alpha");
        let ctx = pool.get("alpha").unwrap();
        ctx.store.mark_running("wf-1").unwrap();
        assert!(pool.remove_project("alpha").is_err());
        ctx.store.unmark_running("wf-1").unwrap();
        pool.remove_project("alpha").unwrap();
        assert!(pool.list_projects().is_empty());
    }
}
