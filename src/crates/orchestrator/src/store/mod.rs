//! Persistence port for tasks
//!
//! `TaskStore` is the only code path that writes tasks. Every write goes to
//! SQLite first as a compare-and-set on `version`, then is mirrored into the
//! cache. The cache copy is derivative: hot-path readers may use it, but
//! authoritative reads always come from the durable store and overwrite a
//! divergent cache entry.

use chrono::SubsecRound;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::cache::{keys, CacheError, CacheStore};
use crate::config::CacheConfig;
use crate::db::models::{format_ts, now, TaskRow};
use crate::db::repositories::TaskRepository;
use crate::db::{DatabaseConnection, DatabasePool};
use crate::executor::retry_with_backoff;
use crate::model::{Task, TaskStatus};
use crate::{OrchestratorError, Result};

pub struct TaskStore {
    db: DatabaseConnection,
    cache: Arc<dyn CacheStore>,
    config: CacheConfig,
    max_version_retries: u32,
}

impl TaskStore {
    pub fn new(
        db: DatabaseConnection,
        cache: Arc<dyn CacheStore>,
        config: CacheConfig,
        max_version_retries: u32,
    ) -> Self {
        Self {
            db,
            cache,
            config,
            max_version_retries: max_version_retries.max(1),
        }
    }

    pub fn pool(&self) -> &DatabasePool {
        self.db.pool()
    }

    pub fn cache(&self) -> &Arc<dyn CacheStore> {
        &self.cache
    }

    pub fn cache_config(&self) -> &CacheConfig {
        &self.config
    }

    /// Persist a new task
    pub async fn create(&self, mut task: Task) -> Result<Task> {
        let ts = now();
        task.created_at = ts;
        task.updated_at = ts;
        task.version = task.version.max(1);
        normalize_timestamps(&mut task);

        let row = TaskRow::from_task(&task)?;
        TaskRepository::insert(self.pool(), &row).await?;
        debug!(task_id = %task.id, status = %task.status, "Task persisted");

        self.mirror(&task).await;
        Ok(task)
    }

    async fn load_durable(&self, task_id: &str) -> Result<Task> {
        let row = TaskRepository::get_by_id(self.pool(), task_id)
            .await?
            .ok_or_else(|| OrchestratorError::TaskNotFound(task_id.to_string()))?;
        Ok(row.into_task()?)
    }

    /// Durable read; a cache copy that disagrees is overwritten
    pub async fn load_authoritative(&self, task_id: &str) -> Result<Task> {
        let task = self.load_durable(task_id).await?;

        match self.read_cached(task_id).await {
            Some(cached) if cached == task => {}
            Some(cached) => {
                warn!(
                    task_id = %task_id,
                    cached_version = cached.version,
                    durable_version = task.version,
                    "Cached task diverged from durable store, overwriting"
                );
                self.mirror(&task).await;
            }
            None => self.mirror(&task).await,
        }

        Ok(task)
    }

    /// Cache-first read for the execution hot path
    pub async fn load_hot(&self, task_id: &str) -> Result<Task> {
        if let Some(task) = self.read_cached(task_id).await {
            return Ok(task);
        }

        let task = self.load_durable(task_id).await?;
        self.mirror(&task).await;
        Ok(task)
    }

    /// Read-modify-write with optimistic concurrency
    ///
    /// `f` runs against a fresh durable copy on every attempt and may run
    /// more than once. Returning `Ok(None)` means there is nothing to write;
    /// the unmodified task is returned alongside `None`.
    pub async fn try_update<T, F>(&self, task_id: &str, mut f: F) -> Result<(Task, Option<T>)>
    where
        F: FnMut(&mut Task) -> Result<Option<T>>,
    {
        for attempt in 1..=self.max_version_retries {
            let mut task = self.load_durable(task_id).await?;
            let expected = task.version;

            let value = match f(&mut task)? {
                Some(value) => value,
                None => {
                    let pristine = self.load_durable(task_id).await?;
                    return Ok((pristine, None));
                }
            };

            task.version = expected + 1;
            task.updated_at = now();
            normalize_timestamps(&mut task);

            let row = TaskRow::from_task(&task)?;
            if TaskRepository::update_versioned(self.pool(), &row, expected).await? {
                self.mirror(&task).await;
                return Ok((task, Some(value)));
            }

            debug!(
                task_id = %task_id,
                attempt = attempt,
                expected_version = expected,
                "Version conflict, retrying read-modify-write"
            );
        }

        warn!(
            task_id = %task_id,
            attempts = self.max_version_retries,
            "Giving up after repeated version conflicts"
        );
        Err(OrchestratorError::VersionConflict {
            task_id: task_id.to_string(),
            attempts: self.max_version_retries,
        })
    }

    /// Read-modify-write that always writes
    pub async fn update<F>(&self, task_id: &str, mut f: F) -> Result<Task>
    where
        F: FnMut(&mut Task) -> Result<()>,
    {
        let (task, _) = self
            .try_update(task_id, |task| f(task).map(Some))
            .await?;
        Ok(task)
    }

    pub async fn list_by_status(&self, status: TaskStatus) -> Result<Vec<Task>> {
        let rows = TaskRepository::list_by_status(self.pool(), status.as_str()).await?;
        rows.into_iter()
            .map(|row| row.into_task().map_err(OrchestratorError::from))
            .collect()
    }

    /// Tasks materialized by an automation, newest first
    pub async fn list_by_automation(&self, automation_id: &str) -> Result<Vec<Task>> {
        let rows = TaskRepository::list_by_automation(self.pool(), automation_id).await?;
        rows.into_iter()
            .map(|row| row.into_task().map_err(OrchestratorError::from))
            .collect()
    }

    /// Signal cooperative cancellation
    pub async fn set_cancel_marker(&self, task_id: &str) -> Result<()> {
        let key = keys::cancel(task_id);
        let ttl = self.config.cancel_marker_ttl();
        retry_with_backoff(&self.config.retry, "set_cancel_marker", CacheError::is_transient, || {
            self.cache.set(&key, format_ts(&now()), Some(ttl))
        })
        .await?;
        Ok(())
    }

    /// Whether cancellation was requested
    ///
    /// An unreachable cache reads as "not requested"; the marker is checked
    /// again at the next completion.
    pub async fn is_cancel_requested(&self, task_id: &str) -> bool {
        let key = keys::cancel(task_id);
        match retry_with_backoff(&self.config.retry, "get_cancel_marker", CacheError::is_transient, || {
            self.cache.get(&key)
        })
        .await
        {
            Ok(marker) => marker.is_some(),
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "Could not read cancellation marker");
                false
            }
        }
    }

    async fn read_cached(&self, task_id: &str) -> Option<Task> {
        let key = keys::task(task_id);
        let raw = match retry_with_backoff(&self.config.retry, "cache_get_task", CacheError::is_transient, || {
            self.cache.get(&key)
        })
        .await
        {
            Ok(raw) => raw?,
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "Cache read failed, using durable store");
                return None;
            }
        };

        match serde_json::from_str(&raw) {
            Ok(task) => Some(task),
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "Undecodable cached task ignored");
                None
            }
        }
    }

    /// Write-through mirror of the task and its steps
    ///
    /// The durable write has already succeeded, so a cache failure is logged
    /// and the entries are invalidated rather than surfaced.
    async fn mirror(&self, task: &Task) {
        let mut entries = Vec::with_capacity(task.steps.len() + 1);
        let snapshot = serde_json::to_string(task).and_then(|task_json| {
            entries.push((keys::task(&task.id), task_json));
            for step in &task.steps {
                entries.push((keys::step(&task.id, &step.id), serde_json::to_string(step)?));
            }
            Ok(())
        });
        if let Err(e) = snapshot {
            warn!(task_id = %task.id, error = %e, "Could not serialize task for cache");
            self.invalidate(task).await;
            return;
        }

        let ttl = self.config.task_ttl();
        let result = retry_with_backoff(&self.config.retry, "cache_mirror_task", CacheError::is_transient, || {
            let entries = &entries;
            async move {
                for (key, value) in entries {
                    self.cache.set(key, value.clone(), Some(ttl)).await?;
                }
                Ok::<(), CacheError>(())
            }
        })
        .await;

        if let Err(e) = result {
            warn!(
                task_id = %task.id,
                version = task.version,
                error = %e,
                "Cache write-through failed, invalidating cached task"
            );
            self.invalidate(task).await;
        }
    }

    async fn invalidate(&self, task: &Task) {
        let mut keys_to_drop = vec![keys::task(&task.id)];
        keys_to_drop.extend(task.steps.iter().map(|s| keys::step(&task.id, &s.id)));

        for key in keys_to_drop {
            if let Err(e) = self.cache.delete(&key).await {
                debug!(key = %key, error = %e, "Cache invalidation failed");
            }
        }
    }
}

/// Task-level timestamps at stored precision, so cache and durable copies compare equal
fn normalize_timestamps(task: &mut Task) {
    task.created_at = task.created_at.trunc_subsecs(3);
    task.updated_at = task.updated_at.trunc_subsecs(3);
    task.completed_at = task.completed_at.map(|ts| ts.trunc_subsecs(3));
}
