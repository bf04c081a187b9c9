//! Backends en memoria con la misma semántica que los de Postgres.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tune_domain::{AppliedChange, AuditLogEntry, ChangeStatus, Job, JobFilter, JobStatus, Recommendation,
                  RecommendationUpdate};
use uuid::Uuid;

use super::{AuditStore, ChangeStore, JobStore, RecommendationStore, StatusChange};
use crate::errors::StoreError;

#[derive(Default)]
pub struct InMemoryRecommendationStore {
    inner: DashMap<String, Recommendation>,
    failing_updates: AtomicBool,
}

impl InMemoryRecommendationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// `update` falla con un error de backend mientras esté activo.
    #[cfg(any(test, feature = "testing"))]
    pub fn set_failing_updates(&self, failing: bool) {
        self.failing_updates.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl RecommendationStore for InMemoryRecommendationStore {
    async fn get(&self, id: &str) -> Result<Option<Recommendation>, StoreError> {
        Ok(self.inner.get(id).map(|r| r.value().clone()))
    }

    async fn update(&self, id: &str, update: RecommendationUpdate) -> Result<(), StoreError> {
        if self.failing_updates.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("recommendation store unavailable".into()));
        }
        let mut entry = self.inner.get_mut(id).ok_or_else(|| StoreError::NotFound(format!("recommendation {id}")))?;
        update.apply_to(entry.value_mut());
        Ok(())
    }

    async fn upsert(&self, rec: Recommendation) -> Result<(), StoreError> {
        self.inner.insert(rec.id.clone(), rec);
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryJobStore {
    inner: DashMap<Uuid, Job>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create(&self, job: &Job) -> Result<(), StoreError> {
        if self.inner.contains_key(&job.id) {
            return Err(StoreError::Conflict(format!("job {} already exists", job.id)));
        }
        self.inner.insert(job.id, job.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        Ok(self.inner.get(&id).map(|j| j.value().clone()))
    }

    async fn claim(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let Some(mut job) = self.inner.get_mut(&id) else {
            return Ok(false);
        };
        if job.status != JobStatus::Pending {
            return Ok(false);
        }
        job.status = JobStatus::Running;
        job.started_at = Some(at);
        Ok(true)
    }

    async fn update_status(&self, id: Uuid, change: StatusChange) -> Result<bool, StoreError> {
        let Some(mut job) = self.inner.get_mut(&id) else {
            return Err(StoreError::NotFound(format!("job {id}")));
        };
        if job.status.is_terminal() {
            return Ok(false);
        }
        job.status = change.status;
        if change.status.is_terminal() {
            job.completed_at = Some(change.at);
        }
        job.result = change.result;
        job.error_message = change.error_message;
        Ok(true)
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        let mut jobs: Vec<Job> = self.inner.iter().filter(|j| filter.matches(j.value())).map(|j| j.value().clone()).collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = filter.limit {
            jobs.truncate(limit);
        }
        Ok(jobs)
    }

    async fn delete_older_than(&self, age: Duration) -> Result<usize, StoreError> {
        let age = chrono::Duration::from_std(age).map_err(|e| StoreError::Backend(format!("invalid age: {e}")))?;
        let cutoff = Utc::now() - age;
        let before = self.inner.len();
        self.inner.retain(|_, j| !(j.status.is_terminal() && j.created_at < cutoff));
        Ok(before - self.inner.len())
    }
}

#[derive(Default)]
pub struct InMemoryChangeStore {
    inner: DashMap<String, AppliedChange>,
    failing_writes: AtomicBool,
}

impl InMemoryChangeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// `upsert` y `mark_rolled_back` fallan mientras esté activo.
    #[cfg(any(test, feature = "testing"))]
    pub fn set_failing_writes(&self, failing: bool) {
        self.failing_writes.store(failing, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.failing_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("change store unavailable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl ChangeStore for InMemoryChangeStore {
    async fn get(&self, recommendation_id: &str) -> Result<Option<AppliedChange>, StoreError> {
        Ok(self.inner.get(recommendation_id).map(|c| c.value().clone()))
    }

    async fn upsert(&self, change: &AppliedChange) -> Result<(), StoreError> {
        self.check_writable()?;
        self.inner.insert(change.recommendation_id.clone(), change.clone());
        Ok(())
    }

    async fn mark_rolled_back(&self, recommendation_id: &str, at: DateTime<Utc>) -> Result<bool, StoreError> {
        self.check_writable()?;
        let Some(mut change) = self.inner.get_mut(recommendation_id) else {
            return Ok(false);
        };
        if !change.is_active() {
            return Ok(false);
        }
        change.status = ChangeStatus::RolledBack;
        change.rolled_back_at = Some(at);
        Ok(true)
    }

    async fn list(&self) -> Result<Vec<AppliedChange>, StoreError> {
        let mut all: Vec<AppliedChange> = self.inner.iter().map(|c| c.value().clone()).collect();
        all.sort_by(|a, b| b.applied_at.cmp(&a.applied_at));
        Ok(all)
    }
}

/// Audit trail en memoria. Se puede forzar a fallar para verificar que un
/// error de auditoría no rompe la operación auditada.
#[derive(Default)]
pub struct InMemoryAuditStore {
    entries: Mutex<Vec<AuditLogEntry>>,
    failing: AtomicBool,
}

impl InMemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(any(test, feature = "testing"))]
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl AuditStore for InMemoryAuditStore {
    async fn append(&self, entry: &AuditLogEntry) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("audit store unavailable".into()));
        }
        let mut entries = self.entries.lock().map_err(|_| StoreError::Backend("audit store poisoned".into()))?;
        entries.push(entry.clone());
        Ok(())
    }

    async fn list(&self, limit: usize) -> Result<Vec<AuditLogEntry>, StoreError> {
        let entries = self.entries.lock().map_err(|_| StoreError::Backend("audit store poisoned".into()))?;
        Ok(entries.iter().rev().take(limit).cloned().collect())
    }
}
