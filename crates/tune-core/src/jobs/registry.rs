//! Tabla de jobs activos del proceso (encolados o en ejecución).
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tune_domain::JobType;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Queued,
    Running,
    Cancelled,
}

/// Handle de un job activo. `phase` serializa el claim del worker contra
/// `cancel` para que ambos no decidan sobre el mismo job a la vez.
#[derive(Clone)]
pub struct ActiveEntry {
    pub token: CancellationToken,
    pub job_type: JobType,
    pub phase: Arc<Mutex<Phase>>,
}

#[derive(Default)]
pub struct ActiveJobs {
    inner: DashMap<Uuid, ActiveEntry>,
}

impl ActiveJobs {
    pub fn register(&self, job_id: Uuid, job_type: JobType) -> ActiveEntry {
        self.inner
            .entry(job_id)
            .or_insert_with(|| ActiveEntry { token: CancellationToken::new(),
                                             job_type,
                                             phase: Arc::new(Mutex::new(Phase::Queued)) })
            .value()
            .clone()
    }

    pub fn get(&self, job_id: Uuid) -> Option<ActiveEntry> {
        self.inner.get(&job_id).map(|e| e.value().clone())
    }

    pub fn contains(&self, job_id: Uuid) -> bool {
        self.inner.contains_key(&job_id)
    }

    pub fn remove(&self, job_id: Uuid) {
        self.inner.remove(&job_id);
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

/// Quita el job de la tabla al salir del wrapper, por cualquier camino.
pub struct ActiveGuard<'a> {
    jobs: &'a ActiveJobs,
    job_id: Uuid,
}

impl<'a> ActiveGuard<'a> {
    pub fn new(jobs: &'a ActiveJobs, job_id: Uuid) -> Self {
        Self { jobs, job_id }
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.jobs.remove(self.job_id);
    }
}
