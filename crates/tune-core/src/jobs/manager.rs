use std::any::Any;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use log::{debug, error, info, warn};
use serde_json::Value;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tune_domain::{Job, JobFilter, JobStatus, JobTask, JobType, WorkItem};
use uuid::Uuid;

use super::registry::{ActiveEntry, ActiveGuard, ActiveJobs, Phase};
use super::runner::JobRunner;
use super::{JobManagerConfig, RecoveryReport};
use crate::errors::{JobError, StoreError};
use crate::store::{JobStore, StatusChange};

struct Running {
    shutdown: CancellationToken,
    dispatcher: JoinHandle<()>,
}

struct Inner {
    store: Arc<dyn JobStore>,
    runner: JobRunner,
    config: JobManagerConfig,
    sender: mpsc::Sender<WorkItem>,
    receiver: tokio::sync::Mutex<mpsc::Receiver<WorkItem>>,
    active: ActiveJobs,
    permits: Arc<Semaphore>,
    lifecycle: Mutex<Option<Running>>,
}

impl Inner {
    fn lifecycle(&self) -> MutexGuard<'_, Option<Running>> {
        self.lifecycle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Encola sin bloquear al llamador. Con la cola llena el envío se
    /// completa en segundo plano; el registro durable ya existe.
    fn enqueue(&self, item: WorkItem) {
        match self.sender.try_send(item) {
            Ok(()) => {}
            Err(TrySendError::Full(item)) => {
                debug!("enqueue:queue_full job_id={} -> background send", item.job_id);
                let sender = self.sender.clone();
                tokio::spawn(async move {
                    let job_id = item.job_id;
                    if sender.send(item).await.is_err() {
                        warn!("enqueue:queue_closed job_id={job_id} (stays pending until recover)");
                    }
                });
            }
            Err(TrySendError::Closed(item)) => {
                warn!("enqueue:queue_closed job_id={} (stays pending until recover)", item.job_id);
            }
        }
    }
}

/// Cola durable de jobs con dispatcher único y ejecución concurrente acotada.
///
/// Clonar comparte el mismo manager.
#[derive(Clone)]
pub struct JobManager {
    inner: Arc<Inner>,
}

impl JobManager {
    pub fn new(store: Arc<dyn JobStore>, runner: JobRunner, config: JobManagerConfig) -> Self {
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let permits = Arc::new(Semaphore::new(config.max_concurrency.max(1)));
        Self { inner: Arc::new(Inner { store,
                                       runner,
                                       config,
                                       sender,
                                       receiver: tokio::sync::Mutex::new(receiver),
                                       active: ActiveJobs::default(),
                                       permits,
                                       lifecycle: Mutex::new(None) }) }
    }

    pub fn config(&self) -> &JobManagerConfig {
        &self.inner.config
    }

    /// Persiste un job `pending` y lo encola. Devuelve el id aunque la cola
    /// esté momentáneamente llena.
    pub async fn submit(&self, recommendation_id: &str, job_type: JobType) -> Result<Uuid, JobError> {
        let job = Job::new(recommendation_id, job_type);
        self.inner.store.create(&job).await?;
        let task = JobTask::for_type(job_type, recommendation_id, self.inner.config.sample_percent);
        self.inner.active.register(job.id, job_type);
        self.inner.enqueue(WorkItem { job_id: job.id, task });
        info!("submit:queued job_id={} type={} recommendation_id={recommendation_id}", job.id, job_type.as_str());
        Ok(job.id)
    }

    /// Arranca el dispatcher. `false` (no-op) si ya estaba corriendo.
    pub fn start(&self) -> bool {
        let mut lifecycle = self.inner.lifecycle();
        if lifecycle.is_some() {
            warn!("start:already_running");
            return false;
        }
        let shutdown = CancellationToken::new();
        let dispatcher = tokio::spawn(dispatch_loop(Arc::clone(&self.inner), shutdown.clone()));
        *lifecycle = Some(Running { shutdown, dispatcher });
        info!("start:dispatcher_started max_concurrency={}", self.inner.config.max_concurrency);
        true
    }

    pub fn is_running(&self) -> bool {
        self.inner.lifecycle().is_some()
    }

    /// Detiene el dispatcher y cancela las ejecuciones en curso. Vuelve
    /// cuando todas terminaron, limpieza incluida. Los jobs aún encolados
    /// quedan `pending` para el próximo `start`.
    pub async fn stop(&self) {
        let running = self.inner.lifecycle().take();
        let Some(running) = running else {
            debug!("stop:not_running");
            return;
        };
        running.shutdown.cancel();
        if let Err(e) = running.dispatcher.await {
            error!("stop:dispatcher_join_failed err={e}");
        }
        info!("stop:dispatcher_stopped");
    }

    pub async fn status(&self, job_id: Uuid) -> Result<Option<Job>, JobError> {
        Ok(self.inner.store.get(job_id).await?)
    }

    pub async fn list(&self, filter: JobFilter) -> Result<Vec<Job>, JobError> {
        Ok(self.inner.store.list(&filter).await?)
    }

    /// Cancela un job activo de este proceso. `true` sólo si el job no había
    /// alcanzado un estado terminal y quedó `cancelled`. Vale también para
    /// un apply / rollback en ejecución: si la sentencia ya corrió, su
    /// registro termina igual.
    pub async fn cancel(&self, job_id: Uuid) -> Result<bool, JobError> {
        let Some(entry) = self.inner.active.get(job_id) else {
            debug!("cancel:not_active job_id={job_id}");
            return Ok(false);
        };
        let mut phase = entry.phase.lock().await;
        if *phase == Phase::Cancelled {
            return Ok(false);
        }
        let changed = self.inner.store.update_status(job_id, StatusChange::cancelled()).await?;
        if changed {
            *phase = Phase::Cancelled;
            entry.token.cancel();
            info!("cancel:done job_id={job_id} type={}", entry.job_type.as_str());
        }
        Ok(changed)
    }

    /// Borra jobs terminales creados antes de `now - age`.
    pub async fn cleanup_older_than(&self, age: Duration) -> Result<usize, JobError> {
        let removed = self.inner.store.delete_older_than(age).await?;
        if removed > 0 {
            info!("cleanup_older_than:done removed={removed}");
        }
        Ok(removed)
    }

    /// Reconciliación al arrancar el proceso: los `running` sin dueño pasan
    /// a `error` y los `pending` se reencolan (más viejos primero).
    pub async fn recover(&self) -> Result<RecoveryReport, JobError> {
        let mut report = RecoveryReport::default();
        let running = self.list_by_status(JobStatus::Running).await?;
        for job in running {
            if self.inner.active.contains(job.id) {
                continue;
            }
            let change = StatusChange::error("interrupted by process restart");
            if self.inner.store.update_status(job.id, change).await? {
                report.interrupted += 1;
            }
        }

        let mut pending = self.list_by_status(JobStatus::Pending).await?;
        pending.reverse();
        for job in pending {
            if self.inner.active.contains(job.id) {
                continue;
            }
            let task = JobTask::for_type(job.job_type, job.recommendation_id.as_str(), self.inner.config.sample_percent);
            self.inner.active.register(job.id, job.job_type);
            self.inner.enqueue(WorkItem { job_id: job.id, task });
            report.requeued += 1;
        }
        info!("recover:done interrupted={} requeued={}", report.interrupted, report.requeued);
        Ok(report)
    }

    async fn list_by_status(&self, status: JobStatus) -> Result<Vec<Job>, StoreError> {
        self.inner.store.list(&JobFilter { status: Some(status), ..Default::default() }).await
    }

    /// Jobs encolados o en ejecución en este proceso.
    pub fn active_count(&self) -> usize {
        self.inner.active.len()
    }
}

async fn dispatch_loop(inner: Arc<Inner>, shutdown: CancellationToken) {
    let mut executions: JoinSet<()> = JoinSet::new();
    let mut receiver = inner.receiver.lock().await;
    debug!("dispatch_loop:start");
    loop {
        let item = tokio::select! {
            _ = shutdown.cancelled() => break,
            Some(joined) = executions.join_next(), if !executions.is_empty() => {
                if let Err(e) = joined {
                    error!("dispatch_loop:execution_join_failed err={e}");
                }
                continue;
            }
            polled = tokio::time::timeout(inner.config.poll_interval, receiver.recv()) => match polled {
                Err(_) => continue,
                Ok(Some(item)) => item,
                Ok(None) => {
                    error!("dispatch_loop:queue_closed backoff_ms={}", inner.config.error_backoff.as_millis());
                    tokio::time::sleep(inner.config.error_backoff).await;
                    continue;
                }
            },
        };

        let permit = tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("dispatch_loop:shutdown_before_permit job_id={}", item.job_id);
                inner.enqueue(item);
                break;
            }
            permit = Arc::clone(&inner.permits).acquire_owned() => match permit {
                Ok(p) => p,
                Err(_) => {
                    error!("dispatch_loop:semaphore_closed");
                    break;
                }
            },
        };

        let entry = inner.active
                         .get(item.job_id)
                         .unwrap_or_else(|| inner.active.register(item.job_id, item.task.job_type()));
        let job_inner = Arc::clone(&inner);
        let job_shutdown = shutdown.clone();
        executions.spawn(async move {
            let _permit = permit;
            run_job(job_inner, item, entry, job_shutdown).await;
        });
    }
    drop(receiver);
    debug!("dispatch_loop:draining in_flight={}", executions.len());
    while let Some(joined) = executions.join_next().await {
        if let Err(e) = joined {
            error!("dispatch_loop:execution_join_failed err={e}");
        }
    }
    debug!("dispatch_loop:stopped");
}

enum Exit {
    Finished(Result<Result<Value, JobError>, JoinError>),
    Cancelled,
    Shutdown,
}

/// Wrapper de una ejecución: claim, ejecución en task propia, limpieza del
/// sandbox y estado terminal, en ese orden y por cualquier camino.
async fn run_job(inner: Arc<Inner>, item: WorkItem, entry: ActiveEntry, shutdown: CancellationToken) {
    let job_id = item.job_id;
    let _guard = ActiveGuard::new(&inner.active, job_id);
    {
        let mut phase = entry.phase.lock().await;
        if *phase == Phase::Cancelled || entry.token.is_cancelled() {
            debug!("run_job:skip_cancelled job_id={job_id}");
            return;
        }
        match inner.store.claim(job_id, Utc::now()).await {
            Ok(true) => *phase = Phase::Running,
            Ok(false) => {
                debug!("run_job:not_claimable job_id={job_id}");
                return;
            }
            Err(e) => {
                error!("run_job:claim_failed job_id={job_id} err={e}");
                return;
            }
        }
    }
    let job_type = item.task.job_type();
    debug!("run_job:start job_id={job_id} type={}", job_type.as_str());

    let exec_inner = Arc::clone(&inner);
    let task = item.task;
    let mut handle = tokio::spawn(async move { exec_inner.runner.execute(job_id, &task).await });

    // El registro de un apply / rollback ya ejecutado sobrevive al abort.
    let exit = tokio::select! {
        joined = &mut handle => Exit::Finished(joined),
        _ = entry.token.cancelled() => Exit::Cancelled,
        _ = shutdown.cancelled() => Exit::Shutdown,
    };
    if !matches!(exit, Exit::Finished(_)) {
        handle.abort();
        let _ = handle.await;
    }

    if job_type == JobType::Benchmark {
        inner.runner.cleanup(job_id).await;
    }

    let change = match exit {
        Exit::Finished(Ok(Ok(value))) => StatusChange::completed(value),
        Exit::Finished(Ok(Err(e))) => StatusChange::error(e.to_string()),
        Exit::Finished(Err(e)) if e.is_panic() => StatusChange::error(format!("job panicked: {}", panic_message(e.into_panic()))),
        Exit::Finished(Err(e)) => StatusChange::error(format!("job aborted: {e}")),
        Exit::Cancelled => StatusChange::cancelled(),
        Exit::Shutdown => StatusChange::cancelled_with("cancelled: manager stopped"),
    };
    let status = change.status;
    match inner.store.update_status(job_id, change).await {
        Ok(true) => info!("run_job:done job_id={job_id} status={}", status.as_str()),
        Ok(false) => debug!("run_job:terminal_already_set job_id={job_id} ignored={}", status.as_str()),
        Err(e) => error!("run_job:status_write_failed job_id={job_id} err={e}"),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
