//! Ensamblado del servicio: stores durables, pools destino y los cuatro
//! componentes (selector, Schema Manager, Apply Manager, Job Manager), más
//! el ciclo de mantenimiento que corre `serve`.
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tune_core::{ApplyManager, AuditSink, AuditStore, ChangeStore, DbError, JobManager, JobRunner, JobStore, PoolConnector,
                RecommendationStore, SchemaManager, SqlPool, SqlSession, TargetSelector};
use tune_domain::{Job, JobType, Recommendation};
use tune_persistence::{build_pool, PgAuditStore, PgChangeStore, PgJobStore, PgRecommendationStore, PoolProvider,
                       SqlxConnector, SqlxPool};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::errors::AppError;

/// Stores durables que consume el servicio.
#[derive(Clone)]
pub struct Stores {
    pub recommendations: Arc<dyn RecommendationStore>,
    pub jobs: Arc<dyn JobStore>,
    pub changes: Arc<dyn ChangeStore>,
    pub audit: Arc<dyn AuditStore>,
}

/// Bases destino. Cualquiera puede faltar; el selector y los managers
/// degradan a "no disponible".
#[derive(Clone, Default)]
pub struct Targets {
    pub primary: Option<Arc<dyn SqlPool>>,
    pub replica: Option<Arc<dyn PoolConnector>>,
    pub sandbox: Option<Arc<dyn SqlPool>>,
}

/// Pool para un destino sin configurar: toda adquisición falla con un error
/// de conexión explícito.
struct UnconfiguredPool {
    label: &'static str,
}

#[async_trait]
impl SqlPool for UnconfiguredPool {
    async fn acquire(&self) -> Result<Box<dyn SqlSession>, DbError> {
        Err(DbError::Connection(format!("{} database not configured", self.label)))
    }

    fn label(&self) -> String {
        self.label.to_string()
    }
}

pub struct Service {
    pub config: AppConfig,
    pub stores: Stores,
    pub targets: Arc<TargetSelector>,
    pub schemas: Arc<SchemaManager>,
    pub apply: Arc<ApplyManager>,
    pub jobs: JobManager,
}

impl Service {
    /// Conecta el store (migraciones incluidas) y arma los pools destino en
    /// modo diferido: un destino caído no impide arrancar.
    pub async fn connect(config: AppConfig) -> Result<Self, AppError> {
        let store_cfg = config.store.clone();
        let pool = tokio::task::spawn_blocking(move || {
                       build_pool(&store_cfg.url, store_cfg.min_connections, store_cfg.max_connections)
                   }).await
                     .map_err(|e| AppError::Config(format!("store pool task failed: {e}")))??;
        let provider = || PoolProvider { pool: pool.clone() };
        let stores = Stores { recommendations: Arc::new(PgRecommendationStore::new(provider())),
                              jobs: Arc::new(PgJobStore::new(provider())),
                              changes: Arc::new(PgChangeStore::new(provider())),
                              audit: Arc::new(PgAuditStore::new(provider())) };

        let mut targets = Targets::default();
        if let Some(cfg) = config.primary_pool() {
            targets.primary = Some(Arc::new(SqlxPool::connect_lazy(&cfg)?));
        }
        if let Some(cfg) = config.replica_pool() {
            targets.replica = Some(Arc::new(SqlxConnector::new(cfg)));
        }
        if let Some(cfg) = config.sandbox_pool() {
            targets.sandbox = Some(Arc::new(SqlxPool::connect_lazy(&cfg)?));
        }
        info!("service:connected primary={} replica={} sandbox={}",
              targets.primary.is_some(),
              targets.replica.is_some(),
              targets.sandbox.is_some());
        Ok(Self::assemble(config, stores, targets))
    }

    pub fn assemble(config: AppConfig, stores: Stores, targets: Targets) -> Self {
        let mut selector = TargetSelector::new(config.replica.clone());
        if let Some(primary) = targets.primary {
            selector = selector.with_primary(primary);
        }
        if let Some(replica) = targets.replica {
            selector = selector.with_replica(replica);
        }
        let selector = Arc::new(selector);
        let schemas = Arc::new(SchemaManager::new(Arc::clone(&selector), config.sandbox.clone()));
        let sandbox = targets.sandbox.unwrap_or_else(|| Arc::new(UnconfiguredPool { label: "sandbox" }) as Arc<dyn SqlPool>);
        let apply = Arc::new(ApplyManager::new(sandbox,
                                               Arc::clone(&stores.recommendations),
                                               Arc::clone(&stores.changes),
                                               AuditSink::new(Arc::clone(&stores.audit), config.environment.clone())));
        let runner = JobRunner::new(Arc::clone(&schemas), Arc::clone(&apply), Arc::clone(&stores.recommendations));
        let jobs = JobManager::new(Arc::clone(&stores.jobs), runner, config.jobs.clone());
        Self { config, stores, targets: selector, schemas, apply, jobs }
    }

    /// Encola un job, arranca el dispatcher si hacía falta y espera su estado
    /// terminal. Vencido `timeout` cancela el job y devuelve su último estado.
    pub async fn submit_and_wait(&self, recommendation_id: &str, job_type: JobType, timeout: Duration) -> Result<Job, AppError> {
        let started_here = self.jobs.start();
        let id = self.jobs.submit(recommendation_id, job_type).await?;
        let outcome = self.wait_terminal(id, timeout).await;
        if started_here {
            self.jobs.stop().await;
        }
        outcome
    }

    async fn wait_terminal(&self, id: Uuid, timeout: Duration) -> Result<Job, AppError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(job) = self.jobs.status(id).await? {
                if job.status.is_terminal() {
                    return Ok(job);
                }
            }
            if tokio::time::Instant::now() >= deadline {
                warn!("submit_and_wait:timeout job_id={id}");
                self.jobs.cancel(id).await?;
                return self.jobs
                           .status(id)
                           .await?
                           .ok_or_else(|| AppError::Config(format!("job {id} disappeared")));
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Una pasada de mantenimiento: jobs terminales viejos, sandboxes
    /// huérfanos de benchmark y namespaces de apply vencidos. Cada paso
    /// registra su error y no impide los siguientes.
    pub async fn maintenance_pass(&self) -> MaintenanceReport {
        let mut report = MaintenanceReport::default();
        match self.jobs.cleanup_older_than(self.config.job_retention).await {
            Ok(n) => report.jobs_removed = n,
            Err(e) => warn!("maintenance:cleanup_jobs_failed err={e}"),
        }
        match self.schemas.reap_orphans().await {
            Ok(n) => report.orphans_reaped = n,
            Err(e) => debug!("maintenance:reap_orphans_skipped err={e}"),
        }
        match self.apply.reap_old_sandboxes(self.config.sandbox_max_age).await {
            Ok(n) => report.apply_schemas_reaped = n,
            Err(e) => debug!("maintenance:reap_old_sandboxes_skipped err={e}"),
        }
        info!("maintenance:done jobs_removed={} orphans_reaped={} apply_schemas_reaped={}",
              report.jobs_removed,
              report.orphans_reaped,
              report.apply_schemas_reaped);
        report
    }

    pub fn spawn_maintenance_loop(self: Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let interval = self.config.maintenance_interval;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        self.maintenance_pass().await;
                    }
                }
            }
            debug!("maintenance:loop_stopped");
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct MaintenanceReport {
    pub jobs_removed: usize,
    pub orphans_reaped: usize,
    pub apply_schemas_reaped: usize,
}

/// Veredicto del allow-list y rollback derivado para un SQL suelto.
pub fn check_sql(sql: &str) -> Value {
    let rec = Recommendation::new("check", sql, "", Vec::new());
    json!({
        "sql": sql,
        "safe": tune_domain::validate_safety(sql),
        "requires_autocommit": tune_domain::requires_autocommit(sql),
        "rollback_sql": tune_domain::derive_rollback(&rec),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_sql_reports_verdict_and_rollback() {
        let out = check_sql("CREATE INDEX CONCURRENTLY idx_foo ON bar(baz)");
        assert_eq!(out["safe"], true);
        assert_eq!(out["requires_autocommit"], true);
        assert_eq!(out["rollback_sql"], "DROP INDEX CONCURRENTLY idx_foo;");

        let out = check_sql("DROP TABLE users");
        assert_eq!(out["safe"], false);
        assert_eq!(out["rollback_sql"], Value::Null);
    }

    #[test]
    fn unconfigured_pool_refuses_sessions() {
        let pool = UnconfiguredPool { label: "sandbox" };
        let err = tokio_test::block_on(pool.acquire()).err().unwrap();
        assert_eq!(err, DbError::Connection("sandbox database not configured".into()));
    }
}
