use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use log::debug;
use serde_json::Value;
use tune_core::store::{JobStore, StatusChange};
use tune_core::StoreError;
use tune_domain::{Job, JobFilter, JobStatus, JobType};
use uuid::Uuid;

use super::{run_blocking, ConnectionProvider};
use crate::error::PersistenceError;
use crate::schema::tune_jobs;

/// Fila de `tune_jobs`; se usa para leer e insertar.
#[derive(Queryable, Selectable, Insertable, Debug, Clone)]
#[diesel(table_name = tune_jobs)]
struct JobRow {
    id: Uuid,
    recommendation_id: String,
    job_type: String,
    status: String,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    result: Option<Value>,
    error_message: Option<String>,
}

impl From<&Job> for JobRow {
    fn from(job: &Job) -> Self {
        Self { id: job.id,
               recommendation_id: job.recommendation_id.clone(),
               job_type: job.job_type.as_str().to_string(),
               status: job.status.as_str().to_string(),
               created_at: job.created_at,
               started_at: job.started_at,
               completed_at: job.completed_at,
               result: job.result.clone(),
               error_message: job.error_message.clone() }
    }
}

impl TryFrom<JobRow> for Job {
    type Error = PersistenceError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(Job { id: row.id,
                 recommendation_id: row.recommendation_id,
                 job_type: JobType::from_str(&row.job_type)?,
                 status: JobStatus::from_str(&row.status)?,
                 created_at: row.created_at,
                 started_at: row.started_at,
                 completed_at: row.completed_at,
                 result: row.result,
                 error_message: row.error_message })
    }
}

fn status_strings(statuses: &[JobStatus]) -> Vec<&'static str> {
    statuses.iter().map(JobStatus::as_str).collect()
}

/// Store durable de jobs sobre `tune_jobs`.
pub struct PgJobStore<P: ConnectionProvider> {
    provider: Arc<P>,
}

impl<P: ConnectionProvider> PgJobStore<P> {
    pub fn new(provider: P) -> Self {
        Self { provider: Arc::new(provider) }
    }
}

#[async_trait]
impl<P: ConnectionProvider> JobStore for PgJobStore<P> {
    async fn create(&self, job: &Job) -> Result<(), StoreError> {
        let row = JobRow::from(job);
        run_blocking(&self.provider, "jobs.create", move |conn| {
            diesel::insert_into(tune_jobs::table).values(&row).execute(conn)?;
            Ok(())
        }).await?;
        debug!("jobs.create:done job_id={}", job.id);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        let row = run_blocking(&self.provider, "jobs.get", move |conn| {
                      Ok(tune_jobs::table.find(id).select(JobRow::as_select()).first(conn).optional()?)
                  }).await?;
        Ok(row.map(Job::try_from).transpose()?)
    }

    async fn claim(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let updated = run_blocking(&self.provider, "jobs.claim", move |conn| {
                          Ok(diesel::update(tune_jobs::table.find(id).filter(tune_jobs::status.eq(JobStatus::Pending.as_str())))
                             .set((tune_jobs::status.eq(JobStatus::Running.as_str()), tune_jobs::started_at.eq(Some(at))))
                             .execute(conn)?)
                      }).await?;
        Ok(updated == 1)
    }

    async fn update_status(&self, id: Uuid, change: StatusChange) -> Result<bool, StoreError> {
        let updated = run_blocking(&self.provider, "jobs.update_status", move |conn| {
                          let active = status_strings(&JobStatus::ACTIVE);
                          let completed_at = change.status.is_terminal().then_some(change.at);
                          Ok(diesel::update(tune_jobs::table.find(id).filter(tune_jobs::status.eq_any(active)))
                             .set((tune_jobs::status.eq(change.status.as_str()),
                                   tune_jobs::completed_at.eq(completed_at),
                                   tune_jobs::result.eq(change.result.clone()),
                                   tune_jobs::error_message.eq(change.error_message.clone())))
                             .execute(conn)?)
                      }).await?;
        Ok(updated == 1)
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        let filter = filter.clone();
        let rows = run_blocking(&self.provider, "jobs.list", move |conn| {
                       let mut query = tune_jobs::table.select(JobRow::as_select())
                                                       .order(tune_jobs::created_at.desc())
                                                       .into_boxed();
                       if let Some(status) = filter.status {
                           query = query.filter(tune_jobs::status.eq(status.as_str()));
                       }
                       if let Some(rec) = &filter.recommendation_id {
                           query = query.filter(tune_jobs::recommendation_id.eq(rec.clone()));
                       }
                       if let Some(limit) = filter.limit {
                           query = query.limit(limit as i64);
                       }
                       Ok(query.load::<JobRow>(conn)?)
                   }).await?;
        rows.into_iter().map(|r| Job::try_from(r).map_err(StoreError::from)).collect()
    }

    async fn delete_older_than(&self, age: Duration) -> Result<usize, StoreError> {
        let cutoff = chrono::Duration::from_std(age).ok()
                                                   .and_then(|age| Utc::now().checked_sub_signed(age))
                                                   .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let removed = run_blocking(&self.provider, "jobs.delete_older_than", move |conn| {
                          let terminal = status_strings(&JobStatus::TERMINAL);
                          Ok(diesel::delete(tune_jobs::table.filter(tune_jobs::created_at.lt(cutoff))
                                                            .filter(tune_jobs::status.eq_any(terminal)))
                             .execute(conn)?)
                      }).await?;
        Ok(removed)
    }
}
