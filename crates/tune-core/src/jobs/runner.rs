//! Ejecución de cada variante de `JobTask`.
use std::sync::Arc;

use log::debug;
use serde_json::Value;
use tune_domain::safety::is_index_ddl;
use tune_domain::{validate_safety, BenchmarkReport, Improvement, JobTask};
use uuid::Uuid;

use crate::apply::ApplyManager;
use crate::errors::JobError;
use crate::sandbox::SchemaManager;
use crate::store::RecommendationStore;

pub struct JobRunner {
    schemas: Arc<SchemaManager>,
    apply: Arc<ApplyManager>,
    recommendations: Arc<dyn RecommendationStore>,
}

impl JobRunner {
    pub fn new(schemas: Arc<SchemaManager>, apply: Arc<ApplyManager>, recommendations: Arc<dyn RecommendationStore>) -> Self {
        Self { schemas, apply, recommendations }
    }

    pub fn schemas(&self) -> &Arc<SchemaManager> {
        &self.schemas
    }

    pub async fn execute(&self, job_id: Uuid, task: &JobTask) -> Result<Value, JobError> {
        match task {
            JobTask::Benchmark { recommendation_id, sample_percent } => {
                let report = self.benchmark(job_id, recommendation_id, *sample_percent).await?;
                Ok(serde_json::to_value(report)?)
            }
            JobTask::Apply { recommendation_id } => {
                let change = self.apply.apply(recommendation_id).await?;
                Ok(serde_json::to_value(change.outcome())?)
            }
            JobTask::Rollback { recommendation_id } => {
                let outcome = self.apply.rollback(recommendation_id).await?;
                Ok(serde_json::to_value(outcome)?)
            }
        }
    }

    /// Secuencia estrictamente ordenada: sandbox, baseline, candidato,
    /// remedición. La limpieza del sandbox la hace el wrapper del job.
    async fn benchmark(&self, job_id: Uuid, recommendation_id: &str, sample_percent: f64) -> Result<BenchmarkReport, JobError> {
        let rec = self.recommendations
                      .get(recommendation_id)
                      .await?
                      .ok_or_else(|| JobError::RecommendationNotFound(recommendation_id.to_string()))?;
        if rec.tables.is_empty() {
            return Err(JobError::NothingToSample(recommendation_id.to_string()));
        }

        let schema = self.schemas.create_sandbox(job_id, &rec.tables, sample_percent).await?;
        let tables_sampled = self.schemas.sandbox(job_id).map(|t| t.sampled_tables).unwrap_or_default();
        if tables_sampled.is_empty() {
            return Err(JobError::EmptySandbox(schema));
        }

        let baseline = self.schemas.run_in_sandbox(&schema, &rec.original_query, &[]).await?;

        // SET / ALTER SYSTEM no tienen efecto medible en un namespace aislado.
        let candidate_applied = if validate_safety(&rec.sql_fix) && is_index_ddl(&rec.sql_fix) {
            self.schemas.run_ddl_in_sandbox(&schema, &rec.sql_fix).await
        } else {
            debug!("benchmark:skip_candidate job_id={job_id} recommendation_id={recommendation_id}");
            false
        };
        let optimized = if candidate_applied {
            Some(self.schemas.run_in_sandbox(&schema, &rec.original_query, &[]).await?)
        } else {
            None
        };

        let improvement = Improvement::between(&baseline, optimized.as_ref());
        debug!("benchmark:measured job_id={job_id} baseline_ms={:.3} improvement_pct={:.2}",
               baseline.elapsed_ms,
               improvement.time_improvement_percent);
        Ok(BenchmarkReport { schema_name: schema,
                             tables_sampled,
                             baseline_metrics: baseline,
                             optimized_metrics: optimized,
                             candidate_applied,
                             improvement })
    }

    /// Destruye el sandbox del job si existe uno registrado.
    pub async fn cleanup(&self, job_id: Uuid) {
        if self.schemas.is_active(job_id) {
            self.schemas.destroy_sandbox(job_id).await;
        }
    }
}
