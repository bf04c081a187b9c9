//! Jobs del pipeline asíncrono.
//!
//! Ciclo de vida: `Pending` (creado por quien envía) -> `Running` (reclamado
//! por un worker) -> terminal (`Completed`, `Error`/`Failed`, `Cancelled`).
//! Las transiciones desde un estado terminal no están permitidas: el primer
//! estado terminal persistido es el definitivo.
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::DomainError;

/// Tipo de trabajo solicitado sobre una recomendación.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    Benchmark,
    Apply,
    Rollback,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Benchmark => "benchmark",
            JobType::Apply => "apply",
            JobType::Rollback => "rollback",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "benchmark" => Ok(JobType::Benchmark),
            "apply" => Ok(JobType::Apply),
            "rollback" => Ok(JobType::Rollback),
            other => Err(DomainError::UnknownVariant { kind: "job_type", value: other.to_string() }),
        }
    }
}

/// Estado persistido de un job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Error,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Error => "error",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Pending | JobStatus::Running)
    }

    /// Estados que todavía pueden avanzar.
    pub const ACTIVE: [JobStatus; 2] = [JobStatus::Pending, JobStatus::Running];
    pub const TERMINAL: [JobStatus; 4] = [JobStatus::Completed, JobStatus::Failed, JobStatus::Error, JobStatus::Cancelled];
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "error" => Ok(JobStatus::Error),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(DomainError::UnknownVariant { kind: "job_status", value: other.to_string() }),
        }
    }
}

/// Registro persistido de un job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub recommendation_id: String,
    pub job_type: JobType,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<Value>,
    pub error_message: Option<String>,
}

impl Job {
    /// Crea un job nuevo en estado `Pending` con id generado.
    pub fn new(recommendation_id: impl Into<String>, job_type: JobType) -> Self {
        Self { id: Uuid::new_v4(),
               recommendation_id: recommendation_id.into(),
               job_type,
               status: JobStatus::Pending,
               created_at: Utc::now(),
               started_at: None,
               completed_at: None,
               result: None,
               error_message: None }
    }
}

/// Filtro para listados administrativos.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub recommendation_id: Option<String>,
    pub limit: Option<usize>,
}

impl JobFilter {
    pub fn matches(&self, job: &Job) -> bool {
        self.status.map_or(true, |s| s == job.status)
        && self.recommendation_id.as_deref().map_or(true, |r| r == job.recommendation_id)
    }
}

/// Tarea etiquetada: cada variante lleva su propio payload, y el dispatcher
/// hace `match` sobre ella en lugar de comparar strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "job_type", rename_all = "lowercase")]
pub enum JobTask {
    Benchmark { recommendation_id: String, sample_percent: f64 },
    Apply { recommendation_id: String },
    Rollback { recommendation_id: String },
}

impl JobTask {
    pub fn job_type(&self) -> JobType {
        match self {
            JobTask::Benchmark { .. } => JobType::Benchmark,
            JobTask::Apply { .. } => JobType::Apply,
            JobTask::Rollback { .. } => JobType::Rollback,
        }
    }

    pub fn recommendation_id(&self) -> &str {
        match self {
            JobTask::Benchmark { recommendation_id, .. } | JobTask::Apply { recommendation_id } | JobTask::Rollback { recommendation_id } => {
                recommendation_id
            }
        }
    }

    /// Construye la tarea a partir del tipo persistido.
    pub fn for_type(job_type: JobType, recommendation_id: impl Into<String>, sample_percent: f64) -> Self {
        let recommendation_id = recommendation_id.into();
        match job_type {
            JobType::Benchmark => JobTask::Benchmark { recommendation_id, sample_percent },
            JobType::Apply => JobTask::Apply { recommendation_id },
            JobType::Rollback => JobTask::Rollback { recommendation_id },
        }
    }
}

/// Unidad encolada para el dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkItem {
    pub job_id: Uuid,
    pub task: JobTask,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_terminal_classification() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        for s in JobStatus::TERMINAL {
            assert!(s.is_terminal(), "{s} debe ser terminal");
        }
    }

    #[test]
    fn job_type_parses_its_own_display() {
        for t in [JobType::Benchmark, JobType::Apply, JobType::Rollback] {
            assert_eq!(t.to_string().parse::<JobType>().unwrap(), t);
        }
        assert!("vacuum".parse::<JobType>().is_err());
    }

    #[test]
    fn task_serializes_with_job_type_tag() {
        let task = JobTask::for_type(JobType::Apply, "rec-1", 10.0);
        let v = serde_json::to_value(&task).unwrap();
        assert_eq!(v["job_type"], "apply");
        assert_eq!(v["recommendation_id"], "rec-1");
        assert_eq!(task.job_type(), JobType::Apply);
    }
}
