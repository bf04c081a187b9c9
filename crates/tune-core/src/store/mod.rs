//! Contratos de almacenamiento durable.
//!
//! Los managers sólo dependen de estos traits; `memory` provee backends en
//! memoria (tests y modo efímero) y `tune-persistence` las implementaciones
//! Postgres con paridad 1:1.
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tune_domain::{AppliedChange, AuditLogEntry, Job, JobFilter, JobStatus, Recommendation, RecommendationUpdate};
use uuid::Uuid;

use crate::errors::StoreError;

pub mod memory;

pub use memory::{InMemoryAuditStore, InMemoryChangeStore, InMemoryJobStore, InMemoryRecommendationStore};

/// Recomendaciones generadas por otro subsistema. Sólo se modifican los
/// campos `applied`, `applied_at` y `status`.
#[async_trait]
pub trait RecommendationStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<Recommendation>, StoreError>;
    /// Aplica el parche. `NotFound` si la recomendación no existe.
    async fn update(&self, id: &str, update: RecommendationUpdate) -> Result<(), StoreError>;
    /// Alta / reemplazo completo (seeding y tests).
    async fn upsert(&self, rec: Recommendation) -> Result<(), StoreError>;
}

/// Cambio de estado de un job ya existente.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusChange {
    pub status: JobStatus,
    pub result: Option<Value>,
    pub error_message: Option<String>,
    pub at: DateTime<Utc>,
}

impl StatusChange {
    pub fn completed(result: Value) -> Self {
        Self { status: JobStatus::Completed, result: Some(result), error_message: None, at: Utc::now() }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self { status: JobStatus::Error, result: None, error_message: Some(message.into()), at: Utc::now() }
    }

    pub fn cancelled() -> Self {
        Self::cancelled_with("cancelled by request")
    }

    pub fn cancelled_with(reason: impl Into<String>) -> Self {
        Self { status: JobStatus::Cancelled, result: None, error_message: Some(reason.into()), at: Utc::now() }
    }
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create(&self, job: &Job) -> Result<(), StoreError>;
    async fn get(&self, id: Uuid) -> Result<Option<Job>, StoreError>;
    /// Compare-and-set `pending -> running` fijando `started_at`. `false` si
    /// el job no estaba `pending` (otro worker lo tomó o ya terminó).
    async fn claim(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool, StoreError>;
    /// Escribe un estado terminal. Nunca sobrescribe otro terminal: el primero
    /// gana y la llamada devuelve `false`.
    async fn update_status(&self, id: Uuid, change: StatusChange) -> Result<bool, StoreError>;
    /// Más recientes primero.
    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError>;
    /// Borra jobs terminales creados antes de `now - age`; devuelve cuántos.
    async fn delete_older_than(&self, age: Duration) -> Result<usize, StoreError>;
}

/// Registro de cambios aplicados, fuente única de "¿se puede revertir?".
#[async_trait]
pub trait ChangeStore: Send + Sync {
    async fn get(&self, recommendation_id: &str) -> Result<Option<AppliedChange>, StoreError>;
    async fn upsert(&self, change: &AppliedChange) -> Result<(), StoreError>;
    /// `false` si no había un cambio activo para la recomendación.
    async fn mark_rolled_back(&self, recommendation_id: &str, at: DateTime<Utc>) -> Result<bool, StoreError>;
    async fn list(&self) -> Result<Vec<AppliedChange>, StoreError>;
}

/// Audit trail append-only.
#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn append(&self, entry: &AuditLogEntry) -> Result<(), StoreError>;
    /// Más recientes primero.
    async fn list(&self, limit: usize) -> Result<Vec<AuditLogEntry>, StoreError>;
}
