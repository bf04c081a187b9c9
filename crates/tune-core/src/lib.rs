//! tune-core
//!
//! Núcleo del subsistema de benchmark en sandbox y aplicación segura:
//!
//! - `target`: política réplica / primario para operaciones de lectura o
//!   mutación, con chequeo de salud debounced.
//! - `sandbox`: Schema Manager (namespaces aislados, muestreo, medición).
//! - `apply`: Apply Manager (allow-list, apply / rollback, audit trail).
//! - `jobs`: Job Manager (cola durable, dispatcher, cancelación).
//! - `store`: contratos de persistencia + backends en memoria.
//! - `db`: contratos de sesiones SQL + base simulada en memoria (sólo con
//!   la feature `testing`).
//!
//! El crate no conoce drivers concretos: `tune-persistence` provee los
//! backends Postgres.

pub mod apply;
pub mod audit;
pub mod db;
pub mod errors;
pub mod jobs;
pub mod sandbox;
pub mod store;
pub mod target;

pub use apply::ApplyManager;
pub use audit::AuditSink;
#[cfg(any(test, feature = "testing"))]
pub use db::MemoryDatabase;
pub use db::{PoolConnector, SqlPool, SqlSession, SqlValue};
pub use errors::{ApplyError, DbError, JobError, SandboxError, StoreError};
pub use jobs::{JobManager, JobManagerConfig, JobRunner, RecoveryReport};
pub use sandbox::{SandboxConfig, SchemaManager};
pub use store::{AuditStore, ChangeStore, JobStore, RecommendationStore, StatusChange};
pub use target::{ReplicaConfig, StaticConnector, Target, TargetSelector, TargetStatus};
