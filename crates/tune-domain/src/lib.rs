//! tune-domain
//!
//! Modelo de datos del subsistema de benchmark en sandbox y aplicación segura.
//! No realiza I/O: sólo tipos serializables, reglas puras de seguridad SQL y
//! convenciones de nombres de namespaces.
//!
//! Módulos:
//! - `job`: jobs, tipos de job y tareas etiquetadas que consume el dispatcher.
//! - `recommendation`: entidad externa (sólo lectura salvo `applied`/`status`).
//! - `sandbox`: esquemas temporales, métricas de I/O y reporte de benchmark.
//! - `change`: registro de cambios aplicados y payloads de apply/rollback.
//! - `audit`: entradas append-only del audit trail.
//! - `replica`: salud de réplica y clases de operación/target.
//! - `safety`: allow-list de sentencias y derivación heurística de rollback.
//! - `naming`: nombres deterministas de namespaces y quoting de identificadores.

pub mod audit;
pub mod change;
pub mod error;
pub mod job;
pub mod naming;
pub mod recommendation;
pub mod replica;
pub mod safety;
pub mod sandbox;

pub use audit::{AuditAction, AuditLogEntry, AuditStatus};
pub use change::{AppliedChange, ApplyOutcome, ChangeStatus, RollbackOutcome};
pub use error::DomainError;
pub use job::{Job, JobFilter, JobStatus, JobTask, JobType, WorkItem};
pub use recommendation::{Recommendation, RecommendationUpdate, RiskLevel};
pub use replica::{OperationClass, ReplicaHealth, TargetKind};
pub use safety::{derive_rollback, requires_autocommit, validate_safety};
pub use sandbox::{BenchmarkReport, Improvement, IoMetrics, Measurement, SampledTable, TempSchema};
