//! Taxonomía de errores del núcleo.
//!
//! - Precondición (recomendación inexistente, ya aplicada, SQL inseguro, sin
//!   rollback): se devuelven de inmediato, nunca se reintentan.
//! - Ejecución (conexión, sentencia): se registran en el Job / AppliedChange.
//! - Auditoría y limpieza: nunca llegan aquí; se registran en logs y se
//!   descartan.

use thiserror::Error;

/// Fallos de una sesión SQL contra primario / réplica / sandbox.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DbError {
    #[error("connection error: {0}")]
    Connection(String),
    #[error("statement failed: {message} (sql: {sql})")]
    Statement { sql: String, message: String },
    #[error("decode error: {0}")]
    Decode(String),
    #[error("timed out after {0} ms")]
    Timeout(u64),
}

impl DbError {
    pub fn statement(sql: &str, message: impl Into<String>) -> Self {
        let mut sql = sql.trim().to_string();
        if sql.len() > 200 {
            let mut cut = 200;
            while !sql.is_char_boundary(cut) {
                cut -= 1;
            }
            sql.truncate(cut);
            sql.push_str("...");
        }
        Self::Statement { sql, message: message.into() }
    }
}

/// Fallos de los stores persistentes (jobs, cambios, auditoría,
/// recomendaciones).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("store backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("benchmarking unavailable: no replica target for mutating operations")]
    NoTarget,
    #[error("invalid sample fraction {0} (expected 0 < p <= 100)")]
    InvalidSampleFraction(f64),
    #[error("invalid table reference: {0}")]
    InvalidTable(String),
    #[error(transparent)]
    Db(#[from] DbError),
}

#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("recommendation {0} not found")]
    RecommendationNotFound(String),
    #[error("recommendation {0} is already applied")]
    AlreadyApplied(String),
    #[error("unsafe sql rejected by allow-list: {0}")]
    UnsafeSql(String),
    #[error("recommendation {0} is not applied")]
    NotApplied(String),
    #[error("no rollback sql available for recommendation {0}")]
    MissingRollback(String),
    #[error("apply execution failed: {0}")]
    Execution(#[from] DbError),
    /// La sentencia se ejecutó pero su `AppliedChange` no pudo guardarse.
    #[error("change for recommendation {recommendation_id} executed but not recorded: {source}")]
    Unrecorded {
        recommendation_id: String,
        #[source]
        source: StoreError,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ApplyError {
    /// Los errores de precondición se devuelven al llamador sin reintentos.
    pub fn is_precondition(&self) -> bool {
        matches!(self,
                 ApplyError::RecommendationNotFound(_)
                 | ApplyError::AlreadyApplied(_)
                 | ApplyError::UnsafeSql(_)
                 | ApplyError::NotApplied(_)
                 | ApplyError::MissingRollback(_))
    }
}

/// Error local de la ejecución de un job; se guarda como `error_message`.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("recommendation {0} not found")]
    RecommendationNotFound(String),
    #[error("recommendation {0} references no tables to sample")]
    NothingToSample(String),
    #[error("no tables could be sampled into {0}")]
    EmptySandbox(String),
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
    #[error(transparent)]
    Apply(#[from] ApplyError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("result serialization failed: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for JobError {
    fn from(e: serde_json::Error) -> Self {
        JobError::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precondition_classification() {
        assert!(ApplyError::AlreadyApplied("r".into()).is_precondition());
        assert!(ApplyError::MissingRollback("r".into()).is_precondition());
        assert!(!ApplyError::Execution(DbError::Connection("down".into())).is_precondition());
        assert!(!ApplyError::Store(StoreError::Backend("x".into())).is_precondition());
        let unrecorded = ApplyError::Unrecorded { recommendation_id: "r".into(),
                                                  source: StoreError::Backend("down".into()) };
        assert!(!unrecorded.is_precondition());
        assert!(unrecorded.to_string().contains("not recorded"));
    }

    #[test]
    fn long_statements_are_truncated_in_errors() {
        let sql = "SELECT ".to_string() + &"x".repeat(500);
        match DbError::statement(&sql, "boom") {
            DbError::Statement { sql, message } => {
                assert!(sql.len() <= 203);
                assert_eq!(message, "boom");
            }
            other => panic!("variante inesperada: {other:?}"),
        }
    }
}
