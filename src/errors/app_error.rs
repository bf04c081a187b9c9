use thiserror::Error;
use tune_core::{ApplyError, DbError, JobError, SandboxError, StoreError};
use tune_persistence::PersistenceError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Error de configuración: {0}")]
    Config(String),
    #[error("Error de persistencia: {0}")]
    Persistence(#[from] PersistenceError),
    #[error("Error de store: {0}")]
    Store(#[from] StoreError),
    #[error("Error de base destino: {0}")]
    Db(#[from] DbError),
    #[error("Error de sandbox: {0}")]
    Sandbox(#[from] SandboxError),
    #[error("Error de job: {0}")]
    Job(#[from] JobError),
    #[error("Error de apply: {0}")]
    Apply(#[from] ApplyError),
    #[error("Error de serialización: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Error en IO: {0}")]
    Io(#[from] std::io::Error),
}

impl AppError {
    /// Código de salida del CLI: 2 para configuración y precondiciones, 1
    /// para el resto.
    pub fn exit_code(&self) -> u8 {
        match self {
            AppError::Config(_) => 2,
            AppError::Persistence(PersistenceError::Config(_)) => 2,
            AppError::Apply(e) if e.is_precondition() => 2,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_variant_format() {
        let err = AppError::Config("REPLICA_DATABASE_URL no definido".into());
        assert_eq!(err.to_string(), "Error de configuración: REPLICA_DATABASE_URL no definido");
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn io_variant_from() {
        let err: AppError = std::io::Error::other("falló IO").into();
        assert_eq!(err.to_string(), "Error en IO: falló IO");
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn precondition_errors_map_to_usage_exit_code() {
        let err: AppError = ApplyError::AlreadyApplied("r1".into()).into();
        assert_eq!(err.exit_code(), 2);
        let err: AppError = ApplyError::Execution(DbError::Connection("down".into())).into();
        assert_eq!(err.exit_code(), 1);
    }
}
