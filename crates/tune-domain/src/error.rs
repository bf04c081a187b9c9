use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    #[error("{0}")]
    ValidationError(String),
    #[error("unknown {kind} value: {value}")]
    UnknownVariant { kind: &'static str, value: String },
}
