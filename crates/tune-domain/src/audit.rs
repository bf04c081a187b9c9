//! Entradas del audit trail (append-only).
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::DomainError;
use crate::recommendation::RiskLevel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    RecommendationApplied,
    RecommendationApplyFailed,
    RecommendationRolledBack,
    RecommendationRollbackFailed,
    Cleanup,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::RecommendationApplied => "recommendation_applied",
            AuditAction::RecommendationApplyFailed => "recommendation_apply_failed",
            AuditAction::RecommendationRolledBack => "recommendation_rolled_back",
            AuditAction::RecommendationRollbackFailed => "recommendation_rollback_failed",
            AuditAction::Cleanup => "cleanup",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditAction {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "recommendation_applied" => Ok(AuditAction::RecommendationApplied),
            "recommendation_apply_failed" => Ok(AuditAction::RecommendationApplyFailed),
            "recommendation_rolled_back" => Ok(AuditAction::RecommendationRolledBack),
            "recommendation_rollback_failed" => Ok(AuditAction::RecommendationRollbackFailed),
            "cleanup" => Ok(AuditAction::Cleanup),
            other => Err(DomainError::UnknownVariant { kind: "audit_action", value: other.to_string() }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditStatus {
    Completed,
    Failed,
    Partial,
}

impl AuditStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditStatus::Completed => "completed",
            AuditStatus::Failed => "failed",
            AuditStatus::Partial => "partial",
        }
    }
}

impl FromStr for AuditStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "completed" => Ok(AuditStatus::Completed),
            "failed" => Ok(AuditStatus::Failed),
            "partial" => Ok(AuditStatus::Partial),
            other => Err(DomainError::UnknownVariant { kind: "audit_status", value: other.to_string() }),
        }
    }
}

/// Una entrada del audit trail.
///
/// `details` incluye el SQL ejecutado, el SQL de rollback y la etiqueta de
/// entorno; en fallos también el texto del error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub action_type: AuditAction,
    pub recommendation_id: String,
    pub details: Value,
    pub risk_level: RiskLevel,
    pub status: AuditStatus,
    pub created_at: DateTime<Utc>,
}

impl AuditLogEntry {
    pub fn new(action_type: AuditAction, recommendation_id: impl Into<String>, details: Value, risk_level: RiskLevel, status: AuditStatus) -> Self {
        Self { action_type, recommendation_id: recommendation_id.into(), details, risk_level, status, created_at: Utc::now() }
    }
}
