//! Registro durable de cambios aplicados y payloads de apply/rollback.
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeStatus {
    Applied,
    RolledBack,
}

impl ChangeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeStatus::Applied => "applied",
            ChangeStatus::RolledBack => "rolled_back",
        }
    }
}

impl fmt::Display for ChangeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChangeStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "applied" => Ok(ChangeStatus::Applied),
            "rolled_back" => Ok(ChangeStatus::RolledBack),
            other => Err(DomainError::UnknownVariant { kind: "change_status", value: other.to_string() }),
        }
    }
}

/// Fuente única de verdad para "¿se puede revertir esta recomendación ahora?".
/// Existe con `status = Applied` mientras el cambio está activo.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedChange {
    pub recommendation_id: String,
    pub sql_executed: String,
    pub schema_name: String,
    pub applied_at: DateTime<Utc>,
    pub rollback_sql: Option<String>,
    pub status: ChangeStatus,
    pub rolled_back_at: Option<DateTime<Utc>>,
}

impl AppliedChange {
    pub fn is_active(&self) -> bool {
        self.status == ChangeStatus::Applied
    }

    pub fn outcome(&self) -> ApplyOutcome {
        ApplyOutcome { success: true,
                       sql_executed: self.sql_executed.clone(),
                       schema_name: Some(self.schema_name.clone()),
                       applied_at: self.applied_at,
                       rollback_available: self.rollback_sql.is_some() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplyOutcome {
    pub success: bool,
    pub sql_executed: String,
    pub schema_name: Option<String>,
    pub applied_at: DateTime<Utc>,
    pub rollback_available: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackOutcome {
    pub success: bool,
    pub sql_executed: String,
    pub schema_name: Option<String>,
    pub rolled_back_at: DateTime<Utc>,
    pub rollback_available: bool,
}
