//! Recomendación generada fuera del núcleo (heurísticas / LLM).
//!
//! El núcleo sólo lee su contenido y actualiza `applied`, `applied_at` y
//! `status`.
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    #[default]
    Unknown,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Unknown => "unknown",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RiskLevel {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(RiskLevel::Low),
            "medium" => Ok(RiskLevel::Medium),
            "high" => Ok(RiskLevel::High),
            "unknown" => Ok(RiskLevel::Unknown),
            other => Err(DomainError::UnknownVariant { kind: "risk_level", value: other.to_string() }),
        }
    }
}

/// Vista mínima de una recomendación.
///
/// - `sql_fix`: sentencia candidata (índice, ajuste de configuración, ...).
/// - `rollback_sql`: rollback provisto por el autor, si existe.
/// - `original_query`: consulta cuyo rendimiento se mide.
/// - `tables`: tablas referenciadas (normalmente extraídas del plan).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub id: String,
    pub sql_fix: String,
    pub rollback_sql: Option<String>,
    pub original_query: String,
    pub tables: Vec<String>,
    pub applied: bool,
    pub applied_at: Option<DateTime<Utc>>,
    pub status: String,
    pub risk_level: RiskLevel,
}

impl Recommendation {
    pub fn new(id: impl Into<String>, sql_fix: impl Into<String>, original_query: impl Into<String>, tables: Vec<String>) -> Self {
        Self { id: id.into(),
               sql_fix: sql_fix.into(),
               rollback_sql: None,
               original_query: original_query.into(),
               tables,
               applied: false,
               applied_at: None,
               status: "pending".to_string(),
               risk_level: RiskLevel::Unknown }
    }

    pub fn with_rollback(mut self, rollback_sql: impl Into<String>) -> Self {
        self.rollback_sql = Some(rollback_sql.into());
        self
    }

    pub fn with_risk(mut self, risk_level: RiskLevel) -> Self {
        self.risk_level = risk_level;
        self
    }

    /// Rollback provisto por el autor, ignorando cadenas vacías.
    pub fn supplied_rollback(&self) -> Option<&str> {
        self.rollback_sql.as_deref().map(str::trim).filter(|s| !s.is_empty())
    }
}

/// Campos que el núcleo puede modificar. `None` = no tocar.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecommendationUpdate {
    pub applied: Option<bool>,
    pub applied_at: Option<Option<DateTime<Utc>>>,
    pub status: Option<String>,
}

impl RecommendationUpdate {
    pub fn mark_applied(at: DateTime<Utc>) -> Self {
        Self { applied: Some(true), applied_at: Some(Some(at)), status: Some("applied".to_string()) }
    }

    pub fn mark_rolled_back() -> Self {
        Self { applied: Some(false), applied_at: Some(None), status: Some("rolled_back".to_string()) }
    }

    /// Aplica el parche sobre una recomendación en memoria.
    pub fn apply_to(&self, rec: &mut Recommendation) {
        if let Some(applied) = self.applied {
            rec.applied = applied;
        }
        if let Some(applied_at) = self.applied_at {
            rec.applied_at = applied_at;
        }
        if let Some(status) = &self.status {
            rec.status = status.clone();
        }
    }
}
