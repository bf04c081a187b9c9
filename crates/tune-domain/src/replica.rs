//! Clases de operación y salud de la réplica usada para benchmarks.
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Qué hace la operación con la base destino.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationClass {
    /// Sólo lecturas: puede caer al primario.
    Read,
    /// Modifica esquema o datos: nunca debe tocar el primario.
    Mutate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    Replica,
    Primary,
    None,
}

/// Estado transitorio de salud (no se persiste).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicaHealth {
    pub is_healthy: bool,
    pub last_checked_at: Option<DateTime<Utc>>,
    #[serde(with = "duration_secs")]
    pub debounce_interval: Duration,
}

impl ReplicaHealth {
    pub fn unknown(debounce_interval: Duration) -> Self {
        Self { is_healthy: false, last_checked_at: None, debounce_interval }
    }

    /// `true` si el último chequeo sigue vigente en `now`.
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        match (self.last_checked_at, chrono::Duration::from_std(self.debounce_interval)) {
            (Some(at), Ok(interval)) => now - at < interval,
            _ => false,
        }
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Ok(Duration::from_secs_f64(secs.max(0.0)))
    }
}
