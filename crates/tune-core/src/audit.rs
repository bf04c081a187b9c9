//! Escritura de auditoría que nunca propaga errores.
use std::sync::Arc;

use log::{debug, error};
use serde_json::Value;
use tune_domain::{AuditAction, AuditLogEntry, AuditStatus, RiskLevel};

use crate::errors::StoreError;
use crate::store::AuditStore;

#[derive(Clone)]
pub struct AuditSink {
    store: Arc<dyn AuditStore>,
    environment: String,
}

impl AuditSink {
    pub fn new(store: Arc<dyn AuditStore>, environment: impl Into<String>) -> Self {
        Self { store, environment: environment.into() }
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    /// Agrega una entrada. Un fallo del store se registra y se descarta: la
    /// operación auditada ya ocurrió y su resultado no cambia.
    pub async fn record(&self,
                        action: AuditAction,
                        recommendation_id: &str,
                        mut details: Value,
                        risk_level: RiskLevel,
                        status: AuditStatus) {
        if let Value::Object(map) = &mut details {
            map.entry("environment").or_insert_with(|| Value::String(self.environment.clone()));
        }
        let entry = AuditLogEntry::new(action, recommendation_id, details, risk_level, status);
        match self.store.append(&entry).await {
            Ok(()) => debug!("audit:recorded action={} recommendation_id={recommendation_id} status={}",
                             action.as_str(),
                             status.as_str()),
            Err(e) => error!("audit:write_failed action={} recommendation_id={recommendation_id} err={e}",
                             action.as_str()),
        }
    }

    pub async fn trail(&self, limit: usize) -> Result<Vec<AuditLogEntry>, StoreError> {
        self.store.list(limit).await
    }
}
