use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde_json::Value;
use tune_core::store::AuditStore;
use tune_core::StoreError;
use tune_domain::{AuditAction, AuditLogEntry, AuditStatus, RiskLevel};

use super::{run_blocking, run_blocking_once, ConnectionProvider};
use crate::error::PersistenceError;
use crate::schema::tune_audit_log;

#[derive(Insertable, Debug)]
#[diesel(table_name = tune_audit_log)]
struct NewAuditRow {
    action_type: &'static str,
    recommendation_id: String,
    details: Value,
    risk_level: &'static str,
    status: &'static str,
    created_at: DateTime<Utc>,
}

#[derive(Queryable, Selectable, Debug)]
#[diesel(table_name = tune_audit_log)]
struct AuditRow {
    action_type: String,
    recommendation_id: String,
    details: Value,
    risk_level: String,
    status: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<AuditRow> for AuditLogEntry {
    type Error = PersistenceError;

    fn try_from(row: AuditRow) -> Result<Self, Self::Error> {
        Ok(AuditLogEntry { action_type: AuditAction::from_str(&row.action_type)?,
                           recommendation_id: row.recommendation_id,
                           details: row.details,
                           risk_level: RiskLevel::from_str(&row.risk_level)?,
                           status: AuditStatus::from_str(&row.status)?,
                           created_at: row.created_at })
    }
}

/// Audit trail append-only sobre `tune_audit_log` (sin updates ni deletes).
pub struct PgAuditStore<P: ConnectionProvider> {
    provider: Arc<P>,
}

impl<P: ConnectionProvider> PgAuditStore<P> {
    pub fn new(provider: P) -> Self {
        Self { provider: Arc::new(provider) }
    }
}

#[async_trait]
impl<P: ConnectionProvider> AuditStore for PgAuditStore<P> {
    async fn append(&self, entry: &AuditLogEntry) -> Result<(), StoreError> {
        let row = NewAuditRow { action_type: entry.action_type.as_str(),
                                recommendation_id: entry.recommendation_id.clone(),
                                details: entry.details.clone(),
                                risk_level: entry.risk_level.as_str(),
                                status: entry.status.as_str(),
                                created_at: entry.created_at };
        run_blocking_once(&self.provider, "audit.append", move |conn| {
            diesel::insert_into(tune_audit_log::table).values(&row).execute(conn)?;
            Ok(())
        }).await?;
        Ok(())
    }

    async fn list(&self, limit: usize) -> Result<Vec<AuditLogEntry>, StoreError> {
        let rows = run_blocking(&self.provider, "audit.list", move |conn| {
                       Ok(tune_audit_log::table.select(AuditRow::as_select())
                                               .order(tune_audit_log::id.desc())
                                               .limit(limit as i64)
                                               .load::<AuditRow>(conn)?)
                   }).await?;
        rows.into_iter().map(|r| AuditLogEntry::try_from(r).map_err(StoreError::from)).collect()
    }
}
