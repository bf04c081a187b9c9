use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use tune_core::store::ChangeStore;
use tune_core::StoreError;
use tune_domain::{AppliedChange, ChangeStatus};

use super::{run_blocking, ConnectionProvider};
use crate::error::PersistenceError;
use crate::schema::tune_applied_changes;

#[derive(Queryable, Selectable, Insertable, AsChangeset, Debug, Clone)]
#[diesel(table_name = tune_applied_changes, primary_key(recommendation_id), treat_none_as_null = true)]
struct ChangeRow {
    recommendation_id: String,
    sql_executed: String,
    schema_name: String,
    applied_at: DateTime<Utc>,
    rollback_sql: Option<String>,
    status: String,
    rolled_back_at: Option<DateTime<Utc>>,
}

impl From<&AppliedChange> for ChangeRow {
    fn from(c: &AppliedChange) -> Self {
        Self { recommendation_id: c.recommendation_id.clone(),
               sql_executed: c.sql_executed.clone(),
               schema_name: c.schema_name.clone(),
               applied_at: c.applied_at,
               rollback_sql: c.rollback_sql.clone(),
               status: c.status.as_str().to_string(),
               rolled_back_at: c.rolled_back_at }
    }
}

impl TryFrom<ChangeRow> for AppliedChange {
    type Error = PersistenceError;

    fn try_from(row: ChangeRow) -> Result<Self, Self::Error> {
        Ok(AppliedChange { recommendation_id: row.recommendation_id,
                           sql_executed: row.sql_executed,
                           schema_name: row.schema_name,
                           applied_at: row.applied_at,
                           rollback_sql: row.rollback_sql,
                           status: ChangeStatus::from_str(&row.status)?,
                           rolled_back_at: row.rolled_back_at })
    }
}

/// Registro durable de cambios aplicados (una fila por recomendación).
pub struct PgChangeStore<P: ConnectionProvider> {
    provider: Arc<P>,
}

impl<P: ConnectionProvider> PgChangeStore<P> {
    pub fn new(provider: P) -> Self {
        Self { provider: Arc::new(provider) }
    }
}

#[async_trait]
impl<P: ConnectionProvider> ChangeStore for PgChangeStore<P> {
    async fn get(&self, recommendation_id: &str) -> Result<Option<AppliedChange>, StoreError> {
        let id = recommendation_id.to_string();
        let row = run_blocking(&self.provider, "changes.get", move |conn| {
                      Ok(tune_applied_changes::table.find(&id)
                                                    .select(ChangeRow::as_select())
                                                    .first(conn)
                                                    .optional()?)
                  }).await?;
        Ok(row.map(AppliedChange::try_from).transpose()?)
    }

    async fn upsert(&self, change: &AppliedChange) -> Result<(), StoreError> {
        let row = ChangeRow::from(change);
        run_blocking(&self.provider, "changes.upsert", move |conn| {
            diesel::insert_into(tune_applied_changes::table).values(&row)
                                                            .on_conflict(tune_applied_changes::recommendation_id)
                                                            .do_update()
                                                            .set(&row)
                                                            .execute(conn)?;
            Ok(())
        }).await?;
        Ok(())
    }

    async fn mark_rolled_back(&self, recommendation_id: &str, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let id = recommendation_id.to_string();
        let updated = run_blocking(&self.provider, "changes.mark_rolled_back", move |conn| {
                          let active = tune_applied_changes::table.find(&id)
                                                                  .filter(tune_applied_changes::status.eq(ChangeStatus::Applied.as_str()));
                          Ok(diesel::update(active).set((tune_applied_changes::status.eq(ChangeStatus::RolledBack.as_str()),
                                                         tune_applied_changes::rolled_back_at.eq(Some(at))))
                                                   .execute(conn)?)
                      }).await?;
        Ok(updated == 1)
    }

    async fn list(&self) -> Result<Vec<AppliedChange>, StoreError> {
        let rows = run_blocking(&self.provider, "changes.list", |conn| {
                       Ok(tune_applied_changes::table.select(ChangeRow::as_select())
                                                     .order(tune_applied_changes::applied_at.desc())
                                                     .load::<ChangeRow>(conn)?)
                   }).await?;
        rows.into_iter().map(|r| AppliedChange::try_from(r).map_err(StoreError::from)).collect()
    }
}
