use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde_json::Value;
use tune_core::store::RecommendationStore;
use tune_core::StoreError;
use tune_domain::{Recommendation, RecommendationUpdate, RiskLevel};

use super::{run_blocking, ConnectionProvider};
use crate::error::PersistenceError;
use crate::schema::tune_recommendations;

#[derive(Queryable, Selectable, Insertable, AsChangeset, Debug, Clone)]
#[diesel(table_name = tune_recommendations, treat_none_as_null = true)]
struct RecommendationRow {
    id: String,
    sql_fix: String,
    rollback_sql: Option<String>,
    original_query: String,
    tables: Value,
    applied: bool,
    applied_at: Option<DateTime<Utc>>,
    status: String,
    risk_level: String,
}

/// Parche parcial: `None` deja la columna intacta.
#[derive(AsChangeset, Debug, Clone)]
#[diesel(table_name = tune_recommendations)]
struct RecommendationPatch {
    applied: Option<bool>,
    applied_at: Option<Option<DateTime<Utc>>>,
    status: Option<String>,
}

impl RecommendationPatch {
    fn is_empty(&self) -> bool {
        self.applied.is_none() && self.applied_at.is_none() && self.status.is_none()
    }
}

impl From<RecommendationUpdate> for RecommendationPatch {
    fn from(u: RecommendationUpdate) -> Self {
        Self { applied: u.applied, applied_at: u.applied_at, status: u.status }
    }
}

impl TryFrom<&Recommendation> for RecommendationRow {
    type Error = PersistenceError;

    fn try_from(rec: &Recommendation) -> Result<Self, Self::Error> {
        Ok(Self { id: rec.id.clone(),
                  sql_fix: rec.sql_fix.clone(),
                  rollback_sql: rec.rollback_sql.clone(),
                  original_query: rec.original_query.clone(),
                  tables: serde_json::to_value(&rec.tables)?,
                  applied: rec.applied,
                  applied_at: rec.applied_at,
                  status: rec.status.clone(),
                  risk_level: rec.risk_level.as_str().to_string() })
    }
}

impl TryFrom<RecommendationRow> for Recommendation {
    type Error = PersistenceError;

    fn try_from(row: RecommendationRow) -> Result<Self, Self::Error> {
        Ok(Recommendation { id: row.id,
                            sql_fix: row.sql_fix,
                            rollback_sql: row.rollback_sql,
                            original_query: row.original_query,
                            tables: serde_json::from_value(row.tables)?,
                            applied: row.applied,
                            applied_at: row.applied_at,
                            status: row.status,
                            risk_level: RiskLevel::from_str(&row.risk_level)? })
    }
}

/// Recomendaciones sobre `tune_recommendations`. El núcleo sólo escribe
/// `applied`, `applied_at` y `status`; `upsert` existe para seeding.
pub struct PgRecommendationStore<P: ConnectionProvider> {
    provider: Arc<P>,
}

impl<P: ConnectionProvider> PgRecommendationStore<P> {
    pub fn new(provider: P) -> Self {
        Self { provider: Arc::new(provider) }
    }
}

#[async_trait]
impl<P: ConnectionProvider> RecommendationStore for PgRecommendationStore<P> {
    async fn get(&self, id: &str) -> Result<Option<Recommendation>, StoreError> {
        let key = id.to_string();
        let row = run_blocking(&self.provider, "recommendations.get", move |conn| {
                      Ok(tune_recommendations::table.find(&key)
                                                    .select(RecommendationRow::as_select())
                                                    .first(conn)
                                                    .optional()?)
                  }).await?;
        Ok(row.map(Recommendation::try_from).transpose()?)
    }

    async fn update(&self, id: &str, update: RecommendationUpdate) -> Result<(), StoreError> {
        let key = id.to_string();
        let patch = RecommendationPatch::from(update);
        let updated = run_blocking(&self.provider, "recommendations.update", move |conn| {
                          if patch.is_empty() {
                              let exists = tune_recommendations::table.find(&key)
                                                                      .select(tune_recommendations::id)
                                                                      .first::<String>(conn)
                                                                      .optional()?;
                              return Ok(usize::from(exists.is_some()));
                          }
                          Ok(diesel::update(tune_recommendations::table.find(&key)).set(&patch).execute(conn)?)
                      }).await?;
        if updated == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn upsert(&self, rec: Recommendation) -> Result<(), StoreError> {
        let row = RecommendationRow::try_from(&rec)?;
        run_blocking(&self.provider, "recommendations.upsert", move |conn| {
            diesel::insert_into(tune_recommendations::table).values(&row)
                                                            .on_conflict(tune_recommendations::id)
                                                            .do_update()
                                                            .set(&row)
                                                            .execute(conn)?;
            Ok(())
        }).await?;
        Ok(())
    }
}
