//! Apply Manager: aplicación y reversión de recomendaciones contra una base
//! real, con allow-list, rollback derivado y audit trail.
//!
//! Máquina de estados por recomendación:
//!
//! ```text
//! no aplicada --apply--> aplicada --rollback--> no aplicada
//! ```
//!
//! `apply` sobre una aplicada y `rollback` sobre una no aplicada son errores
//! de precondición. Cada intento de `apply` / `rollback` deja exactamente una
//! entrada de auditoría (éxito o fallo).
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde_json::{json, Value};
use tune_domain::naming::{apply_schema_name, apply_schema_recommendation, apply_schema_timestamp, quote_ident,
                          APPLY_SCHEMA_PREFIX};
use tune_domain::{safety, AppliedChange, AuditAction, AuditLogEntry, AuditStatus, ChangeStatus, Recommendation,
                  RecommendationUpdate, RiskLevel, RollbackOutcome};

use crate::audit::AuditSink;
use crate::db::{SqlPool, SqlSession};
use crate::errors::{ApplyError, DbError, StoreError};
use crate::sandbox::drop_schema;
use crate::store::{ChangeStore, RecommendationStore};

/// Datos conocidos de un intento, para la entrada de auditoría de fallo.
///
/// Mientras está armado, soltarlo (el future del intento fue cancelado)
/// agenda la entrada de fallo en el runtime actual: cada intento deja su
/// entrada aunque no llegue a terminar.
struct Attempt {
    audit: AuditSink,
    action: AuditAction,
    recommendation_id: String,
    risk_level: RiskLevel,
    sql: Option<String>,
    rollback_sql: Option<String>,
    schema_name: Option<String>,
    armed: bool,
}

impl Attempt {
    fn new(audit: &AuditSink, action: AuditAction, recommendation_id: &str) -> Self {
        Self { audit: audit.clone(),
               action,
               recommendation_id: recommendation_id.to_string(),
               risk_level: RiskLevel::default(),
               sql: None,
               rollback_sql: None,
               schema_name: None,
               armed: true }
    }

    fn details(&self, error: Option<&str>, precondition: bool) -> Value {
        let mut details = json!({
            "sql": self.sql,
            "rollback_sql": self.rollback_sql,
            "schema_name": self.schema_name,
        });
        if let (Some(e), Value::Object(map)) = (error, &mut details) {
            map.insert("error".into(), Value::String(e.to_string()));
            map.insert("precondition".into(), Value::Bool(precondition));
        }
        details
    }

    /// Registra el fallo y devuelve el error.
    async fn fail(mut self, error: ApplyError) -> ApplyError {
        self.armed = false;
        warn!("{}:failed recommendation_id={} precondition={} err={error}",
              self.action.as_str(),
              self.recommendation_id,
              error.is_precondition());
        let details = self.details(Some(&error.to_string()), error.is_precondition());
        self.audit
            .record(self.action, &self.recommendation_id, details, self.risk_level, AuditStatus::Failed)
            .await;
        error
    }

    /// El resto del intento queda a cargo de la finalización.
    fn disarm(mut self) -> RiskLevel {
        self.armed = false;
        self.risk_level
    }
}

impl Drop for Attempt {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        warn!("{}:interrupted recommendation_id={}", self.action.as_str(), self.recommendation_id);
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let audit = self.audit.clone();
        let action = self.action;
        let id = std::mem::take(&mut self.recommendation_id);
        let details = self.details(Some("cancelled before completion"), false);
        let risk_level = self.risk_level;
        runtime.spawn(async move { audit.record(action, &id, details, risk_level, AuditStatus::Failed).await });
    }
}

pub struct ApplyManager {
    pool: Arc<dyn SqlPool>,
    recommendations: Arc<dyn RecommendationStore>,
    changes: Arc<dyn ChangeStore>,
    audit: AuditSink,
}

impl ApplyManager {
    pub fn new(pool: Arc<dyn SqlPool>,
               recommendations: Arc<dyn RecommendationStore>,
               changes: Arc<dyn ChangeStore>,
               audit: AuditSink)
               -> Self {
        Self { pool, recommendations, changes, audit }
    }

    pub fn validate_safety(&self, sql: &str) -> bool {
        safety::validate_safety(sql)
    }

    pub fn derive_rollback(&self, rec: &Recommendation) -> Option<String> {
        safety::derive_rollback(rec)
    }

    /// Aplica `sql_fix` de la recomendación dentro de un namespace propio.
    ///
    /// Cancelable hasta que la sentencia se ejecutó. Desde ahí el registro
    /// del cambio y la auditoría corren en una task propia que termina aunque
    /// el llamador se cancele.
    pub async fn apply(&self, recommendation_id: &str) -> Result<AppliedChange, ApplyError> {
        debug!("apply:start recommendation_id={recommendation_id}");
        let mut attempt = Attempt::new(&self.audit, AuditAction::RecommendationApplyFailed, recommendation_id);
        let change = match self.execute_apply(recommendation_id, &mut attempt).await {
            Ok(change) => change,
            Err(e) => return Err(attempt.fail(e).await),
        };
        let risk_level = attempt.disarm();
        let finish = tokio::spawn(record_apply(Arc::clone(&self.changes),
                                               Arc::clone(&self.recommendations),
                                               self.audit.clone(),
                                               change,
                                               risk_level));
        finish.await
              .map_err(|e| ApplyError::Store(StoreError::Backend(format!("apply bookkeeping task failed: {e}"))))?
    }

    async fn execute_apply(&self, id: &str, attempt: &mut Attempt) -> Result<AppliedChange, ApplyError> {
        let rec = self.recommendations
                      .get(id)
                      .await?
                      .ok_or_else(|| ApplyError::RecommendationNotFound(id.to_string()))?;
        attempt.risk_level = rec.risk_level;
        attempt.sql = Some(rec.sql_fix.clone());

        if rec.applied {
            return Err(ApplyError::AlreadyApplied(id.to_string()));
        }
        if self.changes.get(id).await?.is_some_and(|c| c.is_active()) {
            return Err(ApplyError::AlreadyApplied(id.to_string()));
        }
        if !safety::validate_safety(&rec.sql_fix) {
            return Err(ApplyError::UnsafeSql(rec.sql_fix.clone()));
        }
        let rollback_sql = safety::derive_rollback(&rec);
        attempt.rollback_sql = rollback_sql.clone();

        let applied_at = Utc::now();
        let schema_name = apply_schema_name(id, applied_at);
        attempt.schema_name = Some(schema_name.clone());

        let mut session = self.pool.acquire().await?;
        execute_in_schema(session.as_mut(), &schema_name, &rec.sql_fix).await?;
        drop(session);

        Ok(AppliedChange { recommendation_id: id.to_string(),
                           sql_executed: rec.sql_fix.clone(),
                           schema_name,
                           applied_at,
                           rollback_sql,
                           status: ChangeStatus::Applied,
                           rolled_back_at: None })
    }

    /// Revierte el cambio activo de la recomendación con su rollback.
    ///
    /// Misma división que `apply`: cancelable hasta ejecutar el rollback.
    pub async fn rollback(&self, recommendation_id: &str) -> Result<RollbackOutcome, ApplyError> {
        debug!("rollback:start recommendation_id={recommendation_id}");
        let mut attempt = Attempt::new(&self.audit, AuditAction::RecommendationRollbackFailed, recommendation_id);
        let outcome = match self.execute_rollback(recommendation_id, &mut attempt).await {
            Ok(outcome) => outcome,
            Err(e) => return Err(attempt.fail(e).await),
        };
        let risk_level = attempt.disarm();
        let finish = tokio::spawn(record_rollback(Arc::clone(&self.changes),
                                                  Arc::clone(&self.recommendations),
                                                  self.audit.clone(),
                                                  recommendation_id.to_string(),
                                                  outcome,
                                                  risk_level));
        finish.await
              .map_err(|e| ApplyError::Store(StoreError::Backend(format!("rollback bookkeeping task failed: {e}"))))?
    }

    async fn execute_rollback(&self, id: &str, attempt: &mut Attempt) -> Result<RollbackOutcome, ApplyError> {
        if let Ok(Some(rec)) = self.recommendations.get(id).await {
            attempt.risk_level = rec.risk_level;
        }
        let change = match self.changes.get(id).await? {
            Some(c) if c.is_active() => c,
            _ => return Err(ApplyError::NotApplied(id.to_string())),
        };
        attempt.sql = Some(change.sql_executed.clone());
        attempt.schema_name = Some(change.schema_name.clone());
        let rollback_sql = change.rollback_sql
                                 .clone()
                                 .filter(|s| !s.trim().is_empty())
                                 .ok_or_else(|| ApplyError::MissingRollback(id.to_string()))?;
        attempt.rollback_sql = Some(rollback_sql.clone());
        if !safety::validate_safety(&rollback_sql) {
            return Err(ApplyError::UnsafeSql(rollback_sql));
        }

        let mut session = self.pool.acquire().await?;
        execute_in_schema(session.as_mut(), &change.schema_name, &rollback_sql).await?;
        drop(session);

        Ok(RollbackOutcome { success: true,
                             sql_executed: rollback_sql,
                             schema_name: Some(change.schema_name),
                             rolled_back_at: Utc::now(),
                             rollback_available: false })
    }

    pub async fn audit_trail(&self, limit: usize) -> Result<Vec<AuditLogEntry>, ApplyError> {
        Ok(self.audit.trail(limit).await?)
    }

    pub async fn applied_changes(&self) -> Result<Vec<AppliedChange>, ApplyError> {
        Ok(self.changes.list().await?)
    }

    pub async fn change_status(&self, recommendation_id: &str) -> Result<Option<AppliedChange>, ApplyError> {
        Ok(self.changes.get(recommendation_id).await?)
    }

    /// Elimina namespaces de apply más viejos que `max_age`. Se conservan los
    /// que respaldan un cambio todavía activo; los nombres que no siguen la
    /// convención se omiten con un warning.
    pub async fn reap_old_sandboxes(&self, max_age: Duration) -> Result<usize, ApplyError> {
        let cutoff = chrono::Duration::from_std(max_age).ok()
                                                      .and_then(|age| Utc::now().checked_sub_signed(age))
                                                      .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let active: Vec<String> = self.changes
                                      .list()
                                      .await?
                                      .into_iter()
                                      .filter(AppliedChange::is_active)
                                      .map(|c| c.schema_name)
                                      .collect();

        let mut session = self.pool.acquire().await?;
        let names = session.schemas_with_prefix(APPLY_SCHEMA_PREFIX).await?;
        let mut reaped = 0;
        for name in names {
            let Some(created) = apply_schema_timestamp(&name) else {
                warn!("reap_old_sandboxes:malformed schema={name}");
                continue;
            };
            if created >= cutoff || active.contains(&name) {
                continue;
            }
            match drop_schema(session.as_mut(), &name).await {
                Ok(()) => {
                    reaped += 1;
                    info!("reap_old_sandboxes:dropped schema={name}");
                    let owner = apply_schema_recommendation(&name).unwrap_or_default();
                    self.audit
                        .record(AuditAction::Cleanup,
                                owner,
                                json!({
                                    "schema_name": name,
                                    "created_at": created,
                                    "age_secs": (Utc::now() - created).num_seconds(),
                                }),
                                RiskLevel::Low,
                                AuditStatus::Completed)
                        .await;
                }
                Err(e) => warn!("reap_old_sandboxes:drop_failed schema={name} err={e}"),
            }
        }
        Ok(reaped)
    }
}

/// Registro posterior a un apply ya ejecutado. `AppliedChange` es el
/// registro autoritativo: si no se puede guardar, la auditoría queda
/// `partial` con el rollback; un fallo al marcar la recomendación sólo se
/// registra en el log.
async fn record_apply(changes: Arc<dyn ChangeStore>,
                      recommendations: Arc<dyn RecommendationStore>,
                      audit: AuditSink,
                      change: AppliedChange,
                      risk_level: RiskLevel)
                      -> Result<AppliedChange, ApplyError> {
    let id = change.recommendation_id.clone();
    let mut details = json!({
        "sql_executed": change.sql_executed,
        "rollback_sql": change.rollback_sql,
        "schema_name": change.schema_name,
    });
    if let Err(e) = changes.upsert(&change).await {
        error!("apply:unrecorded recommendation_id={id} schema={} err={e}", change.schema_name);
        if let Value::Object(map) = &mut details {
            map.insert("error".into(), Value::String(e.to_string()));
        }
        audit.record(AuditAction::RecommendationApplied, &id, details, risk_level, AuditStatus::Partial).await;
        return Err(ApplyError::Unrecorded { recommendation_id: id, source: e });
    }
    if let Err(e) = recommendations.update(&id, RecommendationUpdate::mark_applied(change.applied_at)).await {
        warn!("apply:recommendation_flag_failed recommendation_id={id} err={e}");
    }
    audit.record(AuditAction::RecommendationApplied, &id, details, risk_level, AuditStatus::Completed).await;
    info!("apply:done recommendation_id={id} schema={} rollback_available={}",
          change.schema_name,
          change.rollback_sql.is_some());
    Ok(change)
}

async fn record_rollback(changes: Arc<dyn ChangeStore>,
                         recommendations: Arc<dyn RecommendationStore>,
                         audit: AuditSink,
                         id: String,
                         outcome: RollbackOutcome,
                         risk_level: RiskLevel)
                         -> Result<RollbackOutcome, ApplyError> {
    let mut details = json!({
        "sql_executed": outcome.sql_executed,
        "schema_name": outcome.schema_name,
    });
    if let Err(e) = changes.mark_rolled_back(&id, outcome.rolled_back_at).await {
        error!("rollback:unrecorded recommendation_id={id} err={e}");
        if let Value::Object(map) = &mut details {
            map.insert("error".into(), Value::String(e.to_string()));
        }
        audit.record(AuditAction::RecommendationRolledBack, &id, details, risk_level, AuditStatus::Partial).await;
        return Err(ApplyError::Unrecorded { recommendation_id: id, source: e });
    }
    if let Err(e) = recommendations.update(&id, RecommendationUpdate::mark_rolled_back()).await {
        warn!("rollback:recommendation_flag_failed recommendation_id={id} err={e}");
    }
    audit.record(AuditAction::RecommendationRolledBack, &id, details, risk_level, AuditStatus::Completed).await;
    info!("rollback:done recommendation_id={id}");
    Ok(outcome)
}

/// Ejecuta `sql` con el namespace de apply primero en la ruta de resolución.
///
/// Las sentencias que Postgres rechaza dentro de un bloque de transacción
/// (`CONCURRENTLY`, `ALTER SYSTEM`) corren en autocommit: el namespace se crea
/// en su propia sentencia y el `search_path` de sesión se revierte al final.
/// El resto (creación del namespace incluida) corre en una única transacción
/// con `SET LOCAL`, de modo que un fallo no deja nada atrás.
async fn execute_in_schema(session: &mut dyn SqlSession, schema: &str, sql: &str) -> Result<(), DbError> {
    let quoted = quote_ident(schema);
    let create = format!("CREATE SCHEMA IF NOT EXISTS {quoted}");

    if safety::requires_autocommit(sql) {
        session.execute(&create, &[]).await?;
        session.execute(&format!("SET search_path TO {quoted}, public"), &[]).await?;
        let executed = session.execute(sql, &[]).await;
        if let Err(e) = session.execute("RESET search_path", &[]).await {
            warn!("apply:reset_search_path_failed schema={schema} err={e}");
        }
        return executed.map(|_| ());
    }

    session.begin().await?;
    let executed = async {
        session.execute(&create, &[]).await?;
        session.execute(&format!("SET LOCAL search_path TO {quoted}, public"), &[]).await?;
        session.execute(sql, &[]).await
    }.await;
    match executed {
        Ok(_) => session.commit().await,
        Err(e) => {
            if let Err(rb) = session.rollback().await {
                warn!("apply:rollback_failed schema={schema} err={rb}");
            }
            Err(e)
        }
    }
}
