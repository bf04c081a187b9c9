//! Stores de cambios aplicados, audit trail y recomendaciones
//! (requiere DATABASE_URL).
mod test_support;

use chrono::Utc;
use serde_json::json;
use test_support::{provider, unique};
use tune_core::store::{AuditStore, ChangeStore, RecommendationStore};
use tune_core::StoreError;
use tune_domain::{AppliedChange, AuditAction, AuditLogEntry, AuditStatus, ChangeStatus, Recommendation,
                  RecommendationUpdate, RiskLevel};
use tune_persistence::{PgAuditStore, PgChangeStore, PgRecommendationStore};

#[tokio::test]
async fn change_lifecycle() {
    let Some(provider) = provider() else { return };
    let store = PgChangeStore::new(provider);
    let id = unique("rec");
    let change = AppliedChange { recommendation_id: id.clone(),
                                 sql_executed: "SET work_mem = '64MB'".into(),
                                 schema_name: format!("tune_apply_{id}_1700000000"),
                                 applied_at: Utc::now(),
                                 rollback_sql: Some("SET work_mem = '4MB';".into()),
                                 status: ChangeStatus::Applied,
                                 rolled_back_at: None };
    store.upsert(&change).await.unwrap();
    assert!(store.get(&id).await.unwrap().unwrap().is_active());

    assert!(store.mark_rolled_back(&id, Utc::now()).await.unwrap());
    assert!(!store.mark_rolled_back(&id, Utc::now()).await.unwrap());
    let rolled = store.get(&id).await.unwrap().unwrap();
    assert_eq!(rolled.status, ChangeStatus::RolledBack);
    assert!(rolled.rolled_back_at.is_some());

    // Re-aplicar reemplaza la fila y limpia rolled_back_at.
    store.upsert(&change).await.unwrap();
    let again = store.get(&id).await.unwrap().unwrap();
    assert!(again.is_active());
    assert_eq!(again.rolled_back_at, None);
    assert!(store.list().await.unwrap().iter().any(|c| c.recommendation_id == id));
}

#[tokio::test]
async fn audit_is_listed_newest_first() {
    let Some(provider) = provider() else { return };
    let store = PgAuditStore::new(provider);
    let id = unique("rec");
    for action in [AuditAction::RecommendationApplied, AuditAction::RecommendationRolledBack] {
        let entry = AuditLogEntry::new(action, id.clone(), json!({"environment": "test"}), RiskLevel::Low, AuditStatus::Completed);
        store.append(&entry).await.unwrap();
    }
    let ours: Vec<AuditLogEntry> = store.list(500).await.unwrap().into_iter().filter(|e| e.recommendation_id == id).collect();
    assert_eq!(ours.len(), 2);
    assert_eq!(ours[0].action_type, AuditAction::RecommendationRolledBack);
    assert_eq!(ours[1].details["environment"], "test");
}

#[tokio::test]
async fn recommendation_updates_touch_only_status_fields() {
    let Some(provider) = provider() else { return };
    let store = PgRecommendationStore::new(provider);
    let id = unique("rec");
    let rec = Recommendation::new(id.clone(),
                                  "CREATE INDEX CONCURRENTLY idx_a ON orders(a)",
                                  "SELECT * FROM orders WHERE a = 1",
                                  vec!["public.orders".into()]).with_risk(RiskLevel::Medium);
    store.upsert(rec.clone()).await.unwrap();
    assert_eq!(store.get(&id).await.unwrap().unwrap(), rec);

    let at = Utc::now();
    store.update(&id, RecommendationUpdate::mark_applied(at)).await.unwrap();
    let applied = store.get(&id).await.unwrap().unwrap();
    assert!(applied.applied);
    assert_eq!(applied.status, "applied");
    assert_eq!(applied.tables, rec.tables);
    assert_eq!(applied.sql_fix, rec.sql_fix);

    store.update(&id, RecommendationUpdate::mark_rolled_back()).await.unwrap();
    let back = store.get(&id).await.unwrap().unwrap();
    assert!(!back.applied);
    assert_eq!(back.applied_at, None);

    let err = store.update("missing-rec", RecommendationUpdate::mark_rolled_back()).await.unwrap_err();
    assert!(matches!(err, StoreError::NotFound(_)));
}
