use tune_domain::naming::{sandbox_schema_name, split_table_name};
use tune_domain::{derive_rollback, validate_safety, AuditAction, ChangeStatus, JobStatus, Recommendation, RecommendationUpdate, RiskLevel};
use uuid::Uuid;

#[test]
fn safety_allow_list_examples() {
    assert!(!validate_safety("DROP TABLE users"));
    assert!(validate_safety("CREATE INDEX CONCURRENTLY idx_a ON t(a)"));
}

#[test]
fn safety_rejects_anything_without_an_allowed_prefix() {
    let candidates = ["TRUNCATE orders",
                      "DELETE FROM users",
                      "VACUUM FULL users",
                      "ALTER TABLE users ADD COLUMN x int",
                      "CREATE UNIQUE INDEX CONCURRENTLY i ON t(a)",
                      "REINDEX INDEX CONCURRENTLY i",
                      "GRANT ALL ON users TO public",
                      "select pg_terminate_backend(1)"];
    for sql in candidates {
        assert!(!validate_safety(sql), "debe rechazar: {sql}");
    }
}

#[test]
fn rollback_derivation_round_trip() {
    let rec = Recommendation::new("r1", "CREATE INDEX CONCURRENTLY idx_foo ON bar(baz)", "SELECT * FROM bar", vec!["bar".into()]);
    let rollback = derive_rollback(&rec);
    assert_eq!(rollback.as_deref(), Some("DROP INDEX CONCURRENTLY idx_foo;"));
    assert!(validate_safety(rollback.as_deref().unwrap()));
}

#[test]
fn rollback_is_none_for_statements_without_heuristic() {
    let rec = Recommendation::new("r2", "DROP INDEX CONCURRENTLY idx_old", "SELECT 1", vec![]);
    assert_eq!(derive_rollback(&rec), None);
}

#[test]
fn recommendation_update_patch() {
    let mut rec = Recommendation::new("r3", "SET work_mem = '64MB'", "SELECT 1", vec![]).with_risk(RiskLevel::Low);
    let at = chrono::Utc::now();
    RecommendationUpdate::mark_applied(at).apply_to(&mut rec);
    assert!(rec.applied);
    assert_eq!(rec.applied_at, Some(at));
    RecommendationUpdate::mark_rolled_back().apply_to(&mut rec);
    assert!(!rec.applied);
    assert_eq!(rec.applied_at, None);
    assert_eq!(rec.status, "rolled_back");
}

#[test]
fn string_forms_are_stable() {
    assert_eq!(AuditAction::RecommendationApplyFailed.as_str(), "recommendation_apply_failed");
    assert_eq!("rolled_back".parse::<ChangeStatus>().unwrap(), ChangeStatus::RolledBack);
    assert_eq!(serde_json::to_value(JobStatus::Cancelled).unwrap(), "cancelled");
    assert_eq!(serde_json::to_value(AuditAction::Cleanup).unwrap(), "cleanup");
}

#[test]
fn sandbox_names_do_not_collide() {
    let a = sandbox_schema_name(Uuid::new_v4());
    let b = sandbox_schema_name(Uuid::new_v4());
    assert_ne!(a, b);
    assert!(split_table_name(&format!("{a}.orders")).is_some());
}
