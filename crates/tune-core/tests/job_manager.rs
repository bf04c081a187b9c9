
use std::time::Duration;

use chrono::Utc;
use test_support::{fast_config, index_rec, wait_terminal, wait_until, Fixture, ORDERS_QUERY};
use tune_core::{JobManagerConfig, JobStore};
use tune_domain::{AuditAction, Job, JobFilter, JobStatus, JobType, Recommendation};

#[tokio::test]
async fn benchmark_measures_and_cleans_up() {
    let fx = Fixture::new();
    fx.add(index_rec("r1")).await;
    let manager = fx.manager(fast_config());
    assert!(manager.start());

    let id = manager.submit("r1", JobType::Benchmark).await.unwrap();
    let job = wait_terminal(&manager, id).await;
    assert_eq!(job.status, JobStatus::Completed, "error: {:?}", job.error_message);
    assert!(job.started_at.is_some() && job.completed_at.is_some());

    let result = job.result.unwrap();
    assert_eq!(result["candidate_applied"], true);
    assert!(result["improvement"]["time_improvement_percent"].is_number());
    assert!(result["improvement"]["io_improvement_percent"].as_f64().unwrap() > 0.0);
    assert_eq!(result["tables_sampled"][0]["row_count"], 1_000);

    let schema = result["schema_name"].as_str().unwrap();
    assert!(!fx.replica.has_schema(schema));
    assert!(fx.schemas.list_active().is_empty());
    // El benchmark nunca toca el primario ni la base viva.
    assert!(!fx.primary.has_index("public", "idx_orders_customer"));
    assert!(!fx.live.has_index("public", "idx_orders_customer"));
    manager.stop().await;
}

#[tokio::test]
async fn settings_candidates_are_not_applied_in_the_sandbox() {
    let fx = Fixture::new();
    fx.add(Recommendation::new("r2", "SET work_mem = '256MB'", ORDERS_QUERY, vec!["orders".into()])).await;
    let manager = fx.manager(fast_config());
    manager.start();
    let id = manager.submit("r2", JobType::Benchmark).await.unwrap();
    let job = wait_terminal(&manager, id).await;
    assert_eq!(job.status, JobStatus::Completed);
    let result = job.result.unwrap();
    assert_eq!(result["candidate_applied"], false);
    assert!(result["optimized_metrics"].is_null());
    assert_eq!(result["improvement"]["time_improvement_percent"], 0.0);
    manager.stop().await;
}

#[tokio::test]
async fn failures_end_in_error_and_still_drop_the_sandbox() {
    let fx = Fixture::new();
    fx.add(index_rec("r1")).await;
    fx.add(Recommendation::new("empty", "SET work_mem = '8MB'", ORDERS_QUERY, vec![])).await;
    fx.replica.fail_on("customer_id = 42");
    let manager = fx.manager(fast_config());
    manager.start();

    let id = manager.submit("r1", JobType::Benchmark).await.unwrap();
    let job = wait_terminal(&manager, id).await;
    assert_eq!(job.status, JobStatus::Error);
    assert!(job.error_message.unwrap().contains("injected failure"));
    assert!(fx.replica.schema_names().iter().all(|s| !s.starts_with("tune_job_")));

    let missing = manager.submit("ghost", JobType::Benchmark).await.unwrap();
    let job = wait_terminal(&manager, missing).await;
    assert_eq!(job.error_message.as_deref(), Some("recommendation ghost not found"));

    let empty = manager.submit("empty", JobType::Benchmark).await.unwrap();
    let job = wait_terminal(&manager, empty).await;
    assert_eq!(job.status, JobStatus::Error);
    assert!(job.error_message.unwrap().contains("no tables"));
    manager.stop().await;
}

#[tokio::test]
async fn benchmark_without_replica_is_unavailable() {
    let fx = Fixture::without_replica();
    fx.add(index_rec("r1")).await;
    let manager = fx.manager(fast_config());
    manager.start();
    let id = manager.submit("r1", JobType::Benchmark).await.unwrap();
    let job = wait_terminal(&manager, id).await;
    assert_eq!(job.status, JobStatus::Error);
    assert!(job.error_message.unwrap().contains("benchmarking unavailable"));
    assert!(fx.primary.statements().is_empty());
    manager.stop().await;
}

#[tokio::test]
async fn cancelling_a_running_benchmark_releases_everything() {
    let fx = Fixture::new();
    fx.add(index_rec("r1")).await;
    fx.replica.delay_on("customer_id = 42", Duration::from_secs(5));
    let manager = fx.manager(fast_config());
    manager.start();

    let id = manager.submit("r1", JobType::Benchmark).await.unwrap();
    wait_until(&manager, id, |j| j.status == JobStatus::Running).await;
    // Esperar a que el sandbox exista antes de cancelar.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while fx.schemas.list_active().is_empty() {
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert!(manager.cancel(id).await.unwrap());
    let job = wait_terminal(&manager, id).await;
    assert_eq!(job.status, JobStatus::Cancelled);
    assert_eq!(job.error_message.as_deref(), Some("cancelled by request"));

    wait_until(&manager, id, |_| manager.active_count() == 0).await;
    assert!(fx.schemas.list_active().is_empty());
    assert!(fx.replica.schema_names().iter().all(|s| !s.starts_with("tune_job_")));
    assert_eq!(fx.replica.open_sessions(), 0);

    // Segunda cancelación y jobs desconocidos: no-op.
    assert!(!manager.cancel(id).await.unwrap());
    assert!(!manager.cancel(uuid::Uuid::new_v4()).await.unwrap());
    manager.stop().await;
}

#[tokio::test]
async fn cancelling_a_queued_job_prevents_execution() {
    let fx = Fixture::new();
    fx.add(index_rec("r1")).await;
    let manager = fx.manager(fast_config());

    let id = manager.submit("r1", JobType::Benchmark).await.unwrap();
    assert!(manager.cancel(id).await.unwrap());
    manager.start();
    wait_until(&manager, id, |_| manager.active_count() == 0).await;

    let job = manager.status(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert!(job.started_at.is_none());
    assert!(fx.replica.statements().is_empty());
    manager.stop().await;
}

#[tokio::test]
async fn completed_jobs_cannot_be_cancelled() {
    let fx = Fixture::new();
    fx.add(index_rec("r1")).await;
    let manager = fx.manager(fast_config());
    manager.start();
    let id = manager.submit("r1", JobType::Benchmark).await.unwrap();
    wait_terminal(&manager, id).await;
    assert!(!manager.cancel(id).await.unwrap());
    assert_eq!(manager.status(id).await.unwrap().unwrap().status, JobStatus::Completed);
    manager.stop().await;
}

#[tokio::test]
async fn apply_and_rollback_jobs_drive_the_apply_manager() {
    let fx = Fixture::new();
    fx.add(index_rec("r1")).await;
    let manager = fx.manager(fast_config());
    manager.start();

    let applied = manager.submit("r1", JobType::Apply).await.unwrap();
    let job = wait_terminal(&manager, applied).await;
    assert_eq!(job.status, JobStatus::Completed);
    let result = job.result.unwrap();
    assert_eq!(result["success"], true);
    assert_eq!(result["rollback_available"], true);
    assert!(fx.live.has_index("public", "idx_orders_customer"));

    let again = manager.submit("r1", JobType::Apply).await.unwrap();
    let job = wait_terminal(&manager, again).await;
    assert_eq!(job.status, JobStatus::Error);
    assert!(job.error_message.unwrap().contains("already applied"));

    let rolled = manager.submit("r1", JobType::Rollback).await.unwrap();
    let job = wait_terminal(&manager, rolled).await;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.result.unwrap()["rollback_available"], false);
    assert!(!fx.live.has_index("public", "idx_orders_customer"));
    manager.stop().await;
}

#[tokio::test]
async fn cancelling_a_running_apply_stops_it_before_the_change() {
    let fx = Fixture::new();
    fx.add(index_rec("r1")).await;
    fx.live.delay_on("idx_orders_customer", Duration::from_secs(5));
    let manager = fx.manager(fast_config());
    manager.start();

    let id = manager.submit("r1", JobType::Apply).await.unwrap();
    wait_until(&manager, id, |j| j.status == JobStatus::Running).await;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !fx.live.statements().iter().any(|s| s.contains("idx_orders_customer")) {
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert!(manager.cancel(id).await.unwrap());
    let job = wait_terminal(&manager, id).await;
    assert_eq!(job.status, JobStatus::Cancelled);
    wait_until(&manager, id, |_| manager.active_count() == 0).await;
    assert!(!fx.live.has_index("public", "idx_orders_customer"));
    assert!(fx.apply.change_status("r1").await.unwrap().is_none());
    assert_eq!(fx.live.open_sessions(), 0);

    // El intento interrumpido deja su entrada de auditoría.
    while fx.audit.is_empty() {
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let trail = fx.apply.audit_trail(10).await.unwrap();
    assert_eq!(trail.len(), 1);
    assert_eq!(trail[0].action_type, AuditAction::RecommendationApplyFailed);

    // Cancelado a tiempo, el apply se puede volver a lanzar.
    fx.live.clear_delays();
    let retry = manager.submit("r1", JobType::Apply).await.unwrap();
    assert_eq!(wait_terminal(&manager, retry).await.status, JobStatus::Completed);
    assert!(fx.live.has_index("public", "idx_orders_customer"));
    manager.stop().await;
}

#[tokio::test]
async fn start_is_idempotent_and_stop_keeps_queued_jobs_pending() {
    let fx = Fixture::new();
    fx.add(index_rec("r1")).await;
    let manager = fx.manager(fast_config());
    assert!(manager.start());
    assert!(!manager.start());
    assert!(manager.is_running());
    manager.stop().await;
    assert!(!manager.is_running());
    manager.stop().await;

    let id = manager.submit("r1", JobType::Benchmark).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(manager.status(id).await.unwrap().unwrap().status, JobStatus::Pending);

    assert!(manager.start());
    let job = wait_terminal(&manager, id).await;
    assert_eq!(job.status, JobStatus::Completed);
    manager.stop().await;
}

#[tokio::test]
async fn stop_cancels_running_benchmarks() {
    let fx = Fixture::new();
    fx.add(index_rec("r1")).await;
    fx.replica.delay_on("customer_id = 42", Duration::from_secs(5));
    let manager = fx.manager(fast_config());
    manager.start();
    let id = manager.submit("r1", JobType::Benchmark).await.unwrap();
    wait_until(&manager, id, |j| j.status == JobStatus::Running).await;

    manager.stop().await;
    let job = manager.status(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert_eq!(job.error_message.as_deref(), Some("cancelled: manager stopped"));
    assert!(fx.schemas.list_active().is_empty());
    assert_eq!(manager.active_count(), 0);
}

#[tokio::test]
async fn concurrency_is_bounded() {
    let fx = Fixture::new();
    fx.add(index_rec("r1")).await;
    fx.replica.delay_on("customer_id = 42", Duration::from_millis(100));
    let config = JobManagerConfig { max_concurrency: 2, ..fast_config() };
    let manager = fx.manager(config);
    manager.start();

    let mut ids = Vec::new();
    for _ in 0..6 {
        ids.push(manager.submit("r1", JobType::Benchmark).await.unwrap());
    }
    let running = JobFilter { status: Some(JobStatus::Running), ..Default::default() };
    let mut peak = 0;
    loop {
        let now_running = manager.list(running.clone()).await.unwrap().len();
        peak = peak.max(now_running);
        assert!(now_running <= 2, "{now_running} jobs en ejecución");
        assert!(fx.schemas.list_active().len() <= 2);
        let done = manager.list(JobFilter { status: Some(JobStatus::Completed), ..Default::default() })
                          .await
                          .unwrap()
                          .len();
        if done == ids.len() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(peak >= 1);
    manager.stop().await;
}

#[tokio::test]
async fn recover_fails_orphans_and_requeues_pending() {
    let fx = Fixture::new();
    fx.add(index_rec("r1")).await;

    let mut orphan = Job::new("r1", JobType::Benchmark);
    orphan.status = JobStatus::Running;
    orphan.started_at = Some(Utc::now());
    fx.jobs.create(&orphan).await.unwrap();
    let pending = Job::new("r1", JobType::Benchmark);
    fx.jobs.create(&pending).await.unwrap();

    let manager = fx.manager(fast_config());
    let report = manager.recover().await.unwrap();
    assert_eq!(report.interrupted, 1);
    assert_eq!(report.requeued, 1);

    let failed = manager.status(orphan.id).await.unwrap().unwrap();
    assert_eq!(failed.status, JobStatus::Error);
    assert_eq!(failed.error_message.as_deref(), Some("interrupted by process restart"));

    manager.start();
    let job = wait_terminal(&manager, pending.id).await;
    assert_eq!(job.status, JobStatus::Completed);
    // Un segundo recover no duplica trabajo.
    let report = manager.recover().await.unwrap();
    assert_eq!((report.interrupted, report.requeued), (0, 0));
    manager.stop().await;
}

#[tokio::test]
async fn cleanup_removes_only_old_terminal_jobs() {
    let fx = Fixture::new();
    let old = Utc::now() - chrono::Duration::hours(48);

    let mut finished = Job::new("r1", JobType::Benchmark);
    finished.status = JobStatus::Completed;
    finished.created_at = old;
    let mut stale_pending = Job::new("r1", JobType::Benchmark);
    stale_pending.created_at = old;
    let mut recent = Job::new("r1", JobType::Apply);
    recent.status = JobStatus::Error;
    for job in [&finished, &stale_pending, &recent] {
        fx.jobs.create(job).await.unwrap();
    }

    let manager = fx.manager(fast_config());
    assert_eq!(manager.cleanup_older_than(Duration::from_secs(24 * 3600)).await.unwrap(), 1);
    assert!(manager.status(finished.id).await.unwrap().is_none());
    assert!(manager.status(stale_pending.id).await.unwrap().is_some());
    assert!(manager.status(recent.id).await.unwrap().is_some());

    let listed = manager.list(JobFilter::default()).await.unwrap();
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].id, recent.id);
}
