
use test_support::{Fixture, ORDERS_QUERY};
use tune_core::SandboxError;
use tune_domain::naming::sandbox_schema_name;
use uuid::Uuid;

fn tables(names: &[&str]) -> Vec<String> {
    names.iter().map(|n| n.to_string()).collect()
}

#[tokio::test]
async fn sandbox_copies_a_capped_sample_of_each_table() {
    let fx = Fixture::new();
    let job_id = Uuid::new_v4();
    let schema = fx.schemas.create_sandbox(job_id, &tables(&["orders", "public.customers"]), 10.0).await.unwrap();

    assert_eq!(schema, sandbox_schema_name(job_id));
    assert!(fx.replica.has_schema(&schema));
    assert_eq!(fx.replica.relation_rows(&schema, "orders"), Some(1_000));
    assert_eq!(fx.replica.relation_rows(&schema, "customers"), Some(200));
    let sandbox = fx.schemas.sandbox(job_id).unwrap();
    assert_eq!(sandbox.sampled_tables.len(), 2);
    assert_eq!(sandbox.sampled_tables[0].name, "public.orders");
    assert_eq!(sandbox.sampled_tables[0].sample_fraction, 10.0);
    assert!(fx.replica.statements().iter().any(|s| s.contains("TABLESAMPLE BERNOULLI (10)")));
    // Nada se escribe en el primario.
    assert!(!fx.primary.has_schema(&schema));

    let capped = Uuid::new_v4();
    let schema = fx.schemas.create_sandbox(capped, &tables(&["orders"]), 90.0).await.unwrap();
    assert_eq!(fx.replica.relation_rows(&schema, "orders"), Some(5_000));
}

#[tokio::test]
async fn views_and_full_fraction_are_copied_whole() {
    let fx = Fixture::new();
    fx.replica.add_view("public", "big_orders", &[("id", "bigint")], 300);
    let job_id = Uuid::new_v4();
    let schema = fx.schemas.create_sandbox(job_id, &tables(&["big_orders"]), 1.0).await.unwrap();
    assert_eq!(fx.replica.relation_rows(&schema, "big_orders"), Some(300));
    assert_eq!(fx.schemas.sandbox(job_id).unwrap().sampled_tables[0].sample_fraction, 100.0);

    let full = Uuid::new_v4();
    let schema = fx.schemas.create_sandbox(full, &tables(&["customers"]), 100.0).await.unwrap();
    assert_eq!(fx.replica.relation_rows(&schema, "customers"), Some(2_000));
}

#[tokio::test]
async fn unknown_tables_are_skipped() {
    let fx = Fixture::new();
    let job_id = Uuid::new_v4();
    fx.schemas.create_sandbox(job_id, &tables(&["missing", "bad;name", "orders"]), 50.0).await.unwrap();
    let sampled = fx.schemas.sandbox(job_id).unwrap().sampled_tables;
    assert_eq!(sampled.len(), 1);
    assert_eq!(sampled[0].name, "public.orders");
}

#[tokio::test]
async fn run_in_sandbox_only_resolves_sandbox_tables() {
    let fx = Fixture::new();
    let job_id = Uuid::new_v4();
    let schema = fx.schemas.create_sandbox(job_id, &tables(&["orders"]), 10.0).await.unwrap();

    let m = fx.schemas.run_in_sandbox(&schema, ORDERS_QUERY, &[]).await.unwrap();
    assert!(m.elapsed_ms >= 0.0);
    assert!(m.io.total_blocks() > 0);
    assert_eq!(fx.replica.statements().last().map(String::as_str), Some("RESET search_path"));

    // `customers` existe en public pero no en el sandbox.
    let err = fx.schemas.run_in_sandbox(&schema, "SELECT * FROM customers", &[]).await.unwrap_err();
    assert!(matches!(err, SandboxError::Db(_)));
    assert_eq!(fx.replica.statements().last().map(String::as_str), Some("RESET search_path"));
}

#[tokio::test]
async fn ddl_failures_are_reported_as_false() {
    let fx = Fixture::new();
    let job_id = Uuid::new_v4();
    let schema = fx.schemas.create_sandbox(job_id, &tables(&["orders"]), 10.0).await.unwrap();
    assert!(fx.schemas.run_ddl_in_sandbox(&schema, "CREATE INDEX CONCURRENTLY idx_a ON orders(customer_id)").await);
    assert!(fx.replica.has_index(&schema, "idx_a"));
    assert!(!fx.schemas.run_ddl_in_sandbox(&schema, "CREATE INDEX CONCURRENTLY idx_b ON nowhere(x)").await);
    assert!(!fx.replica.has_index("public", "idx_a"));
}

#[tokio::test]
async fn destroy_is_idempotent() {
    let fx = Fixture::new();
    let job_id = Uuid::new_v4();
    let schema = fx.schemas.create_sandbox(job_id, &tables(&["orders"]), 10.0).await.unwrap();
    assert_eq!(fx.schemas.list_active().len(), 1);
    assert!(fx.schemas.destroy_sandbox(job_id).await);
    assert!(!fx.replica.has_schema(&schema));
    assert!(fx.schemas.list_active().is_empty());
    assert!(fx.schemas.destroy_sandbox(job_id).await);
}

#[tokio::test]
async fn failed_drop_leaves_an_orphan_that_reaping_removes_once() {
    let fx = Fixture::new();
    let job_id = Uuid::new_v4();
    let schema = fx.schemas.create_sandbox(job_id, &tables(&["orders"]), 10.0).await.unwrap();
    let live_job = Uuid::new_v4();
    let live_schema = fx.schemas.create_sandbox(live_job, &tables(&["orders"]), 10.0).await.unwrap();

    fx.replica.fail_on("DROP SCHEMA");
    assert!(!fx.schemas.destroy_sandbox(job_id).await);
    assert!(fx.replica.has_schema(&schema));
    assert!(fx.schemas.sandbox(job_id).is_none());
    fx.replica.clear_failures();

    assert_eq!(fx.schemas.reap_orphans().await.unwrap(), 1);
    assert!(!fx.replica.has_schema(&schema));
    assert!(fx.replica.has_schema(&live_schema));
    assert_eq!(fx.schemas.reap_orphans().await.unwrap(), 0);
}

#[tokio::test]
async fn no_replica_means_no_sandbox() {
    let fx = Fixture::without_replica();
    let err = fx.schemas.create_sandbox(Uuid::new_v4(), &tables(&["orders"]), 10.0).await.unwrap_err();
    assert!(matches!(err, SandboxError::NoTarget));
    assert!(err.to_string().contains("benchmarking unavailable"));
    assert!(fx.primary.statements().is_empty());
}

#[tokio::test]
async fn sample_fraction_must_be_in_range() {
    let fx = Fixture::new();
    for bad in [0.0, -1.0, 100.5, f64::NAN] {
        let err = fx.schemas.create_sandbox(Uuid::new_v4(), &tables(&["orders"]), bad).await.unwrap_err();
        assert!(matches!(err, SandboxError::InvalidSampleFraction(_)));
    }
    assert!(fx.schemas.list_active().is_empty());
}
