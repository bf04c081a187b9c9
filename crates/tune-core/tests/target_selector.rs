
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use test_support::replica_config;
use tokio_util::sync::CancellationToken;
use tune_core::{DbError, MemoryDatabase, PoolConnector, ReplicaConfig, SqlPool, StaticConnector, TargetSelector};
use tune_domain::{OperationClass, TargetKind};

struct CountingConnector {
    db: MemoryDatabase,
    calls: AtomicUsize,
}

#[async_trait]
impl PoolConnector for CountingConnector {
    async fn connect(&self) -> Result<Arc<dyn SqlPool>, DbError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(self.db.clone()))
    }
}

fn selector(replica: Option<&MemoryDatabase>, primary: Option<&MemoryDatabase>) -> TargetSelector {
    let mut s = TargetSelector::new(replica_config());
    if let Some(p) = primary {
        s = s.with_primary(Arc::new(p.clone()));
    }
    if let Some(r) = replica {
        s = s.with_replica(Arc::new(StaticConnector::new(Arc::new(r.clone()))));
    }
    s
}

#[tokio::test]
async fn mutate_never_returns_primary() {
    let primary = MemoryDatabase::new("primary");
    let replica = MemoryDatabase::new("replica");
    for (with_replica, replica_up, with_primary) in [(false, false, true),
                                                     (true, false, true),
                                                     (true, true, true),
                                                     (false, false, false),
                                                     (true, true, false)]
    {
        replica.set_unavailable(!replica_up);
        let s = selector(with_replica.then_some(&replica), with_primary.then_some(&primary));
        let target = s.select_target(OperationClass::Mutate).await;
        assert_ne!(target.kind, TargetKind::Primary);
        let expected = if with_replica && replica_up { TargetKind::Replica } else { TargetKind::None };
        assert_eq!(target.kind, expected);
        assert_eq!(target.pool.is_some(), expected == TargetKind::Replica);
    }
}

#[tokio::test]
async fn reads_fall_back_to_primary() {
    let primary = MemoryDatabase::new("primary");
    let s = selector(None, Some(&primary));
    let target = s.select_target(OperationClass::Read).await;
    assert_eq!(target.kind, TargetKind::Primary);
    assert_eq!(target.pool.unwrap().label(), "primary");

    let nothing = selector(None, None);
    assert_eq!(nothing.select_target(OperationClass::Read).await.kind, TargetKind::None);
}

#[tokio::test]
async fn healthy_replica_serves_reads_and_mutations() {
    let primary = MemoryDatabase::new("primary");
    let replica = MemoryDatabase::new("replica");
    let s = selector(Some(&replica), Some(&primary));
    for class in [OperationClass::Read, OperationClass::Mutate] {
        let target = s.select_target(class).await;
        assert_eq!(target.kind, TargetKind::Replica);
        assert_eq!(target.pool.unwrap().label(), "replica");
    }
}

#[tokio::test]
async fn health_is_debounced_and_failed_check_reconnects() {
    let replica = MemoryDatabase::new("replica");
    let connector = Arc::new(CountingConnector { db: replica.clone(), calls: AtomicUsize::new(0) });
    let s = TargetSelector::new(replica_config()).with_replica(connector.clone());

    assert!(s.is_healthy().await);
    replica.set_unavailable(true);
    // Dentro del intervalo se reutiliza el último resultado.
    assert!(s.is_healthy().await);

    tokio::time::sleep(Duration::from_millis(40)).await;
    assert!(!s.is_healthy().await);
    assert_eq!(s.select_target(OperationClass::Mutate).await.kind, TargetKind::None);

    replica.set_unavailable(false);
    assert!(s.is_healthy().await);
    // Cada llamada tras el fallo reconstruyó el pool descartado.
    assert_eq!(connector.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn failed_check_is_retried_within_the_interval() {
    let replica = MemoryDatabase::new("replica");
    replica.set_unavailable(true);
    let connector = Arc::new(CountingConnector { db: replica.clone(), calls: AtomicUsize::new(0) });
    let config = ReplicaConfig { health_check_interval: Duration::from_secs(30), ..replica_config() };
    let s = TargetSelector::new(config).with_replica(connector.clone());

    assert_eq!(s.select_target(OperationClass::Mutate).await.kind, TargetKind::None);
    assert!(!s.status().await.replica_healthy);

    replica.set_unavailable(false);
    let target = s.select_target(OperationClass::Mutate).await;
    assert_eq!(target.kind, TargetKind::Replica);
    assert!(target.pool.is_some());
    assert_eq!(connector.calls.load(Ordering::SeqCst), 2);

    // Un resultado sano sí se reutiliza dentro del intervalo.
    assert_eq!(s.select_target(OperationClass::Mutate).await.kind, TargetKind::Replica);
    assert_eq!(connector.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn disabled_replica_is_never_selected() {
    let replica = MemoryDatabase::new("replica");
    let config = ReplicaConfig { enabled: false, ..replica_config() };
    let s = TargetSelector::new(config).with_replica(Arc::new(StaticConnector::new(Arc::new(replica))));
    assert!(!s.is_healthy().await);
    assert_eq!(s.select_target(OperationClass::Mutate).await.kind, TargetKind::None);
    let status = s.status().await;
    assert!(!status.enabled);
    assert!(!status.replica_configured);
    assert!(!status.primary_configured);
}

#[tokio::test]
async fn health_loop_checks_until_cancelled() {
    let replica = MemoryDatabase::new("replica");
    let s = Arc::new(selector(Some(&replica), None));
    let token = CancellationToken::new();
    let handle = Arc::clone(&s).spawn_health_loop(token.clone());
    tokio::time::sleep(Duration::from_millis(60)).await;
    let status = s.status().await;
    assert!(status.replica_healthy);
    assert!(status.last_checked_at.is_some());
    token.cancel();
    handle.await.unwrap();
}
