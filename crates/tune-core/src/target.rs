//! Política de selección de la base destino para benchmarks.
//!
//! Regla central: una operación `Mutate` jamás se dirige al primario. Sin
//! réplica sana el resultado es `TargetKind::None` y el llamador reporta
//! "benchmarking unavailable". Las lecturas prefieren la réplica y caen al
//! primario.
//!
//! Un chequeo sano se cachea durante `health_check_interval`. Un chequeo
//! fallido descarta el pool y no se cachea: la próxima selección lo
//! reconstruye a través del `PoolConnector`.
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tune_domain::{OperationClass, ReplicaHealth, TargetKind};

use crate::db::{PoolConnector, SqlPool};
use crate::errors::DbError;

#[derive(Debug, Clone)]
pub struct ReplicaConfig {
    pub enabled: bool,
    pub health_check_interval: Duration,
    pub check_timeout: Duration,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self { enabled: true, health_check_interval: Duration::from_secs(30), check_timeout: Duration::from_secs(5) }
    }
}

/// Destino elegido. `pool` es `None` sólo cuando `kind == None`.
#[derive(Clone)]
pub struct Target {
    pub kind: TargetKind,
    pub pool: Option<Arc<dyn SqlPool>>,
}

impl Target {
    fn none() -> Self {
        Self { kind: TargetKind::None, pool: None }
    }
}

impl std::fmt::Debug for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Target")
         .field("kind", &self.kind)
         .field("pool", &self.pool.as_ref().map(|p| p.label()))
         .finish()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TargetStatus {
    pub enabled: bool,
    pub replica_configured: bool,
    pub replica_healthy: bool,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub primary_configured: bool,
}

/// Conector que siempre entrega el mismo pool (pools ya construidos, tests).
pub struct StaticConnector {
    pool: Arc<dyn SqlPool>,
}

impl StaticConnector {
    pub fn new(pool: Arc<dyn SqlPool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PoolConnector for StaticConnector {
    async fn connect(&self) -> Result<Arc<dyn SqlPool>, DbError> {
        Ok(Arc::clone(&self.pool))
    }
}

struct ReplicaSlot {
    pool: Option<Arc<dyn SqlPool>>,
    health: ReplicaHealth,
}

pub struct TargetSelector {
    primary: Option<Arc<dyn SqlPool>>,
    connector: Option<Arc<dyn PoolConnector>>,
    replica: Mutex<ReplicaSlot>,
    config: ReplicaConfig,
}

impl TargetSelector {
    pub fn new(config: ReplicaConfig) -> Self {
        let health = ReplicaHealth::unknown(config.health_check_interval);
        Self { primary: None, connector: None, replica: Mutex::new(ReplicaSlot { pool: None, health }), config }
    }

    pub fn with_primary(mut self, pool: Arc<dyn SqlPool>) -> Self {
        self.primary = Some(pool);
        self
    }

    pub fn with_replica(mut self, connector: Arc<dyn PoolConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn config(&self) -> &ReplicaConfig {
        &self.config
    }

    fn replica_configured(&self) -> bool {
        self.config.enabled && self.connector.is_some()
    }

    /// Chequeo debounced de la réplica. Dentro del intervalo un resultado
    /// sano se reutiliza sin tocar la red; uno fallido se reintenta.
    pub async fn is_healthy(&self) -> bool {
        self.healthy_replica().await.is_some()
    }

    async fn healthy_replica(&self) -> Option<Arc<dyn SqlPool>> {
        let connector = match (&self.connector, self.config.enabled) {
            (Some(c), true) => c,
            _ => return None,
        };
        let mut slot = self.replica.lock().await;
        let now = Utc::now();
        // Sólo un resultado sano se reutiliza: tras un fallo el pool está
        // descartado y la siguiente llamada intenta reconstruirlo.
        if slot.health.is_fresh(now) && slot.health.is_healthy {
            if let Some(pool) = &slot.pool {
                return Some(Arc::clone(pool));
            }
        }

        if slot.pool.is_none() {
            match connector.connect().await {
                Ok(pool) => {
                    info!("target:replica_connected label={}", pool.label());
                    slot.pool = Some(pool);
                }
                Err(e) => {
                    warn!("target:replica_connect_failed err={e}");
                    slot.health.is_healthy = false;
                    slot.health.last_checked_at = Some(now);
                    return None;
                }
            }
        }

        let pool = slot.pool.clone()?;
        let healthy = match tokio::time::timeout(self.config.check_timeout, ping_replica(pool.as_ref())).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!("target:replica_check_failed label={} err={e}", pool.label());
                false
            }
            Err(_) => {
                warn!("target:replica_check_timeout label={} timeout_ms={}",
                      pool.label(),
                      self.config.check_timeout.as_millis());
                false
            }
        };
        if slot.health.is_healthy != healthy || slot.health.last_checked_at.is_none() {
            info!("target:replica_health healthy={healthy}");
        }
        slot.health.is_healthy = healthy;
        slot.health.last_checked_at = Some(now);
        if healthy {
            Some(pool)
        } else {
            slot.pool = None;
            None
        }
    }

    /// Invalida el cache de salud tras un error de conexión observado por un
    /// llamador; el próximo uso vuelve a sondear.
    pub async fn report_failure(&self) {
        let mut slot = self.replica.lock().await;
        slot.health.last_checked_at = None;
        slot.health.is_healthy = false;
        slot.pool = None;
    }

    pub async fn select_target(&self, class: OperationClass) -> Target {
        if let Some(pool) = self.healthy_replica().await {
            return Target { kind: TargetKind::Replica, pool: Some(pool) };
        }
        match (class, &self.primary) {
            (OperationClass::Read, Some(primary)) => Target { kind: TargetKind::Primary, pool: Some(Arc::clone(primary)) },
            (OperationClass::Mutate, _) => {
                debug!("target:none class=mutate replica_configured={}", self.replica_configured());
                Target::none()
            }
            _ => Target::none(),
        }
    }

    pub async fn status(&self) -> TargetStatus {
        let slot = self.replica.lock().await;
        TargetStatus { enabled: self.config.enabled,
                       replica_configured: self.replica_configured(),
                       replica_healthy: slot.health.is_healthy,
                       last_checked_at: slot.health.last_checked_at,
                       primary_configured: self.primary.is_some() }
    }

    /// Sondea la réplica con la cadencia del debounce hasta que se cancele
    /// `token`.
    pub fn spawn_health_loop(self: Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            if !self.replica_configured() {
                debug!("target:health_loop skipped (no replica)");
                return;
            }
            let interval = self.config.health_check_interval.max(Duration::from_millis(10));
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        let healthy = self.is_healthy().await;
                        debug!("target:health_loop healthy={healthy}");
                    }
                }
            }
            debug!("target:health_loop stopped");
        })
    }
}

async fn ping_replica(pool: &dyn SqlPool) -> Result<(), DbError> {
    let mut session = pool.acquire().await?;
    session.ping().await
}
