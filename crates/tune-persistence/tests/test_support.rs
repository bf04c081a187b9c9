#![allow(dead_code)]

use once_cell::sync::Lazy;
use tune_persistence::config::DbConfig;
use tune_persistence::pg::{build_pool, PgPool, PoolProvider};
use tune_persistence::TargetPoolConfig;

pub static TEST_POOL: Lazy<Option<PgPool>> = Lazy::new(|| {
    if std::env::var("DATABASE_URL").is_err() {
        return None;
    }
    let cfg = DbConfig::from_env().ok()?;
    match build_pool(&cfg.url, 1, 4) {
        Ok(p) => Some(p),
        Err(e) => {
            eprintln!("No se pudo construir pool de test: {e}");
            None
        }
    }
});

/// Proveedor sobre el pool compartido; `None` si no hay base configurada.
pub fn provider() -> Option<PoolProvider> {
    match TEST_POOL.as_ref() {
        Some(pool) => Some(PoolProvider { pool: pool.clone() }),
        None => {
            eprintln!("DATABASE_URL no definido: omitiendo test");
            None
        }
    }
}

/// La misma base usada como destino `sqlx`.
pub fn target_config(label: &str) -> Option<TargetPoolConfig> {
    TEST_POOL.as_ref()?;
    let cfg = DbConfig::from_env().ok()?;
    Some(TargetPoolConfig::new(label, cfg.url))
}

/// Id único por test para no chocar con corridas concurrentes.
pub fn unique(prefix: &str) -> String {
    format!("{prefix}_{}", uuid::Uuid::new_v4().simple())
}
