//! Implementaciones Postgres (Diesel) de los stores del núcleo.
//!
//! - Paridad 1:1 con los backends en memoria de `tune-core::store`: mismas
//!   reglas de CAS en `claim`, "el primer terminal gana" en `update_status` y
//!   orden "más recientes primero" en los listados.
//! - Diesel es bloqueante: cada operación corre en `spawn_blocking` y reintenta
//!   errores transitorios con un backoff corto. Los inserts no idempotentes
//!   (audit trail) sólo reintentan la obtención de la conexión.
//! - El mapeo filas ↔ dominio queda aislado en cada submódulo.

use std::sync::Arc;

use diesel::pg::PgConnection;
use diesel::r2d2::{self, ConnectionManager};
use log::warn;

use crate::error::PersistenceError;
use crate::migrations::run_pending_migrations;

mod audit;
mod changes;
mod jobs;
mod recommendations;

pub use audit::PgAuditStore;
pub use changes::PgChangeStore;
pub use jobs::PgJobStore;
pub use recommendations::PgRecommendationStore;

/// Alias de tipo para el pool r2d2 de conexiones Postgres.
///
/// Al construirlo se corre el set de migraciones pendientes (una sola vez).
pub type PgPool = r2d2::Pool<ConnectionManager<PgConnection>>;

pub type PgPooledConnection = r2d2::PooledConnection<ConnectionManager<PgConnection>>;

/// Proveedor abstracto de conexiones.
///
/// Permite inyectar un pool real o, en tests, un proveedor que falla a
/// demanda sin acoplar los stores a r2d2.
pub trait ConnectionProvider: Send + Sync + 'static {
    fn connection(&self) -> Result<PgPooledConnection, PersistenceError>;
}

/// Implementación concreta de `ConnectionProvider` respaldada por un `PgPool`.
pub struct PoolProvider {
    pub pool: PgPool,
}

impl ConnectionProvider for PoolProvider {
    fn connection(&self) -> Result<PgPooledConnection, PersistenceError> {
        self.pool.get().map_err(|e| PersistenceError::TransientIo(format!("pool error: {e}")))
    }
}

/// Determina si un error es transitorio (recomendado reintentar con backoff).
///
/// Cubre conflictos de serialización, errores de pool/conexión y mensajes
/// comunes de desconexión que algunos drivers reportan como `Unknown`.
pub(crate) fn is_retryable(e: &PersistenceError) -> bool {
    match e {
        PersistenceError::SerializationConflict => true,
        PersistenceError::TransientIo(_) => true,
        PersistenceError::Unknown(msg) => {
            let m = msg.to_lowercase();
            m.contains("deadlock detected")
            || m.contains("could not serialize access due to concurrent update")
            || m.contains("terminating connection due to administrator command")
            || m.contains("connection closed")
            || m.contains("connection refused")
            || m.contains("timeout")
        }
        _ => false,
    }
}

/// Retry con backoff lineal corto: hasta 3 reintentos (15ms, 30ms, 45ms).
///
/// Sólo repite la unidad de trabajo provista por `f`; debe ser idempotente
/// o transaccional.
pub(crate) fn with_retry<F, T>(mut f: F) -> Result<T, PersistenceError>
    where F: FnMut() -> Result<T, PersistenceError>
{
    let mut attempts = 0;
    loop {
        match f() {
            Err(e) if is_retryable(&e) && attempts < 3 => {
                let delay_ms = 15 * ((attempts + 1) as u64);
                warn!("with_retry:retryable attempt={} err={e} sleep_ms={delay_ms}", attempts + 1);
                std::thread::sleep(std::time::Duration::from_millis(delay_ms));
                attempts += 1;
            }
            r => return r,
        }
    }
}

/// Corre `f` en el pool bloqueante de tokio con una conexión del proveedor,
/// aplicando `with_retry`.
pub(crate) async fn run_blocking<P, T, F>(provider: &Arc<P>, op: &'static str, mut f: F) -> Result<T, PersistenceError>
    where P: ConnectionProvider,
          T: Send + 'static,
          F: FnMut(&mut PgConnection) -> Result<T, PersistenceError> + Send + 'static
{
    let provider = Arc::clone(provider);
    tokio::task::spawn_blocking(move || {
        with_retry(|| {
            let mut conn = provider.connection()?;
            f(&mut *conn)
        })
    }).await
      .map_err(|e| PersistenceError::TransientIo(format!("{op}: blocking task failed: {e}")))?
}

/// Reintenta sólo `connect`; `f` corre una única vez, aunque falle con un
/// error transitorio.
pub(crate) fn connect_then_once<C, T, K, F>(connect: K, f: F) -> Result<T, PersistenceError>
    where K: FnMut() -> Result<C, PersistenceError>,
          F: FnOnce(&mut C) -> Result<T, PersistenceError>
{
    let mut conn = with_retry(connect)?;
    f(&mut conn)
}

/// Como `run_blocking` pero sin repetir `f`: para inserts que no se pueden
/// deduplicar, donde un commit con acuse perdido no debe duplicar la fila.
pub(crate) async fn run_blocking_once<P, T, F>(provider: &Arc<P>, op: &'static str, f: F) -> Result<T, PersistenceError>
    where P: ConnectionProvider,
          T: Send + 'static,
          F: FnOnce(&mut PgConnection) -> Result<T, PersistenceError> + Send + 'static
{
    let provider = Arc::clone(provider);
    tokio::task::spawn_blocking(move || connect_then_once(|| provider.connection(), |conn| f(&mut **conn)))
        .await
        .map_err(|e| PersistenceError::TransientIo(format!("{op}: blocking task failed: {e}")))?
}

/// Construye un pool Postgres r2d2 a partir de URL.
///
/// - Ajusta tamaños (`0` pasa a `1`; si `min > max`, usa `min = max`).
/// - Ejecuta las migraciones pendientes con la primera conexión.
/// - Devuelve `PersistenceError::TransientIo` ante errores del pool/manager.
pub fn build_pool(database_url: &str, min_size: u32, max_size: u32) -> Result<PgPool, PersistenceError> {
    let validated_min = min_size.max(1);
    let validated_max = max_size.max(1);
    if validated_min > validated_max {
        warn!("build_pool:min_gt_max min={validated_min} max={validated_max} -> min=max");
    }
    let manager = ConnectionManager::<PgConnection>::new(database_url);
    let pool = r2d2::Pool::builder().min_idle(Some(validated_min.min(validated_max)))
                                    .max_size(validated_max)
                                    .build(manager)
                                    .map_err(|e| PersistenceError::TransientIo(format!("pool build: {e}")))?;
    {
        let mut conn = pool.get()
                           .map_err(|e| PersistenceError::TransientIo(format!("pool get for migrations: {e}")))?;
        run_pending_migrations(&mut conn)?;
    }
    Ok(pool)
}

/// Helper de desarrollo: carga `.env`, lee configuración (DATABASE_URL,
/// tamaños) y construye un pool ya migrado.
pub fn build_dev_pool_from_env() -> Result<PgPool, PersistenceError> {
    crate::config::init_dotenv();
    let cfg = crate::config::DbConfig::from_env()?;
    build_pool(&cfg.url, cfg.min_connections, cfg.max_connections)
}
