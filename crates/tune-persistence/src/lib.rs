//! tune-persistence
//!
//! Backends Postgres para los contratos de `tune-core`.
//!
//! Módulos:
//! - `pg`: stores durables (jobs, cambios aplicados, audit trail,
//!   recomendaciones) sobre Diesel + r2d2, con migraciones embebidas.
//! - `session`: pools `sqlx` para las bases destino (primario, réplica,
//!   sandbox), con sesiones async cancelables.
//! - `migrations`: runner embebido de migraciones Diesel.
//! - `config`: carga de configuración desde `.env`.
//! - `schema`: tablas Diesel declaradas para compilar queries.

pub mod config;
pub mod error;
pub mod migrations;
pub mod pg;
pub mod schema;
pub mod session;

pub use config::{init_dotenv, DbConfig};
pub use error::PersistenceError;
pub use pg::{build_dev_pool_from_env, build_pool, ConnectionProvider, PgAuditStore, PgChangeStore, PgJobStore, PgPool,
             PgRecommendationStore, PoolProvider};
pub use session::{SqlxConnector, SqlxPool, SqlxSession, TargetPoolConfig};
