//! Sesiones `sqlx` contra las bases destino (primario, réplica, sandbox).
//!
//! A diferencia de los stores (Diesel, bloqueantes), estas sesiones son async
//! y cancelables: soltar el future de una sentencia suelta la sesión. Una
//! sesión que quedó con estado (transacción abierta, `SET` de sesión sin
//! revertir o una sentencia interrumpida a mitad de camino) cierra su conexión
//! física en lugar de devolverla al pool.
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgArguments, PgPoolOptions};
use sqlx::query::Query;
use sqlx::{PgPool, Postgres};
use tune_core::db::{ColumnInfo, RelationInfo, RelationKind, SessionState};
use tune_core::{DbError, PoolConnector, SqlPool, SqlSession, SqlValue};
use tune_domain::naming::qualified;
use tune_domain::IoMetrics;

/// Parámetros de un pool destino.
#[derive(Debug, Clone)]
pub struct TargetPoolConfig {
    pub url: String,
    pub label: String,
    pub min_connections: u32,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl TargetPoolConfig {
    pub fn new(label: impl Into<String>, url: impl Into<String>) -> Self {
        Self { url: url.into(),
               label: label.into(),
               min_connections: 0,
               max_connections: 8,
               acquire_timeout: Duration::from_secs(10) }
    }

    fn options(&self) -> PgPoolOptions {
        PgPoolOptions::new().min_connections(self.min_connections.min(self.max_connections))
                            .max_connections(self.max_connections.max(1))
                            .acquire_timeout(self.acquire_timeout)
    }
}

fn map_sqlx(sql: &str, err: sqlx::Error) -> DbError {
    match err {
        sqlx::Error::Database(db) => DbError::statement(sql, db.message()),
        sqlx::Error::PoolTimedOut => DbError::Connection("pool timed out".into()),
        sqlx::Error::PoolClosed => DbError::Connection("pool closed".into()),
        e @ (sqlx::Error::Io(_) | sqlx::Error::Tls(_) | sqlx::Error::Protocol(_) | sqlx::Error::WorkerCrashed) => {
            DbError::Connection(e.to_string())
        }
        e @ (sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) | sqlx::Error::RowNotFound) => {
            DbError::Decode(e.to_string())
        }
        other => DbError::statement(sql, other.to_string()),
    }
}

fn bind<'q>(query: Query<'q, Postgres, PgArguments>, value: &SqlValue) -> Query<'q, Postgres, PgArguments> {
    match value {
        SqlValue::Null => query.bind(Option::<String>::None),
        SqlValue::Bool(b) => query.bind(*b),
        SqlValue::Int(i) => query.bind(*i),
        SqlValue::Float(f) => query.bind(*f),
        SqlValue::Text(s) => query.bind(s.clone()),
    }
}

/// Pool `sqlx` etiquetado.
pub struct SqlxPool {
    pool: PgPool,
    label: String,
}

impl SqlxPool {
    /// Conecta de inmediato: un destino inaccesible falla aquí.
    pub async fn connect(config: &TargetPoolConfig) -> Result<Self, DbError> {
        let pool = config.options()
                         .connect(&config.url)
                         .await
                         .map_err(|e| DbError::Connection(format!("{}: {e}", config.label)))?;
        debug!("sqlx_pool:connected label={}", config.label);
        Ok(Self { pool, label: config.label.clone() })
    }

    /// Conexión diferida hasta el primer `acquire`.
    pub fn connect_lazy(config: &TargetPoolConfig) -> Result<Self, DbError> {
        let pool = config.options()
                         .connect_lazy(&config.url)
                         .map_err(|e| DbError::Connection(format!("{}: {e}", config.label)))?;
        Ok(Self { pool, label: config.label.clone() })
    }

    pub fn from_pool(pool: PgPool, label: impl Into<String>) -> Self {
        Self { pool, label: label.into() }
    }
}

#[async_trait]
impl SqlPool for SqlxPool {
    async fn acquire(&self) -> Result<Box<dyn SqlSession>, DbError> {
        let conn = self.pool.acquire().await.map_err(|e| map_sqlx("<acquire>", e))?;
        Ok(Box::new(SqlxSession { conn, state: SessionState::default(), in_flight: false }))
    }

    fn label(&self) -> String {
        self.label.clone()
    }
}

/// Una conexión del pool más el estado de sesión observado.
pub struct SqlxSession {
    conn: PoolConnection<Postgres>,
    state: SessionState,
    in_flight: bool,
}

impl Drop for SqlxSession {
    fn drop(&mut self) {
        if self.in_flight || self.state.is_dirty() {
            debug!("sqlx_session:discard in_flight={} in_transaction={}",
                   self.in_flight,
                   self.state.in_transaction());
            self.conn.close_on_drop();
        }
    }
}

#[async_trait]
impl SqlSession for SqlxSession {
    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64, DbError> {
        self.in_flight = true;
        let result = if params.is_empty() {
            sqlx::Executor::execute(&mut *self.conn, sqlx::raw_sql(sql)).await
        } else {
            let mut query = sqlx::query(sql);
            for value in params {
                query = bind(query, value);
            }
            query.execute(&mut *self.conn).await
        };
        self.in_flight = false;
        match result {
            Ok(done) => {
                self.state.observe(sql);
                Ok(done.rows_affected())
            }
            Err(e) => {
                let err = map_sqlx(sql, e);
                if self.state.in_transaction() {
                    warn!("sqlx_session:statement_failed_in_transaction err={err}");
                }
                Err(err)
            }
        }
    }

    async fn relation(&mut self, schema: &str, name: &str) -> Result<Option<RelationInfo>, DbError> {
        const KIND_SQL: &str = "SELECT c.relkind::text FROM pg_catalog.pg_class c \
                                JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace \
                                WHERE n.nspname = $1 AND c.relname = $2 AND c.relkind IN ('r', 'p', 'v', 'm')";
        const COLUMNS_SQL: &str = "SELECT a.attname::text, format_type(a.atttypid, a.atttypmod), NOT a.attnotnull \
                                   FROM pg_catalog.pg_attribute a \
                                   JOIN pg_catalog.pg_class c ON c.oid = a.attrelid \
                                   JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace \
                                   WHERE n.nspname = $1 AND c.relname = $2 AND a.attnum > 0 AND NOT a.attisdropped \
                                   ORDER BY a.attnum";
        let kind: Option<String> = sqlx::query_scalar(KIND_SQL).bind(schema)
                                                                .bind(name)
                                                                .fetch_optional(&mut *self.conn)
                                                                .await
                                                                .map_err(|e| map_sqlx(KIND_SQL, e))?;
        let Some(kind) = kind else {
            return Ok(None);
        };
        let kind = match kind.as_str() {
            "v" | "m" => RelationKind::View,
            _ => RelationKind::Table,
        };
        let rows: Vec<(String, String, bool)> = sqlx::query_as(COLUMNS_SQL).bind(schema)
                                                                            .bind(name)
                                                                            .fetch_all(&mut *self.conn)
                                                                            .await
                                                                            .map_err(|e| map_sqlx(COLUMNS_SQL, e))?;
        let columns = rows.into_iter()
                          .map(|(name, data_type, nullable)| ColumnInfo { name, data_type, nullable })
                          .collect();
        Ok(Some(RelationInfo { schema: schema.to_string(), name: name.to_string(), kind, columns }))
    }

    async fn row_count(&mut self, schema: &str, name: &str) -> Result<u64, DbError> {
        let sql = format!("SELECT count(*) FROM {}", qualified(schema, name));
        let count: i64 = sqlx::query_scalar(&sql).fetch_one(&mut *self.conn).await.map_err(|e| map_sqlx(&sql, e))?;
        Ok(count.max(0) as u64)
    }

    async fn io_counters(&mut self) -> Result<IoMetrics, DbError> {
        const IO_SQL: &str = "SELECT COALESCE(blks_hit, 0)::bigint, COALESCE(blks_read, 0)::bigint, \
                              COALESCE(temp_files, 0)::bigint, COALESCE(temp_bytes, 0)::bigint, \
                              COALESCE(blk_read_time, 0)::float8, COALESCE(blk_write_time, 0)::float8 \
                              FROM pg_catalog.pg_stat_database WHERE datname = current_database()";
        let row: Option<(i64, i64, i64, i64, f64, f64)> =
            sqlx::query_as(IO_SQL).fetch_optional(&mut *self.conn).await.map_err(|e| map_sqlx(IO_SQL, e))?;
        Ok(row.map(|(blks_hit, blks_read, temp_files, temp_bytes, blk_read_time_ms, blk_write_time_ms)| IoMetrics {
                  blks_hit,
                  blks_read,
                  temp_files,
                  temp_bytes,
                  blk_read_time_ms,
                  blk_write_time_ms,
              })
              .unwrap_or_default())
    }

    async fn schemas_with_prefix(&mut self, prefix: &str) -> Result<Vec<String>, DbError> {
        const SCHEMAS_SQL: &str = "SELECT nspname::text FROM pg_catalog.pg_namespace \
                                   WHERE left(nspname, length($1)) = $1 ORDER BY nspname";
        sqlx::query_scalar(SCHEMAS_SQL).bind(prefix)
                                       .fetch_all(&mut *self.conn)
                                       .await
                                       .map_err(|e| map_sqlx(SCHEMAS_SQL, e))
    }
}

/// Reconstruye el pool de la réplica cuando el selector lo descarta.
pub struct SqlxConnector {
    config: TargetPoolConfig,
}

impl SqlxConnector {
    pub fn new(config: TargetPoolConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl PoolConnector for SqlxConnector {
    async fn connect(&self) -> Result<Arc<dyn SqlPool>, DbError> {
        let pool = SqlxPool::connect(&self.config).await?;
        Ok(Arc::new(pool))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_errors_keep_the_statement() {
        let err = map_sqlx("SELECT broken", sqlx::Error::RowNotFound);
        assert!(matches!(err, DbError::Decode(_)));
        let err = map_sqlx("SELECT 1", sqlx::Error::PoolTimedOut);
        assert_eq!(err, DbError::Connection("pool timed out".into()));
    }

    #[test]
    fn pool_options_clamp_sizes() {
        let mut cfg = TargetPoolConfig::new("replica", "postgres://localhost/x");
        cfg.min_connections = 20;
        cfg.max_connections = 0;
        let opts = cfg.options();
        assert_eq!(opts.get_max_connections(), 1);
        assert_eq!(opts.get_min_connections(), 0);
    }
}
