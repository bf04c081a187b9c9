//! Schema Manager: namespaces aislados por job sobre la réplica.
//!
//! Ciclo de vida de un sandbox:
//! 1. `create_sandbox`: registra al dueño, crea el namespace y copia una
//!    muestra de cada tabla (mismas columnas, tipos y nulabilidad).
//! 2. `run_in_sandbox` / `run_ddl_in_sandbox`: ejecutan con el sandbox como
//!    única ruta de resolución de nombres.
//! 3. `destroy_sandbox`: `DROP SCHEMA ... CASCADE`, idempotente.
//!
//! Un namespace con el prefijo de jobs y sin dueño en el registro es un
//! huérfano; `reap_orphans` los elimina.
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use log::{debug, info, warn};
use tune_domain::naming::{job_id_from_schema, qualified, quote_ident, sandbox_schema_name, split_table_name,
                          JOB_SCHEMA_PREFIX};
use tune_domain::{Measurement, OperationClass, SampledTable, TargetKind, TempSchema};
use uuid::Uuid;

use crate::db::{RelationKind, SqlPool, SqlSession, SqlValue};
use crate::errors::{DbError, SandboxError};
use crate::target::TargetSelector;

#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Tope de filas por tabla muestreada (no aplica a copias completas).
    pub max_sample_rows: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self { max_sample_rows: 100_000 }
    }
}

/// Dueños en memoria de los sandboxes vivos de este proceso.
#[derive(Default)]
pub struct SandboxRegistry {
    inner: DashMap<Uuid, TempSchema>,
}

impl SandboxRegistry {
    pub fn register(&self, schema: TempSchema) {
        self.inner.insert(schema.job_id, schema);
    }

    pub fn record_table(&self, job_id: Uuid, table: SampledTable) {
        if let Some(mut entry) = self.inner.get_mut(&job_id) {
            entry.sampled_tables.push(table);
        }
    }

    pub fn get(&self, job_id: Uuid) -> Option<TempSchema> {
        self.inner.get(&job_id).map(|e| e.value().clone())
    }

    pub fn remove(&self, job_id: Uuid) -> Option<TempSchema> {
        self.inner.remove(&job_id).map(|(_, v)| v)
    }

    pub fn contains(&self, job_id: Uuid) -> bool {
        self.inner.contains_key(&job_id)
    }

    pub fn list(&self) -> Vec<TempSchema> {
        let mut all: Vec<TempSchema> = self.inner.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        all
    }
}

pub struct SchemaManager {
    targets: Arc<TargetSelector>,
    registry: SandboxRegistry,
    config: SandboxConfig,
}

impl SchemaManager {
    pub fn new(targets: Arc<TargetSelector>, config: SandboxConfig) -> Self {
        Self { targets, registry: SandboxRegistry::default(), config }
    }

    async fn pool(&self) -> Result<Arc<dyn SqlPool>, SandboxError> {
        let target = self.targets.select_target(OperationClass::Mutate).await;
        match (target.kind, target.pool) {
            (TargetKind::Replica, Some(pool)) => Ok(pool),
            _ => Err(SandboxError::NoTarget),
        }
    }

    async fn session(&self) -> Result<Box<dyn SqlSession>, SandboxError> {
        let pool = self.pool().await?;
        match pool.acquire().await {
            Ok(session) => Ok(session),
            Err(e) => {
                if matches!(e, DbError::Connection(_)) {
                    self.targets.report_failure().await;
                }
                Err(e.into())
            }
        }
    }

    /// Crea el sandbox del job y copia una muestra de `tables`.
    ///
    /// `sample_percent` en (0, 100]; 100 o una vista implican copia completa.
    /// Las tablas que no se pueden introspectar o copiar se omiten con un
    /// warning; los errores de conexión abortan.
    pub async fn create_sandbox(&self, job_id: Uuid, tables: &[String], sample_percent: f64) -> Result<String, SandboxError> {
        if !(sample_percent > 0.0 && sample_percent <= 100.0) {
            return Err(SandboxError::InvalidSampleFraction(sample_percent));
        }
        let schema = sandbox_schema_name(job_id);
        debug!("create_sandbox:start job_id={job_id} schema={schema} tables={}", tables.len());
        let mut session = self.session().await?;
        self.registry.register(TempSchema::new(job_id, &schema));
        session.execute(&format!("CREATE SCHEMA {}", quote_ident(&schema)), &[]).await?;

        for raw in tables {
            match self.sample_table(session.as_mut(), &schema, raw, sample_percent).await {
                Ok(table) => {
                    debug!("create_sandbox:sampled schema={schema} table={} rows={}", table.name, table.row_count);
                    self.registry.record_table(job_id, table);
                }
                Err(SandboxError::Db(e @ DbError::Connection(_))) => return Err(e.into()),
                Err(e) => warn!("create_sandbox:skip_table schema={schema} table={raw} err={e}"),
            }
        }
        info!("create_sandbox:done job_id={job_id} schema={schema}");
        Ok(schema)
    }

    async fn sample_table(&self,
                          session: &mut dyn SqlSession,
                          schema: &str,
                          raw: &str,
                          sample_percent: f64)
                          -> Result<SampledTable, SandboxError> {
        let (src_schema, src_name) = split_table_name(raw).ok_or_else(|| SandboxError::InvalidTable(raw.to_string()))?;
        let info = session.relation(&src_schema, &src_name)
                          .await?
                          .ok_or_else(|| SandboxError::InvalidTable(format!("{raw}: relation not found")))?;
        if info.columns.is_empty() {
            return Err(SandboxError::InvalidTable(format!("{raw}: no columns")));
        }
        let columns = info.columns
                          .iter()
                          .map(|c| {
                              let null = if c.nullable { "" } else { " NOT NULL" };
                              format!("{} {}{null}", quote_ident(&c.name), c.data_type)
                          })
                          .collect::<Vec<_>>()
                          .join(", ");
        let target = qualified(schema, &src_name);
        let source = qualified(&src_schema, &src_name);
        session.execute(&format!("CREATE TABLE {target} ({columns})"), &[]).await?;

        let full_copy = info.kind == RelationKind::View || sample_percent >= 100.0;
        let copy = if full_copy {
            format!("INSERT INTO {target} SELECT * FROM {source}")
        } else {
            format!("INSERT INTO {target} SELECT * FROM {source} TABLESAMPLE BERNOULLI ({sample_percent}) LIMIT {}",
                    self.config.max_sample_rows)
        };
        session.execute(&copy, &[]).await?;
        session.execute(&format!("ANALYZE {target}"), &[]).await?;
        let row_count = session.row_count(schema, &src_name).await?;
        Ok(SampledTable { name: format!("{src_schema}.{src_name}"),
                          row_count,
                          sample_fraction: if full_copy { 100.0 } else { sample_percent } })
    }

    /// Ejecuta `sql` dentro del sandbox y mide tiempo de pared y delta de I/O.
    ///
    /// El delta proviene de contadores globales de la base: bajo concurrencia
    /// incluye trabajo de otras sesiones.
    pub async fn run_in_sandbox(&self, schema: &str, sql: &str, params: &[SqlValue]) -> Result<Measurement, SandboxError> {
        let mut session = self.session().await?;
        session.execute(&format!("SET search_path TO {}", quote_ident(schema)), &[]).await?;
        let measured = measure(session.as_mut(), sql, params).await;
        if let Err(e) = session.execute("RESET search_path", &[]).await {
            warn!("run_in_sandbox:reset_failed schema={schema} err={e}");
        }
        let m = measured?;
        debug!("run_in_sandbox:done schema={schema} elapsed_ms={:.3} blocks={}", m.elapsed_ms, m.io.total_blocks());
        Ok(m)
    }

    /// Ejecuta DDL dentro del sandbox. Un fallo se registra y devuelve
    /// `false`.
    pub async fn run_ddl_in_sandbox(&self, schema: &str, ddl: &str) -> bool {
        let result = async {
            let mut session = self.session().await?;
            session.execute(&format!("SET search_path TO {}", quote_ident(schema)), &[]).await?;
            let executed = session.execute(ddl, &[]).await;
            if let Err(e) = session.execute("RESET search_path", &[]).await {
                warn!("run_ddl_in_sandbox:reset_failed schema={schema} err={e}");
            }
            executed.map_err(SandboxError::from)
        }.await;
        match result {
            Ok(_) => true,
            Err(e) => {
                warn!("run_ddl_in_sandbox:failed schema={schema} err={e}");
                false
            }
        }
    }

    /// Elimina el sandbox del job. El registro se borra aunque el `DROP`
    /// falle (el namespace queda como huérfano para `reap_orphans`).
    pub async fn destroy_sandbox(&self, job_id: Uuid) -> bool {
        let schema = self.registry
                         .remove(job_id)
                         .map(|t| t.schema_name)
                         .unwrap_or_else(|| sandbox_schema_name(job_id));
        let dropped = async {
            let mut session = self.session().await?;
            drop_schema(session.as_mut(), &schema).await?;
            Ok::<(), SandboxError>(())
        }.await;
        match dropped {
            Ok(()) => {
                debug!("destroy_sandbox:done job_id={job_id} schema={schema}");
                true
            }
            Err(e) => {
                warn!("destroy_sandbox:failed job_id={job_id} schema={schema} err={e}");
                false
            }
        }
    }

    pub fn list_active(&self) -> Vec<TempSchema> {
        self.registry.list()
    }

    pub fn sandbox(&self, job_id: Uuid) -> Option<TempSchema> {
        self.registry.get(job_id)
    }

    pub fn is_active(&self, job_id: Uuid) -> bool {
        self.registry.contains(job_id)
    }

    /// Elimina namespaces de jobs sin dueño vivo. Idempotente.
    pub async fn reap_orphans(&self) -> Result<usize, SandboxError> {
        let mut session = self.session().await?;
        let names = session.schemas_with_prefix(JOB_SCHEMA_PREFIX).await?;
        let mut reaped = 0;
        for name in names {
            let Some(job_id) = job_id_from_schema(&name) else {
                debug!("reap_orphans:skip_foreign schema={name}");
                continue;
            };
            if self.registry.contains(job_id) {
                continue;
            }
            match drop_schema(session.as_mut(), &name).await {
                Ok(()) => {
                    info!("reap_orphans:dropped schema={name}");
                    reaped += 1;
                }
                Err(e) => warn!("reap_orphans:drop_failed schema={name} err={e}"),
            }
        }
        Ok(reaped)
    }
}

async fn measure(session: &mut dyn SqlSession, sql: &str, params: &[SqlValue]) -> Result<Measurement, SandboxError> {
    let before = session.io_counters().await?;
    let started = Instant::now();
    session.execute(sql, params).await?;
    let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
    let after = session.io_counters().await?;
    Ok(Measurement { elapsed_ms, io: after.delta_since(&before) })
}

pub(crate) async fn drop_schema(session: &mut dyn SqlSession, schema: &str) -> Result<(), DbError> {
    session.execute(&format!("DROP SCHEMA IF EXISTS {} CASCADE", quote_ident(schema)), &[]).await.map(|_| ())
}
