//! Configuración central de la aplicación.
//!
//! Carga variables de entorno (`.env` vía `tune_persistence::init_dotenv`) y
//! las traduce a las configuraciones de cada componente: store durable,
//! pools destino, selector de réplica, Schema Manager y Job Manager.
//! Un valor presente pero inválido es un error de configuración, nunca un
//! panic.
use std::env;
use std::str::FromStr;
use std::time::Duration;

use tune_core::{JobManagerConfig, ReplicaConfig, SandboxConfig};
use tune_persistence::config::parse_value;
use tune_persistence::{DbConfig, TargetPoolConfig};

use crate::errors::AppError;

/// Configuración completa del servicio.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Store durable (jobs, cambios, auditoría, recomendaciones).
    pub store: DbConfig,
    /// Primario: sólo lecturas.
    pub primary_url: Option<String>,
    /// Réplica: destino de los sandboxes de benchmark.
    pub replica_url: Option<String>,
    /// Base donde se aplican y revierten los cambios.
    pub sandbox_url: Option<String>,
    pub replica: ReplicaConfig,
    pub sandbox: SandboxConfig,
    pub jobs: JobManagerConfig,
    /// Edad máxima de los namespaces `tune_apply_*` antes de eliminarlos.
    pub sandbox_max_age: Duration,
    /// Retención de jobs terminales.
    pub job_retention: Duration,
    /// Período del ciclo de mantenimiento en `serve`.
    pub maintenance_interval: Duration,
    /// Etiqueta de entorno que acompaña cada entrada de auditoría.
    pub environment: String,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, AppError> {
        tune_persistence::init_dotenv();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Construye la configuración leyendo cada clave con `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, AppError>
        where F: Fn(&str) -> Option<String>
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let num = |key: &str, default: u64| parse(key, lookup(key), default);

        let store_url = get("DATABASE_URL").ok_or_else(|| AppError::Config("DATABASE_URL no definido".into()))?;
        let store = DbConfig { url: store_url,
                               min_connections: parse("DATABASE_MIN_CONNECTIONS", lookup("DATABASE_MIN_CONNECTIONS"), 2)?,
                               max_connections: parse("DATABASE_MAX_CONNECTIONS", lookup("DATABASE_MAX_CONNECTIONS"), 16)? };

        let replica = ReplicaConfig { enabled: parse("TUNE_REPLICA_ENABLED", lookup("TUNE_REPLICA_ENABLED"), true)?,
                                      health_check_interval: Duration::from_secs(num("TUNE_REPLICA_HEALTH_SECS", 30)?),
                                      ..ReplicaConfig::default() };

        let sample_percent: f64 = parse("TUNE_SAMPLE_PERCENT", lookup("TUNE_SAMPLE_PERCENT"), 10.0)?;
        if !(sample_percent > 0.0 && sample_percent <= 100.0) {
            return Err(AppError::Config(format!("TUNE_SAMPLE_PERCENT fuera de rango (0, 100]: {sample_percent}")));
        }
        let max_concurrency: usize = parse("TUNE_MAX_CONCURRENT_JOBS", lookup("TUNE_MAX_CONCURRENT_JOBS"), 4)?;
        if max_concurrency == 0 {
            return Err(AppError::Config("TUNE_MAX_CONCURRENT_JOBS debe ser mayor que 0".into()));
        }
        let jobs = JobManagerConfig { max_concurrency,
                                      queue_capacity: parse("TUNE_QUEUE_CAPACITY", lookup("TUNE_QUEUE_CAPACITY"), 256usize)?.max(1),
                                      poll_interval: Duration::from_millis(num("TUNE_POLL_MS", 250)?.max(1)),
                                      sample_percent,
                                      ..JobManagerConfig::default() };

        let sandbox = SandboxConfig { max_sample_rows: num("TUNE_MAX_SAMPLE_ROWS", 100_000)? };

        Ok(Self { store,
                  primary_url: get("PRIMARY_DATABASE_URL"),
                  replica_url: get("REPLICA_DATABASE_URL"),
                  sandbox_url: get("SANDBOX_DATABASE_URL"),
                  replica,
                  sandbox,
                  jobs,
                  sandbox_max_age: Duration::from_secs(num("TUNE_SANDBOX_MAX_AGE_SECS", 24 * 3600)?),
                  job_retention: Duration::from_secs(num("TUNE_JOB_RETENTION_HOURS", 7 * 24)? * 3600),
                  maintenance_interval: Duration::from_secs(num("TUNE_MAINTENANCE_SECS", 300)?.max(1)),
                  environment: get("TUNE_ENVIRONMENT").unwrap_or_else(|| "development".to_string()) })
    }

    pub fn primary_pool(&self) -> Option<TargetPoolConfig> {
        self.primary_url.as_ref().map(|url| TargetPoolConfig::new("primary", url.as_str()))
    }

    pub fn replica_pool(&self) -> Option<TargetPoolConfig> {
        self.replica_url.as_ref().map(|url| TargetPoolConfig::new("replica", url.as_str()))
    }

    /// Destino de apply/rollback: `SANDBOX_DATABASE_URL`, o la réplica si no
    /// está definido. El primario nunca se usa para mutar.
    pub fn sandbox_pool(&self) -> Option<TargetPoolConfig> {
        match (&self.sandbox_url, &self.replica_url) {
            (Some(url), _) => Some(TargetPoolConfig::new("sandbox", url.as_str())),
            (None, Some(url)) => Some(TargetPoolConfig::new("sandbox", url.as_str())),
            (None, None) => None,
        }
    }
}

fn parse<T: FromStr>(key: &str, raw: Option<String>, default: T) -> Result<T, AppError> {
    Ok(parse_value(key, raw.as_deref(), default)?)
}
