//! Job Manager: pipeline asíncrono y durable de benchmark / apply / rollback.
//!
//! - `submit` persiste el job `pending` y lo encola.
//! - Un único dispatcher consume la cola (FIFO) y lanza ejecuciones
//!   concurrentes acotadas por un semáforo.
//! - Cada ejecución corre en su propia task: cancelarla descarta el future en
//!   curso mientras el wrapper garantiza la limpieza del sandbox y el estado
//!   terminal.
use std::time::Duration;

use serde::Serialize;

mod manager;
pub mod registry;
pub mod runner;

pub use manager::JobManager;
pub use registry::{ActiveEntry, ActiveGuard, ActiveJobs, Phase};
pub use runner::JobRunner;

#[derive(Debug, Clone)]
pub struct JobManagerConfig {
    pub max_concurrency: usize,
    pub queue_capacity: usize,
    /// Timeout de cada sondeo de la cola; acota cuánto tarda `stop` en ser
    /// observado por el dispatcher.
    pub poll_interval: Duration,
    /// Pausa del dispatcher tras un fallo propio.
    pub error_backoff: Duration,
    /// Porcentaje de muestreo para los jobs de benchmark.
    pub sample_percent: f64,
}

impl Default for JobManagerConfig {
    fn default() -> Self {
        Self { max_concurrency: 4,
               queue_capacity: 256,
               poll_interval: Duration::from_millis(250),
               error_backoff: Duration::from_secs(1),
               sample_percent: 10.0 }
    }
}

/// Resultado de `JobManager::recover`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// Jobs `running` de un proceso anterior marcados como `error`.
    pub interrupted: usize,
    /// Jobs `pending` reencolados.
    pub requeued: usize,
}
