//! Esquemas temporales de benchmark y métricas medidas dentro de ellos.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Tabla copiada al sandbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampledTable {
    pub name: String,
    pub row_count: u64,
    /// Porcentaje (0, 100] de filas muestreadas; 100 = copia completa.
    pub sample_fraction: f64,
}

/// Namespace aislado perteneciente a un único job.
///
/// Invariante: se crea al inicio del job y se destruye en cualquier salida
/// (éxito, error o cancelación). Nunca se reutiliza entre jobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TempSchema {
    pub job_id: Uuid,
    pub schema_name: String,
    pub sampled_tables: Vec<SampledTable>,
    pub created_at: DateTime<Utc>,
}

impl TempSchema {
    pub fn new(job_id: Uuid, schema_name: impl Into<String>) -> Self {
        Self { job_id, schema_name: schema_name.into(), sampled_tables: Vec::new(), created_at: Utc::now() }
    }
}

/// Contadores de I/O a nivel de base de datos (`pg_stat_database`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct IoMetrics {
    pub blks_hit: i64,
    pub blks_read: i64,
    pub temp_files: i64,
    pub temp_bytes: i64,
    pub blk_read_time_ms: f64,
    pub blk_write_time_ms: f64,
}

impl IoMetrics {
    /// Diferencia `self - before`, saturando en cero.
    ///
    /// Los contadores son globales a la base: bajo concurrencia el delta
    /// incluye I/O de otras sesiones. Es una aproximación, no una atribución
    /// exacta por sentencia.
    pub fn delta_since(&self, before: &IoMetrics) -> IoMetrics {
        IoMetrics { blks_hit: (self.blks_hit - before.blks_hit).max(0),
                    blks_read: (self.blks_read - before.blks_read).max(0),
                    temp_files: (self.temp_files - before.temp_files).max(0),
                    temp_bytes: (self.temp_bytes - before.temp_bytes).max(0),
                    blk_read_time_ms: (self.blk_read_time_ms - before.blk_read_time_ms).max(0.0),
                    blk_write_time_ms: (self.blk_write_time_ms - before.blk_write_time_ms).max(0.0) }
    }

    /// Bloques tocados (cache + disco).
    pub fn total_blocks(&self) -> i64 {
        self.blks_hit + self.blks_read
    }
}

/// Resultado de ejecutar una sentencia dentro del sandbox.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub elapsed_ms: f64,
    pub io: IoMetrics,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Improvement {
    pub time_improvement_percent: f64,
    pub time_saved_ms: f64,
    pub io_improvement_percent: f64,
}

impl Improvement {
    /// Compara baseline contra la medición optimizada. Sin medición optimizada
    /// (candidato no aplicado) la mejora es cero. Siempre devuelve valores
    /// finitos.
    pub fn between(baseline: &Measurement, optimized: Option<&Measurement>) -> Self {
        let Some(optimized) = optimized else {
            return Self::default();
        };
        let time_saved_ms = baseline.elapsed_ms - optimized.elapsed_ms;
        let time_improvement_percent = percent(time_saved_ms, baseline.elapsed_ms);
        let base_blocks = baseline.io.total_blocks() as f64;
        let io_improvement_percent = percent(base_blocks - optimized.io.total_blocks() as f64, base_blocks);
        Self { time_improvement_percent, time_saved_ms, io_improvement_percent }
    }
}

fn percent(saved: f64, base: f64) -> f64 {
    if base > 0.0 && saved.is_finite() {
        saved / base * 100.0
    } else {
        0.0
    }
}

/// Payload de resultado de un job `benchmark`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkReport {
    pub schema_name: String,
    pub tables_sampled: Vec<SampledTable>,
    pub baseline_metrics: Measurement,
    pub optimized_metrics: Option<Measurement>,
    pub candidate_applied: bool,
    pub improvement: Improvement,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn m(elapsed_ms: f64, hit: i64, read: i64) -> Measurement {
        Measurement { elapsed_ms, io: IoMetrics { blks_hit: hit, blks_read: read, ..Default::default() } }
    }

    #[test]
    fn improvement_is_relative_to_baseline() {
        let imp = Improvement::between(&m(200.0, 50, 50), Some(&m(50.0, 5, 5)));
        assert!((imp.time_improvement_percent - 75.0).abs() < 1e-9);
        assert!((imp.time_saved_ms - 150.0).abs() < 1e-9);
        assert!((imp.io_improvement_percent - 90.0).abs() < 1e-9);
    }

    #[test]
    fn improvement_without_candidate_is_zero() {
        let imp = Improvement::between(&m(10.0, 1, 1), None);
        assert_eq!(imp, Improvement::default());
    }

    #[test]
    fn zero_baseline_does_not_produce_nan() {
        let imp = Improvement::between(&m(0.0, 0, 0), Some(&m(0.0, 0, 0)));
        assert!(imp.time_improvement_percent.is_finite());
        assert!(imp.io_improvement_percent.is_finite());
    }

    #[test]
    fn delta_saturates_on_counter_reset() {
        let before = IoMetrics { blks_hit: 100, blks_read: 10, ..Default::default() };
        let after = IoMetrics { blks_hit: 40, blks_read: 15, ..Default::default() };
        let d = after.delta_since(&before);
        assert_eq!(d.blks_hit, 0);
        assert_eq!(d.blks_read, 5);
    }
}
