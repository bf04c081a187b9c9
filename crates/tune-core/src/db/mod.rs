//! Abstracción de sesiones SQL contra las bases destino (primario, réplica,
//! sandbox).
//!
//! Los managers nunca ven un driver concreto: `tune-persistence` implementa
//! estos traits sobre `sqlx` y `memory::MemoryDatabase` los simula para tests
//! (feature `testing`).
//! Toda operación es un punto de `await`: cancelar el future que la contiene
//! descarta la sesión y devuelve la conexión al pool.
use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tune_domain::IoMetrics;

use crate::errors::DbError;

#[cfg(any(test, feature = "testing"))]
pub mod memory;

#[cfg(any(test, feature = "testing"))]
pub use memory::MemoryDatabase;

/// Parámetro posicional (`$1`, `$2`, ...).
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelationKind {
    Table,
    View,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    /// Tipo tal como lo imprime el catálogo (`format_type`).
    pub data_type: String,
    pub nullable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationInfo {
    pub schema: String,
    pub name: String,
    pub kind: RelationKind,
    pub columns: Vec<ColumnInfo>,
}

/// Una conexión tomada del pool.
#[async_trait]
pub trait SqlSession: Send {
    /// Ejecuta una sentencia y devuelve las filas afectadas.
    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64, DbError>;

    async fn begin(&mut self) -> Result<(), DbError> {
        self.execute("BEGIN", &[]).await.map(|_| ())
    }

    async fn commit(&mut self) -> Result<(), DbError> {
        self.execute("COMMIT", &[]).await.map(|_| ())
    }

    async fn rollback(&mut self) -> Result<(), DbError> {
        self.execute("ROLLBACK", &[]).await.map(|_| ())
    }

    async fn ping(&mut self) -> Result<(), DbError> {
        self.execute("SELECT 1", &[]).await.map(|_| ())
    }

    /// Columnas y tipo de una tabla o vista; `None` si no existe.
    async fn relation(&mut self, schema: &str, name: &str) -> Result<Option<RelationInfo>, DbError>;

    async fn row_count(&mut self, schema: &str, name: &str) -> Result<u64, DbError>;

    /// Contadores acumulados de la base actual.
    async fn io_counters(&mut self) -> Result<IoMetrics, DbError>;

    async fn schemas_with_prefix(&mut self, prefix: &str) -> Result<Vec<String>, DbError>;
}

#[async_trait]
pub trait SqlPool: Send + Sync {
    async fn acquire(&self) -> Result<Box<dyn SqlSession>, DbError>;

    /// Etiqueta para logs (nunca incluye credenciales).
    fn label(&self) -> String;
}

/// Crea (o recrea) el pool de la réplica tras un chequeo fallido.
#[async_trait]
pub trait PoolConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn SqlPool>, DbError>;
}

/// Estado de sesión que sobrevive a la sentencia que lo fijó.
///
/// Las implementaciones lo alimentan con cada sentencia ejecutada con éxito
/// y, al soltar la sesión, descartan la conexión física si `is_dirty()`:
/// una transacción abierta o un `SET` de sesión no revertido no debe volver
/// al pool.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SessionState {
    in_transaction: bool,
    session_params: BTreeSet<String>,
}

impl SessionState {
    pub fn observe(&mut self, sql: &str) {
        let body = sql.trim().trim_end_matches(';');
        let words: Vec<String> = body.split_whitespace().take(3).map(str::to_ascii_lowercase).collect();
        let w: Vec<&str> = words.iter().map(String::as_str).collect();
        match w.as_slice() {
            ["begin", ..] | ["start", "transaction", ..] => self.in_transaction = true,
            ["commit", ..] | ["rollback", ..] | ["end", ..] | ["abort", ..] => self.in_transaction = false,
            ["set", "local", ..] => {}
            ["set", "session", param, ..] | ["set", param, ..] => {
                self.session_params.insert(param_name(param));
            }
            ["reset", "all", ..] => self.session_params.clear(),
            ["reset", param, ..] => {
                self.session_params.remove(&param_name(param));
            }
            _ => {}
        }
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    pub fn is_dirty(&self) -> bool {
        self.in_transaction || !self.session_params.is_empty()
    }
}

fn param_name(token: &str) -> String {
    token.split('=').next().unwrap_or(token).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_state_tracks_transactions_and_params() {
        let mut s = SessionState::default();
        s.observe("SET search_path TO \"tune_job_x\"");
        assert!(s.is_dirty());
        s.observe("RESET search_path");
        assert!(!s.is_dirty());
        s.observe("BEGIN");
        s.observe("SET LOCAL search_path TO \"a\", public");
        assert!(s.in_transaction());
        s.observe("COMMIT;");
        assert!(!s.is_dirty());
        s.observe("set work_mem='8MB'");
        s.observe("RESET ALL");
        assert!(!s.is_dirty());
    }
}
