//! Base de datos simulada en memoria.
//!
//! Interpreta el subconjunto de SQL que emiten los managers (namespaces,
//! copias muestreadas, índices, `search_path`, transacciones, `ALTER
//! SYSTEM`) con las mismas reglas que Postgres en los puntos que importan:
//!
//! - `CONCURRENTLY` y `ALTER SYSTEM` fallan dentro de un bloque de
//!   transacción.
//! - `ROLLBACK` (o soltar la sesión con la transacción abierta) restaura el
//!   catálogo.
//! - Los nombres sin calificar se resuelven por el `search_path` de la sesión.
//!
//! El costo de una consulta es proporcional a las filas de las tablas que
//! menciona y se divide por 10 si la tabla tiene un índice, lo que basta para
//! que un índice candidato produzca una mejora medible. Incluye ganchos de
//! inyección de fallas y demoras para tests.
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tune_domain::naming::split_table_name;
use tune_domain::IoMetrics;

use super::{ColumnInfo, RelationInfo, RelationKind, SqlPool, SqlSession, SqlValue};
use crate::errors::DbError;

type RelKey = (String, String);

#[derive(Debug, Clone)]
struct MemRelation {
    kind: RelationKind,
    columns: Vec<ColumnInfo>,
    rows: u64,
}

#[derive(Debug, Clone, Default)]
struct Catalog {
    schemas: BTreeSet<String>,
    relations: BTreeMap<RelKey, MemRelation>,
    /// (schema, índice) -> tabla indexada.
    indexes: BTreeMap<RelKey, RelKey>,
}

#[derive(Default)]
struct DbState {
    catalog: Catalog,
    io: IoMetrics,
    system_settings: BTreeMap<String, String>,
    failures: Vec<String>,
    delays: Vec<(String, Duration)>,
    unavailable: bool,
    statements: Vec<String>,
}

/// Pool simulado. Clonar comparte el mismo estado.
#[derive(Clone)]
pub struct MemoryDatabase {
    label: String,
    state: Arc<Mutex<DbState>>,
    open_sessions: Arc<AtomicUsize>,
}

impl MemoryDatabase {
    pub fn new(label: impl Into<String>) -> Self {
        let mut state = DbState::default();
        state.catalog.schemas.insert("public".to_string());
        Self { label: label.into(), state: Arc::new(Mutex::new(state)), open_sessions: Arc::new(AtomicUsize::new(0)) }
    }

    fn lock(&self) -> MutexGuard<'_, DbState> {
        lock_state(&self.state)
    }

    /// Registra una tabla. `columns` son pares (nombre, tipo); todas nullable.
    pub fn add_table(&self, schema: &str, name: &str, columns: &[(&str, &str)], rows: u64) {
        self.add_relation(schema, name, RelationKind::Table, columns, rows);
    }

    pub fn add_view(&self, schema: &str, name: &str, columns: &[(&str, &str)], rows: u64) {
        self.add_relation(schema, name, RelationKind::View, columns, rows);
    }

    fn add_relation(&self, schema: &str, name: &str, kind: RelationKind, columns: &[(&str, &str)], rows: u64) {
        let columns = columns.iter()
                             .map(|(n, t)| ColumnInfo { name: n.to_string(), data_type: t.to_string(), nullable: true })
                             .collect();
        let mut st = self.lock();
        st.catalog.schemas.insert(schema.to_string());
        st.catalog.relations.insert((schema.to_string(), name.to_string()), MemRelation { kind, columns, rows });
    }

    pub fn has_schema(&self, schema: &str) -> bool {
        self.lock().catalog.schemas.contains(schema)
    }

    pub fn schema_names(&self) -> Vec<String> {
        self.lock().catalog.schemas.iter().cloned().collect()
    }

    pub fn relation_rows(&self, schema: &str, name: &str) -> Option<u64> {
        self.lock().catalog.relations.get(&(schema.to_string(), name.to_string())).map(|r| r.rows)
    }

    pub fn has_index(&self, schema: &str, name: &str) -> bool {
        self.lock().catalog.indexes.contains_key(&(schema.to_string(), name.to_string()))
    }

    pub fn system_setting(&self, param: &str) -> Option<String> {
        self.lock().system_settings.get(param).cloned()
    }

    /// Toda sentencia que contenga `pattern` (sin distinguir mayúsculas)
    /// falla.
    pub fn fail_on(&self, pattern: &str) {
        self.lock().failures.push(pattern.to_ascii_lowercase());
    }

    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    /// Toda sentencia que contenga `pattern` tarda al menos `delay`.
    pub fn delay_on(&self, pattern: &str, delay: Duration) {
        self.lock().delays.push((pattern.to_ascii_lowercase(), delay));
    }

    pub fn clear_delays(&self) {
        self.lock().delays.clear();
    }

    /// Simula una base caída: `acquire` y cualquier sentencia fallan.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    /// Sentencias recibidas, en orden (incluye las que fallaron).
    pub fn statements(&self) -> Vec<String> {
        self.lock().statements.clone()
    }

    pub fn open_sessions(&self) -> usize {
        self.open_sessions.load(Ordering::SeqCst)
    }
}

fn lock_state(state: &Mutex<DbState>) -> MutexGuard<'_, DbState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl SqlPool for MemoryDatabase {
    async fn acquire(&self) -> Result<Box<dyn SqlSession>, DbError> {
        if self.lock().unavailable {
            return Err(DbError::Connection(format!("{} unavailable", self.label)));
        }
        self.open_sessions.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemorySession { state: Arc::clone(&self.state),
                                    open_sessions: Arc::clone(&self.open_sessions),
                                    search_path: default_search_path(),
                                    local_search_path: None,
                                    snapshot: None }))
    }

    fn label(&self) -> String {
        self.label.clone()
    }
}

fn default_search_path() -> Vec<String> {
    vec!["public".to_string()]
}

struct MemorySession {
    state: Arc<Mutex<DbState>>,
    open_sessions: Arc<AtomicUsize>,
    search_path: Vec<String>,
    local_search_path: Option<Vec<String>>,
    snapshot: Option<Catalog>,
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        if let Some(snapshot) = self.snapshot.take() {
            lock_state(&self.state).catalog = snapshot;
        }
        self.open_sessions.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Resultado de interpretar una sentencia: filas afectadas y costo simulado
/// en bloques.
struct Outcome {
    rows: u64,
    blocks: u64,
}

impl Outcome {
    fn rows(rows: u64) -> Self {
        Self { rows, blocks: 0 }
    }
}

fn upper_words(body: &str) -> Vec<String> {
    body.split_whitespace().map(str::to_ascii_uppercase).collect()
}

fn unquote(raw: &str) -> String {
    let raw = raw.trim();
    if raw.len() >= 2 && raw.starts_with('"') && raw.ends_with('"') {
        raw[1..raw.len() - 1].replace("\"\"", "\"")
    } else {
        raw.to_ascii_lowercase()
    }
}

/// Divide por comas de primer nivel (ignora las que están entre paréntesis o
/// comillas).
fn split_top_level(s: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut quoted = false;
    let mut current = String::new();
    for c in s.chars() {
        match c {
            '"' => {
                quoted = !quoted;
                current.push(c);
            }
            '(' if !quoted => {
                depth += 1;
                current.push(c);
            }
            ')' if !quoted => {
                depth -= 1;
                current.push(c);
            }
            ',' if !quoted && depth == 0 => parts.push(std::mem::take(&mut current)),
            c => current.push(c),
        }
    }
    if !current.trim().is_empty() {
        parts.push(current);
    }
    parts.into_iter().map(|p| p.trim().to_string()).collect()
}

fn parse_search_path(value: &str) -> Vec<String> {
    split_top_level(value).iter().map(|p| unquote(p.trim_matches('\''))).filter(|p| !p.is_empty()).collect()
}

fn parse_columns(defs: &str) -> Vec<ColumnInfo> {
    split_top_level(defs).into_iter()
                         .filter_map(|def| {
                             let (name, rest) = split_ident(&def)?;
                             let rest = rest.trim();
                             let upper = rest.to_ascii_uppercase();
                             let (data_type, nullable) = match upper.strip_suffix("NOT NULL") {
                                 Some(_) => (rest[..rest.len() - "NOT NULL".len()].trim().to_string(), false),
                                 None => (rest.to_string(), true),
                             };
                             Some(ColumnInfo { name, data_type, nullable })
                         })
                         .collect()
}

/// Separa el primer identificador (posiblemente citado) del resto.
fn split_ident(s: &str) -> Option<(String, &str)> {
    let s = s.trim_start();
    if let Some(rest) = s.strip_prefix('"') {
        let mut end = None;
        let bytes = rest.as_bytes();
        let mut i = 0;
        while i < bytes.len() {
            if bytes[i] == b'"' {
                if bytes.get(i + 1) == Some(&b'"') {
                    i += 2;
                    continue;
                }
                end = Some(i);
                break;
            }
            i += 1;
        }
        let end = end?;
        Some((rest[..end].replace("\"\"", "\""), &rest[end + 1..]))
    } else {
        let end = s.find(char::is_whitespace).unwrap_or(s.len());
        if end == 0 {
            return None;
        }
        Some((s[..end].to_ascii_lowercase(), &s[end..]))
    }
}

impl MemorySession {
    fn effective_search_path(&self) -> &[String] {
        self.local_search_path.as_deref().unwrap_or(&self.search_path)
    }

    fn resolve_relation(&self, catalog: &Catalog, raw: &str) -> Option<RelKey> {
        let raw = raw.trim().trim_end_matches([',', ';', ')']);
        if raw.is_empty() || raw.starts_with('(') {
            return None;
        }
        if raw.contains('.') {
            let key = split_table_name(raw)?;
            return catalog.relations.contains_key(&key).then_some(key);
        }
        let name = unquote(raw);
        self.effective_search_path()
            .iter()
            .map(|schema| (schema.clone(), name.clone()))
            .find(|key| catalog.relations.contains_key(key))
    }

    fn resolve_index(&self, catalog: &Catalog, raw: &str) -> Option<RelKey> {
        if raw.contains('.') {
            let key = split_table_name(raw)?;
            return catalog.indexes.contains_key(&key).then_some(key);
        }
        let name = unquote(raw);
        self.effective_search_path()
            .iter()
            .map(|schema| (schema.clone(), name.clone()))
            .find(|key| catalog.indexes.contains_key(key))
    }

    fn creation_schema(&self) -> Option<String> {
        self.effective_search_path().first().cloned()
    }

    fn run(&mut self, st: &mut DbState, sql: &str) -> Result<Outcome, DbError> {
        let body = sql.trim().trim_end_matches(';').trim();
        let words = upper_words(body);
        let w: Vec<&str> = words.iter().map(String::as_str).collect();
        let in_tx = self.snapshot.is_some();
        let fail = |msg: &str| Err(DbError::statement(sql, msg));

        match w.as_slice() {
            ["BEGIN", ..] | ["START", "TRANSACTION", ..] => {
                if !in_tx {
                    self.snapshot = Some(st.catalog.clone());
                }
                Ok(Outcome::rows(0))
            }
            ["COMMIT", ..] | ["END", ..] => {
                self.snapshot = None;
                self.local_search_path = None;
                Ok(Outcome::rows(0))
            }
            ["ROLLBACK", ..] | ["ABORT", ..] => {
                if let Some(snapshot) = self.snapshot.take() {
                    st.catalog = snapshot;
                }
                self.local_search_path = None;
                Ok(Outcome::rows(0))
            }
            ["SET", "LOCAL", param, ..] => {
                if param.starts_with("SEARCH_PATH") && in_tx {
                    self.local_search_path = Some(parse_search_path(set_value(body)));
                }
                Ok(Outcome::rows(0))
            }
            ["SET", "SESSION", param, ..] | ["SET", param, ..] => {
                if param.starts_with("SEARCH_PATH") {
                    self.search_path = parse_search_path(set_value(body));
                }
                Ok(Outcome::rows(0))
            }
            ["RESET", "ALL"] | ["RESET", "SEARCH_PATH"] => {
                self.search_path = default_search_path();
                Ok(Outcome::rows(0))
            }
            ["RESET", ..] => Ok(Outcome::rows(0)),
            ["ALTER", "SYSTEM", ..] => {
                if in_tx {
                    return fail("ALTER SYSTEM cannot run inside a transaction block");
                }
                self.alter_system(st, body, sql)
            }
            ["CREATE", "SCHEMA", rest @ ..] => {
                let if_not_exists = rest.starts_with(&["IF", "NOT", "EXISTS"]);
                let raw = body.split_whitespace().nth(if if_not_exists { 5 } else { 2 }).unwrap_or("");
                let name = unquote(raw);
                if name.is_empty() {
                    return fail("syntax error at end of input");
                }
                if !st.catalog.schemas.insert(name.clone()) && !if_not_exists {
                    return fail(&format!("schema \"{name}\" already exists"));
                }
                Ok(Outcome::rows(0))
            }
            ["DROP", "SCHEMA", rest @ ..] => {
                let if_exists = rest.starts_with(&["IF", "EXISTS"]);
                let raw = body.split_whitespace().nth(if if_exists { 4 } else { 2 }).unwrap_or("");
                let name = unquote(raw);
                if !st.catalog.schemas.remove(&name) {
                    return if if_exists { Ok(Outcome::rows(0)) } else { fail(&format!("schema \"{name}\" does not exist")) };
                }
                st.catalog.relations.retain(|(s, _), _| s != &name);
                st.catalog.indexes.retain(|(s, _), _| s != &name);
                Ok(Outcome::rows(0))
            }
            ["CREATE", "TABLE", ..] => self.create_table(st, body, sql),
            ["INSERT", "INTO", ..] => self.insert_select(st, body, sql),
            ["ANALYZE", ..] => Ok(Outcome::rows(0)),
            ["CREATE", "INDEX", "CONCURRENTLY", ..] | ["DROP", "INDEX", "CONCURRENTLY", ..] if in_tx => {
                fail(&format!("{} INDEX CONCURRENTLY cannot run inside a transaction block", w[0]))
            }
            ["CREATE", "INDEX", ..] => self.create_index(st, body, sql),
            ["DROP", "INDEX", ..] => self.drop_index(st, body, sql),
            ["SELECT", "1"] => Ok(Outcome::rows(1)),
            ["SELECT", ..] | ["WITH", ..] | ["EXPLAIN", ..] => self.query(st, body, sql),
            _ => Ok(Outcome::rows(0)),
        }
    }

    fn alter_system(&mut self, st: &mut DbState, body: &str, sql: &str) -> Result<Outcome, DbError> {
        let words: Vec<&str> = body.split_whitespace().collect();
        match words.get(2).map(|w| w.to_ascii_uppercase()).as_deref() {
            Some("SET") => {
                let param = words.get(3).and_then(|p| p.split('=').next()).unwrap_or("").to_ascii_lowercase();
                if param.is_empty() {
                    return Err(DbError::statement(sql, "syntax error"));
                }
                st.system_settings.insert(param, set_value(body).trim().to_string());
                Ok(Outcome::rows(0))
            }
            Some("RESET") => {
                let param = words.get(3).unwrap_or(&"").to_ascii_lowercase();
                if param == "all" {
                    st.system_settings.clear();
                } else {
                    st.system_settings.remove(&param);
                }
                Ok(Outcome::rows(0))
            }
            _ => Err(DbError::statement(sql, "unsupported ALTER SYSTEM form")),
        }
    }

    fn create_table(&mut self, st: &mut DbState, body: &str, sql: &str) -> Result<Outcome, DbError> {
        let after = body.split_at(body.to_ascii_uppercase().find("TABLE").unwrap_or(0) + "TABLE".len()).1;
        let (name_part, defs) = match (after.find('('), after.rfind(')')) {
            (Some(open), Some(close)) if close > open => (&after[..open], &after[open + 1..close]),
            _ => return Err(DbError::statement(sql, "syntax error in column list")),
        };
        let key = self.target_key(name_part).ok_or_else(|| DbError::statement(sql, "invalid table name"))?;
        if !st.catalog.schemas.contains(&key.0) {
            return Err(DbError::statement(sql, format!("schema \"{}\" does not exist", key.0)));
        }
        if st.catalog.relations.contains_key(&key) {
            return Err(DbError::statement(sql, format!("relation \"{}\" already exists", key.1)));
        }
        let columns = parse_columns(defs);
        st.catalog.relations.insert(key, MemRelation { kind: RelationKind::Table, columns, rows: 0 });
        Ok(Outcome::rows(0))
    }

    fn target_key(&self, raw: &str) -> Option<RelKey> {
        let raw = raw.trim();
        if raw.contains('.') {
            split_table_name(raw)
        } else {
            Some((self.creation_schema()?, unquote(raw)))
        }
    }

    /// `INSERT INTO t SELECT * FROM src [TABLESAMPLE BERNOULLI (p)] [LIMIT n]`.
    fn insert_select(&mut self, st: &mut DbState, body: &str, sql: &str) -> Result<Outcome, DbError> {
        let words: Vec<&str> = body.split_whitespace().collect();
        let upper = upper_words(body);
        let target = words.get(2).and_then(|t| self.target_key(t)).ok_or_else(|| DbError::statement(sql, "invalid target"))?;
        if !st.catalog.relations.contains_key(&target) {
            return Err(DbError::statement(sql, format!("relation \"{}\" does not exist", target.1)));
        }
        let Some(from) = upper.iter().position(|w| w == "FROM") else {
            return Ok(Outcome::rows(1));
        };
        let source_raw = words.get(from + 1).copied().unwrap_or("");
        let source = self.resolve_relation(&st.catalog, source_raw)
                         .ok_or_else(|| DbError::statement(sql, format!("relation \"{source_raw}\" does not exist")))?;
        let source_rows = st.catalog.relations.get(&source).map(|r| r.rows).unwrap_or(0);

        let mut rows = source_rows;
        if let Some(pos) = upper.iter().position(|w| w.starts_with("BERNOULLI")) {
            let tail = upper[pos..].join(" ");
            let pct = tail.split(['(', ')']).nth(1).and_then(|p| p.trim().parse::<f64>().ok()).unwrap_or(100.0);
            rows = ((source_rows as f64) * pct.clamp(0.0, 100.0) / 100.0).round() as u64;
        }
        if let Some(pos) = upper.iter().position(|w| w == "LIMIT") {
            if let Some(limit) = words.get(pos + 1).and_then(|l| l.parse::<u64>().ok()) {
                rows = rows.min(limit);
            }
        }
        if let Some(rel) = st.catalog.relations.get_mut(&target) {
            rel.rows += rows;
        }
        Ok(Outcome { rows, blocks: source_rows.div_ceil(100).max(1) })
    }

    /// `CREATE INDEX [CONCURRENTLY] [IF NOT EXISTS] name ON table (...)`.
    fn create_index(&mut self, st: &mut DbState, body: &str, sql: &str) -> Result<Outcome, DbError> {
        let words: Vec<&str> = body.split_whitespace().collect();
        let upper = upper_words(body);
        let mut i = 2;
        if upper.get(i).map(String::as_str) == Some("CONCURRENTLY") {
            i += 1;
        }
        let if_not_exists = upper.get(i..i + 3).is_some_and(|s| s == ["IF", "NOT", "EXISTS"]);
        if if_not_exists {
            i += 3;
        }
        let Some(on) = upper.iter().position(|w| w == "ON") else {
            return Err(DbError::statement(sql, "syntax error: missing ON"));
        };
        let table_raw = words.get(on + 1).map(|t| t.split('(').next().unwrap_or(t)).unwrap_or("");
        let table = self.resolve_relation(&st.catalog, table_raw)
                        .ok_or_else(|| DbError::statement(sql, format!("relation \"{table_raw}\" does not exist")))?;
        let index_name = if i < on { unquote(words[i]) } else { format!("{}_idx", table.1) };
        let key = (table.0.clone(), index_name);
        if st.catalog.indexes.contains_key(&key) {
            return if if_not_exists {
                Ok(Outcome::rows(0))
            } else {
                Err(DbError::statement(sql, format!("relation \"{}\" already exists", key.1)))
            };
        }
        let rows = st.catalog.relations.get(&table).map(|r| r.rows).unwrap_or(0);
        st.catalog.indexes.insert(key, table);
        Ok(Outcome { rows: 0, blocks: rows.div_ceil(100).max(1) })
    }

    fn drop_index(&mut self, st: &mut DbState, body: &str, sql: &str) -> Result<Outcome, DbError> {
        let words: Vec<&str> = body.split_whitespace().collect();
        let upper = upper_words(body);
        let mut i = 2;
        if upper.get(i).map(String::as_str) == Some("CONCURRENTLY") {
            i += 1;
        }
        let if_exists = upper.get(i..i + 2).is_some_and(|s| s == ["IF", "EXISTS"]);
        if if_exists {
            i += 2;
        }
        let raw = words.get(i).copied().unwrap_or("");
        match self.resolve_index(&st.catalog, raw) {
            Some(key) => {
                st.catalog.indexes.remove(&key);
                Ok(Outcome::rows(0))
            }
            None if if_exists => Ok(Outcome::rows(0)),
            None => Err(DbError::statement(sql, format!("index \"{raw}\" does not exist"))),
        }
    }

    /// Consulta de lectura: resuelve cada relación tras `FROM` / `JOIN` y
    /// calcula su costo.
    fn query(&mut self, st: &mut DbState, body: &str, sql: &str) -> Result<Outcome, DbError> {
        let words: Vec<&str> = body.split_whitespace().collect();
        let mut blocks = 0u64;
        let mut rows = 0u64;
        let mut i = 0;
        while i < words.len() {
            let upper = words[i].to_ascii_uppercase();
            if upper == "FROM" || upper == "JOIN" {
                let mut j = i + 1;
                while let Some(raw) = words.get(j) {
                    if raw.starts_with('(') {
                        break;
                    }
                    let key = self.resolve_relation(&st.catalog, raw)
                                  .ok_or_else(|| DbError::statement(sql, format!("relation \"{}\" does not exist", raw.trim_end_matches(','))))?;
                    let table_rows = st.catalog.relations.get(&key).map(|r| r.rows).unwrap_or(0);
                    let indexed = st.catalog.indexes.values().any(|t| t == &key);
                    blocks += if indexed { table_rows / 10 } else { table_rows };
                    rows += table_rows;
                    if raw.ends_with(',') {
                        j += 1;
                    } else {
                        break;
                    }
                }
                i = j;
            }
            i += 1;
        }
        Ok(Outcome { rows, blocks: blocks.max(1) })
    }
}

/// Valor a la derecha de `TO` o `=` en un `SET`.
fn set_value(body: &str) -> &str {
    let upper = body.to_ascii_uppercase();
    if let Some(pos) = upper.find(" TO ") {
        return &body[pos + 4..];
    }
    match body.find('=') {
        Some(pos) => &body[pos + 1..],
        None => "",
    }
}

#[async_trait]
impl SqlSession for MemorySession {
    async fn execute(&mut self, sql: &str, _params: &[SqlValue]) -> Result<u64, DbError> {
        let lowered = sql.to_ascii_lowercase();
        let delay = {
            let mut st = lock_state(&self.state);
            st.statements.push(sql.trim().to_string());
            if st.unavailable {
                return Err(DbError::Connection("connection reset by peer".into()));
            }
            if st.failures.iter().any(|p| lowered.contains(p.as_str())) {
                return Err(DbError::statement(sql, "injected failure"));
            }
            st.delays.iter().filter(|(p, _)| lowered.contains(p.as_str())).map(|(_, d)| *d).max()
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let state = Arc::clone(&self.state);
        let outcome = {
            let mut st = lock_state(&state);
            let outcome = self.run(&mut st, sql)?;
            if outcome.blocks > 0 {
                let read = outcome.blocks / 4;
                st.io.blks_read += read as i64;
                st.io.blks_hit += (outcome.blocks - read) as i64;
                st.io.blk_read_time_ms += read as f64 * 0.01;
            }
            outcome
        };
        if outcome.blocks > 1 {
            // Latencia proporcional al trabajo simulado.
            tokio::time::sleep(Duration::from_micros(outcome.blocks.min(50_000))).await;
        }
        Ok(outcome.rows)
    }

    async fn relation(&mut self, schema: &str, name: &str) -> Result<Option<RelationInfo>, DbError> {
        let st = lock_state(&self.state);
        Ok(st.catalog.relations.get(&(schema.to_string(), name.to_string())).map(|r| RelationInfo {
            schema: schema.to_string(),
            name: name.to_string(),
            kind: r.kind,
            columns: r.columns.clone(),
        }))
    }

    async fn row_count(&mut self, schema: &str, name: &str) -> Result<u64, DbError> {
        let st = lock_state(&self.state);
        st.catalog
          .relations
          .get(&(schema.to_string(), name.to_string()))
          .map(|r| r.rows)
          .ok_or_else(|| DbError::statement(&format!("SELECT count(*) FROM {schema}.{name}"), "relation does not exist"))
    }

    async fn io_counters(&mut self) -> Result<IoMetrics, DbError> {
        let st = lock_state(&self.state);
        if st.unavailable {
            return Err(DbError::Connection("connection reset by peer".into()));
        }
        Ok(st.io)
    }

    async fn schemas_with_prefix(&mut self, prefix: &str) -> Result<Vec<String>, DbError> {
        let st = lock_state(&self.state);
        Ok(st.catalog.schemas.iter().filter(|s| s.starts_with(prefix)).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn exec(s: &mut Box<dyn SqlSession>, sql: &str) -> Result<u64, DbError> {
        s.execute(sql, &[]).await
    }

    #[tokio::test]
    async fn concurrently_is_rejected_inside_transactions() {
        let db = MemoryDatabase::new("test");
        db.add_table("public", "bar", &[("baz", "integer")], 1000);
        let mut s = db.acquire().await.unwrap();
        s.begin().await.unwrap();
        let err = exec(&mut s, "CREATE INDEX CONCURRENTLY idx_foo ON bar(baz)").await.unwrap_err();
        assert!(err.to_string().contains("transaction block"));
        s.rollback().await.unwrap();
        exec(&mut s, "CREATE INDEX CONCURRENTLY idx_foo ON bar(baz)").await.unwrap();
        assert!(db.has_index("public", "idx_foo"));
    }

    #[tokio::test]
    async fn rollback_and_dropped_sessions_restore_catalog() {
        let db = MemoryDatabase::new("test");
        {
            let mut s = db.acquire().await.unwrap();
            s.begin().await.unwrap();
            exec(&mut s, "CREATE SCHEMA tmp").await.unwrap();
            assert!(db.has_schema("tmp"));
        }
        assert!(!db.has_schema("tmp"));
        assert_eq!(db.open_sessions(), 0);
    }

    #[tokio::test]
    async fn sampling_respects_fraction_and_cap() {
        let db = MemoryDatabase::new("test");
        db.add_table("public", "orders", &[("id", "bigint"), ("total", "numeric(10,2)")], 10_000);
        let mut s = db.acquire().await.unwrap();
        exec(&mut s, "CREATE SCHEMA \"sb\"").await.unwrap();
        exec(&mut s, "CREATE TABLE \"sb\".\"orders\" (\"id\" bigint NOT NULL, \"total\" numeric(10,2))").await.unwrap();
        let n = exec(&mut s, "INSERT INTO \"sb\".\"orders\" SELECT * FROM \"public\".\"orders\" TABLESAMPLE BERNOULLI (10) LIMIT 500")
            .await
            .unwrap();
        assert_eq!(n, 500);
        let info = s.relation("sb", "orders").await.unwrap().unwrap();
        assert_eq!(info.columns.len(), 2);
        assert!(!info.columns[0].nullable);
        assert_eq!(info.columns[1].data_type, "numeric(10,2)");
    }

    #[tokio::test]
    async fn search_path_controls_resolution() {
        let db = MemoryDatabase::new("test");
        db.add_table("public", "t", &[("a", "int")], 10);
        let mut s = db.acquire().await.unwrap();
        exec(&mut s, "CREATE SCHEMA sb").await.unwrap();
        exec(&mut s, "SET search_path TO \"sb\"").await.unwrap();
        assert!(exec(&mut s, "SELECT * FROM t").await.is_err());
        exec(&mut s, "RESET search_path").await.unwrap();
        assert_eq!(exec(&mut s, "SELECT * FROM t").await.unwrap(), 10);
    }

    #[tokio::test]
    async fn alter_system_set_and_reset() {
        let db = MemoryDatabase::new("test");
        let mut s = db.acquire().await.unwrap();
        exec(&mut s, "ALTER SYSTEM SET work_mem = '64MB'").await.unwrap();
        assert_eq!(db.system_setting("work_mem").as_deref(), Some("'64MB'"));
        exec(&mut s, "ALTER SYSTEM RESET work_mem;").await.unwrap();
        assert_eq!(db.system_setting("work_mem"), None);
    }
}
