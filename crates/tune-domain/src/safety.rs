//! Compuerta de seguridad entre sentencias generadas (heurística / LLM) y una
//! base real.
//!
//! La validación es deliberadamente conservadora y basada en el prefijo de la
//! sentencia: no intenta "entender" el SQL. Sólo cuatro formas pasan:
//!
//! - `CREATE INDEX CONCURRENTLY ...`
//! - `DROP INDEX CONCURRENTLY ...`
//! - `ALTER SYSTEM ...`
//! - `SET ...` (parámetros de sesión)
use std::collections::HashMap;

use once_cell::sync::Lazy;

use crate::recommendation::Recommendation;

/// Valores por defecto conocidos para parámetros de tuning comunes. Se usan
/// para revertir un `SET <param> = ...` sin rollback explícito.
static SAFE_DEFAULTS: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([("work_mem", "'4MB'"),
                   ("maintenance_work_mem", "'64MB'"),
                   ("temp_buffers", "'8MB'"),
                   ("effective_cache_size", "'4GB'"),
                   ("random_page_cost", "4"),
                   ("seq_page_cost", "1"),
                   ("cpu_tuple_cost", "0.01"),
                   ("cpu_index_tuple_cost", "0.005"),
                   ("cpu_operator_cost", "0.0025"),
                   ("effective_io_concurrency", "1"),
                   ("default_statistics_target", "100"),
                   ("max_parallel_workers_per_gather", "2"),
                   ("parallel_setup_cost", "1000"),
                   ("parallel_tuple_cost", "0.1"),
                   ("jit", "on"),
                   ("enable_seqscan", "on"),
                   ("enable_indexscan", "on"),
                   ("enable_bitmapscan", "on"),
                   ("enable_nestloop", "on"),
                   ("enable_hashjoin", "on"),
                   ("enable_mergejoin", "on"),
                   ("statement_timeout", "0")])
});

/// Cuerpo de la sentencia sin espacios externos ni `;` final.
fn statement_body(sql: &str) -> &str {
    let trimmed = sql.trim();
    trimmed.strip_suffix(';').unwrap_or(trimmed).trim_end()
}

fn leading_upper(body: &str, n: usize) -> Vec<String> {
    body.split_whitespace().take(n).map(str::to_ascii_uppercase).collect()
}

/// Allow-list de sentencias ejecutables contra una base real.
///
/// Además del prefijo se rechazan: entrada vacía, sentencias apiladas (`;`
/// fuera de la posición final) y los `SET` que cambian identidad
/// (`SET ROLE`, `SET SESSION AUTHORIZATION`).
pub fn validate_safety(sql: &str) -> bool {
    let body = statement_body(sql);
    if body.is_empty() || body.contains(';') {
        return false;
    }
    let tokens = leading_upper(body, 3);
    let t: Vec<&str> = tokens.iter().map(String::as_str).collect();
    match t.as_slice() {
        ["CREATE", "INDEX", "CONCURRENTLY", ..] => true,
        ["DROP", "INDEX", "CONCURRENTLY", ..] => true,
        ["ALTER", "SYSTEM", ..] => true,
        ["SET", "ROLE", ..] | ["SET", "SESSION", "AUTHORIZATION"] | ["SET", "LOCAL", "ROLE"] => false,
        ["SET", _, ..] => true,
        _ => false,
    }
}

/// `true` para sentencias que Postgres rechaza dentro de un bloque de
/// transacción.
pub fn requires_autocommit(sql: &str) -> bool {
    let tokens = leading_upper(statement_body(sql), 3);
    let t: Vec<&str> = tokens.iter().map(String::as_str).collect();
    matches!(t.as_slice(), ["CREATE", "INDEX", "CONCURRENTLY", ..] | ["DROP", "INDEX", "CONCURRENTLY", ..] | ["ALTER", "SYSTEM", ..])
}

/// `true` para DDL de índices, los únicos candidatos que tienen efecto
/// medible dentro de un namespace aislado.
pub fn is_index_ddl(sql: &str) -> bool {
    let tokens = leading_upper(statement_body(sql), 3);
    let t: Vec<&str> = tokens.iter().map(String::as_str).collect();
    matches!(t.as_slice(), ["CREATE", "INDEX", "CONCURRENTLY", ..] | ["DROP", "INDEX", "CONCURRENTLY", ..])
}

fn is_param_name(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
}

/// Deriva un rollback cuando la recomendación no trae uno.
///
/// Heurísticas (best-effort):
/// - `CREATE INDEX CONCURRENTLY [IF NOT EXISTS] <name> ...` ->
///   `DROP INDEX CONCURRENTLY [IF EXISTS] <name>;`
/// - `SET [SESSION|LOCAL] <param> = ...` -> `SET <param> = <default>;` si el
///   parámetro está en la tabla de defaults conocidos.
/// - `ALTER SYSTEM SET <param> ...` -> `ALTER SYSTEM RESET <param>;`
///
/// `None` es un resultado válido: no existe heurística segura.
pub fn derive_rollback(rec: &Recommendation) -> Option<String> {
    if let Some(supplied) = rec.supplied_rollback() {
        return Some(supplied.to_string());
    }
    let body = statement_body(&rec.sql_fix);
    let words: Vec<&str> = body.split_whitespace().collect();
    let upper: Vec<String> = words.iter().map(|w| w.to_ascii_uppercase()).collect();
    let u: Vec<&str> = upper.iter().map(String::as_str).collect();

    match u.as_slice() {
        ["CREATE", "INDEX", "CONCURRENTLY", rest @ ..] => {
            let (if_exists, offset) = match rest {
                ["IF", "NOT", "EXISTS", ..] => (true, 6),
                _ => (false, 3),
            };
            let name = words.get(offset)?;
            if name.eq_ignore_ascii_case("ON") || name.contains('(') {
                return None;
            }
            let guard = if if_exists { "IF EXISTS " } else { "" };
            Some(format!("DROP INDEX CONCURRENTLY {guard}{name};"))
        }
        ["SET", ..] => {
            let offset = match u.get(1) {
                Some(&"SESSION") | Some(&"LOCAL") => 2,
                _ => 1,
            };
            let token = words.get(offset)?;
            let param = token.split('=').next()?.trim().to_ascii_lowercase();
            let default = SAFE_DEFAULTS.get(param.as_str())?;
            Some(format!("SET {param} = {default};"))
        }
        ["ALTER", "SYSTEM", "SET", ..] => {
            let param = words.get(3)?.split('=').next()?.trim().to_ascii_lowercase();
            if !is_param_name(&param) {
                return None;
            }
            Some(format!("ALTER SYSTEM RESET {param};"))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(sql_fix: &str) -> Recommendation {
        Recommendation::new("r1", sql_fix, "SELECT 1", vec![])
    }

    #[test]
    fn allow_list_accepts_the_four_shapes() {
        assert!(validate_safety("CREATE INDEX CONCURRENTLY idx_a ON t(a)"));
        assert!(validate_safety("drop index concurrently idx_a;"));
        assert!(validate_safety("ALTER SYSTEM SET work_mem = '64MB'"));
        assert!(validate_safety("SET work_mem = '64MB'"));
    }

    #[test]
    fn allow_list_rejects_everything_else() {
        assert!(!validate_safety("DROP TABLE users"));
        assert!(!validate_safety("CREATE INDEX idx_a ON t(a)"));
        assert!(!validate_safety("SET"));
        assert!(!validate_safety("SETTINGS x"));
        assert!(!validate_safety("   "));
        assert!(!validate_safety("SET work_mem = '1MB'; DROP TABLE users"));
        assert!(!validate_safety("SET ROLE postgres"));
        assert!(!validate_safety("-- comment\nSET work_mem = '1MB'"));
    }

    #[test]
    fn autocommit_detection() {
        assert!(requires_autocommit("CREATE INDEX CONCURRENTLY i ON t(a)"));
        assert!(requires_autocommit("ALTER SYSTEM SET jit = off"));
        assert!(!requires_autocommit("SET work_mem = '8MB'"));
    }

    #[test]
    fn rollback_for_index_without_name_is_none() {
        assert_eq!(derive_rollback(&rec("CREATE INDEX CONCURRENTLY ON bar(baz)")), None);
    }

    #[test]
    fn rollback_keeps_if_exists_guard() {
        assert_eq!(derive_rollback(&rec("CREATE INDEX CONCURRENTLY IF NOT EXISTS idx_x ON t(a)")).as_deref(),
                   Some("DROP INDEX CONCURRENTLY IF EXISTS idx_x;"));
    }

    #[test]
    fn rollback_for_set_uses_known_default() {
        assert_eq!(derive_rollback(&rec("SET work_mem = '256MB'")).as_deref(), Some("SET work_mem = '4MB';"));
        assert_eq!(derive_rollback(&rec("SET LOCAL random_page_cost TO 1.1")).as_deref(), Some("SET random_page_cost = 4;"));
        assert_eq!(derive_rollback(&rec("SET work_mem='1GB'")).as_deref(), Some("SET work_mem = '4MB';"));
        assert_eq!(derive_rollback(&rec("SET application_name = 'x'")), None);
    }

    #[test]
    fn rollback_for_alter_system_resets() {
        assert_eq!(derive_rollback(&rec("ALTER SYSTEM SET shared_buffers = '2GB'")).as_deref(),
                   Some("ALTER SYSTEM RESET shared_buffers;"));
    }

    #[test]
    fn supplied_rollback_wins() {
        let r = rec("CREATE INDEX CONCURRENTLY idx_foo ON bar(baz)").with_rollback("DROP INDEX CONCURRENTLY IF EXISTS idx_foo");
        assert_eq!(derive_rollback(&r).as_deref(), Some("DROP INDEX CONCURRENTLY IF EXISTS idx_foo"));
    }
}
