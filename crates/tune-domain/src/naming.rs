//! Convenciones de nombres de namespaces y quoting de identificadores.
//!
//! - Sandbox de benchmark: `tune_job_<uuid sin guiones>`, derivado 1:1 del
//!   job. Es un identificador válido (minúsculas, < 63 bytes).
//! - Sandbox de apply: `tune_apply_<id saneado>_<unix segundos>`. El sufijo
//!   numérico permite limpieza por antigüedad.
use chrono::{DateTime, TimeZone, Utc};
use uuid::Uuid;

pub const JOB_SCHEMA_PREFIX: &str = "tune_job_";
pub const APPLY_SCHEMA_PREFIX: &str = "tune_apply_";

/// Límite de Postgres para identificadores (NAMEDATALEN - 1).
const MAX_IDENT_LEN: usize = 63;

pub fn sandbox_schema_name(job_id: Uuid) -> String {
    format!("{JOB_SCHEMA_PREFIX}{}", job_id.simple())
}

/// Recupera el job dueño a partir del nombre del namespace.
pub fn job_id_from_schema(schema_name: &str) -> Option<Uuid> {
    let hex = schema_name.strip_prefix(JOB_SCHEMA_PREFIX)?;
    if hex.len() != 32 {
        return None;
    }
    Uuid::parse_str(hex).ok()
}

fn sanitize(raw: &str) -> String {
    raw.chars()
       .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
       .collect()
}

pub fn apply_schema_name(recommendation_id: &str, at: DateTime<Utc>) -> String {
    let ts = at.timestamp().max(0).to_string();
    let budget = MAX_IDENT_LEN - APPLY_SCHEMA_PREFIX.len() - 1 - ts.len();
    let mut id = sanitize(recommendation_id);
    id.truncate(budget);
    if id.is_empty() {
        id.push('x');
    }
    format!("{APPLY_SCHEMA_PREFIX}{id}_{ts}")
}

/// Timestamp embebido en un namespace de apply. `None` si el nombre no sigue
/// la convención.
pub fn apply_schema_timestamp(schema_name: &str) -> Option<DateTime<Utc>> {
    let rest = schema_name.strip_prefix(APPLY_SCHEMA_PREFIX)?;
    let (id, ts) = rest.rsplit_once('_')?;
    if id.is_empty() || ts.is_empty() || !ts.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let secs: i64 = ts.parse().ok()?;
    Utc.timestamp_opt(secs, 0).single()
}

/// Parte del id de recomendación embebida en un namespace de apply (saneada).
pub fn apply_schema_recommendation(schema_name: &str) -> Option<&str> {
    let rest = schema_name.strip_prefix(APPLY_SCHEMA_PREFIX)?;
    rest.rsplit_once('_').map(|(id, _)| id)
}

/// Cita un identificador para SQL (`"a""b"`).
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Nombre calificado y citado: `"schema"."name"`.
pub fn qualified(schema: &str, name: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(name))
}

/// Separa `schema.tabla` (por defecto `public`). Las partes sin comillas se
/// pliegan a minúsculas como hace Postgres; las citadas se conservan.
pub fn split_table_name(raw: &str) -> Option<(String, String)> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut was_quoted = false;
    let mut chars = raw.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' if quoted && chars.peek() == Some(&'"') => {
                current.push('"');
                chars.next();
            }
            '"' => {
                quoted = !quoted;
                was_quoted = true;
            }
            '.' if !quoted => {
                parts.push(finish_part(std::mem::take(&mut current), was_quoted)?);
                was_quoted = false;
            }
            c => current.push(c),
        }
    }
    if quoted {
        return None;
    }
    parts.push(finish_part(current, was_quoted)?);
    match parts.len() {
        1 => Some(("public".to_string(), parts.remove(0))),
        2 => {
            let name = parts.remove(1);
            Some((parts.remove(0), name))
        }
        _ => None,
    }
}

fn finish_part(part: String, was_quoted: bool) -> Option<String> {
    if was_quoted {
        return (!part.is_empty()).then_some(part);
    }
    let trimmed = part.trim();
    if trimmed.is_empty() || !trimmed.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '$') {
        return None;
    }
    Some(trimmed.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sandbox_name_is_deterministic_and_reversible() {
        let id = Uuid::new_v4();
        let name = sandbox_schema_name(id);
        assert_eq!(name, sandbox_schema_name(id));
        assert!(name.len() <= MAX_IDENT_LEN);
        assert_eq!(job_id_from_schema(&name), Some(id));
        assert_eq!(job_id_from_schema("tune_job_nothex"), None);
        assert_eq!(job_id_from_schema("public"), None);
    }

    #[test]
    fn apply_name_embeds_timestamp() {
        let at = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let name = apply_schema_name("Rec-42/x", at);
        assert_eq!(name, "tune_apply_rec_42_x_1700000000");
        assert_eq!(apply_schema_timestamp(&name), Some(at));
        assert_eq!(apply_schema_recommendation(&name), Some("rec_42_x"));
    }

    #[test]
    fn apply_name_is_truncated_to_identifier_limit() {
        let long = "a".repeat(200);
        let name = apply_schema_name(&long, Utc::now());
        assert!(name.len() <= MAX_IDENT_LEN);
        assert!(apply_schema_timestamp(&name).is_some());
    }

    #[test]
    fn malformed_apply_names_have_no_timestamp() {
        assert_eq!(apply_schema_timestamp("tune_apply_abc"), None);
        assert_eq!(apply_schema_timestamp("tune_apply_abc_12x"), None);
        assert_eq!(apply_schema_timestamp("tune_apply__123"), None);
    }

    #[test]
    fn split_handles_quotes_and_defaults() {
        assert_eq!(split_table_name("Users"), Some(("public".into(), "users".into())));
        assert_eq!(split_table_name("sales.Orders"), Some(("sales".into(), "orders".into())));
        assert_eq!(split_table_name("\"Sales\".\"Order Items\""), Some(("Sales".into(), "Order Items".into())));
        assert_eq!(split_table_name("a.b.c"), None);
        assert_eq!(split_table_name("bad;name"), None);
        assert_eq!(split_table_name("\"open"), None);
    }

    #[test]
    fn quote_escapes_double_quotes() {
        assert_eq!(quote_ident("a\"b"), "\"a\"\"b\"");
        assert_eq!(qualified("s", "t"), "\"s\".\"t\"");
    }
}
