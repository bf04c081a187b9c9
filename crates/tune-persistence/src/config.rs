//! Carga de configuración de conexión desde variables de entorno.
//! Usa convención `DATABASE_URL` y parámetros opcionales de pool.

use std::env;
use std::str::FromStr;

use dotenvy::dotenv;
use once_cell::sync::Lazy;

use crate::error::PersistenceError;

// Carga perezosa del archivo .env una sola vez.
static DOTENV_LOADED: Lazy<()> = Lazy::new(|| {
    let _ = dotenv(); // ignora error si no existe .env
});

#[derive(Debug, Clone)]
pub struct DbConfig {
    pub url: String,
    pub min_connections: u32,
    pub max_connections: u32,
}

impl DbConfig {
    pub fn from_env() -> Result<Self, PersistenceError> {
        Lazy::force(&DOTENV_LOADED);
        let url = env::var("DATABASE_URL").map_err(|_| PersistenceError::Config("DATABASE_URL no definido".into()))?;
        let min_connections = parse_env("DATABASE_MIN_CONNECTIONS", 2)?;
        let max_connections = parse_env("DATABASE_MAX_CONNECTIONS", 16)?;
        Ok(Self { url, min_connections, max_connections })
    }
}

/// Lee `key` y la parsea; ausente o vacía devuelve `default`. Un valor
/// presente pero inválido es un error de configuración.
pub fn parse_env<T: FromStr>(key: &str, default: T) -> Result<T, PersistenceError> {
    parse_value(key, env::var(key).ok().as_deref(), default)
}

pub fn parse_value<T: FromStr>(key: &str, raw: Option<&str>, default: T) -> Result<T, PersistenceError> {
    match raw.map(str::trim) {
        None | Some("") => Ok(default),
        Some(v) => v.parse().map_err(|_| PersistenceError::Config(format!("{key}: valor inválido '{v}'"))),
    }
}

/// Forzar carga temprana de .env desde aplicaciones externas si se desea.
pub fn init_dotenv() {
    Lazy::force(&DOTENV_LOADED);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_or_blank_values_use_default() {
        assert_eq!(parse_value("X", None, 4u32).unwrap(), 4);
        assert_eq!(parse_value("X", Some("  "), 4u32).unwrap(), 4);
        assert_eq!(parse_value("X", Some(" 9 "), 4u32).unwrap(), 9);
    }

    #[test]
    fn invalid_values_are_config_errors() {
        let err = parse_value("DATABASE_MAX_CONNECTIONS", Some("muchas"), 16u32).unwrap_err();
        assert!(matches!(err, PersistenceError::Config(_)));
        assert!(err.to_string().contains("DATABASE_MAX_CONNECTIONS"));
    }
}
