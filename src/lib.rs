//! TuneFlow
//!
//! Librería del binario `tuneflow`:
//! - `config`: configuración desde entorno / `.env`.
//! - `errors`: errores de la capa de aplicación.
//! - `service`: ensamblado de stores, pools destino y managers, más el ciclo
//!   de mantenimiento.
//!
//! La lógica vive en `tune-core`; los backends Postgres en `tune-persistence`.

pub mod config;
pub mod errors;
pub mod service;

pub use config::AppConfig;
pub use errors::AppError;
pub use service::{check_sql, MaintenanceReport, Service, Stores, Targets};
