//! Errores del binario y de la capa de servicio.

mod app_error;

pub use app_error::AppError;
