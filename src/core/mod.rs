//! Core building blocks: runtime configuration and the error taxonomy.

pub mod config;
pub mod error;

pub use config::Config;
pub use error::{AppError, Result};
