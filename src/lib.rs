pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod registration;
pub mod repository;
pub mod telemetry;
pub mod tokens;
pub mod vault;
pub mod web;

pub use config::AppConfig;
pub use error::{AppError, AppResult};
