pub mod config;
pub mod service;

pub use config::AppConfig;
pub use service::{PassReport, ReconService, ServiceError};
