pub mod api;
pub mod config;
pub mod error;
pub mod models;
pub mod service;
pub mod session;

pub use config::AppConfig;
pub use service::{BatchCoordinator, ExtractionClient, LedgerImporter, ReconciliationEngine};
