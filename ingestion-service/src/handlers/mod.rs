pub mod health;
pub mod ingest;

pub use health::{bridge_health, health_check, metrics_handler, readiness_check};
pub use ingest::ingest_sms;
