pub mod api_key;
pub mod metrics;
pub mod tracing;
