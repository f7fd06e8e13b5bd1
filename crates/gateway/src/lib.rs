pub mod config;
pub mod http;
pub mod idempotency;
pub mod insights;
pub mod metrics;
pub mod rate_limit;
