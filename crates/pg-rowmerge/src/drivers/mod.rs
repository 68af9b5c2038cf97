//! Database drivers.

pub mod common;
pub mod postgres;

pub use postgres::{HealthCheckResult, PgCursor, PgDatabase};
