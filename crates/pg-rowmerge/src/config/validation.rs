//! Configuration validation.

use super::DatabaseConfig;
use crate::drivers::common::tls::SslMode;
use crate::error::{Result, RowMergeError};
use chrono::format::{Item, StrftimeItems};

/// Validate the configuration.
pub fn validate(config: &DatabaseConfig) -> Result<()> {
    match config.engine.to_lowercase().as_str() {
        "postgresql" | "postgres" => {}
        other => {
            return Err(RowMergeError::Config(format!(
                "database-engine must be 'postgresql', got '{}'",
                other
            )))
        }
    }

    if config.name.is_empty() {
        return Err(RowMergeError::Config("database-name is required".into()));
    }
    if config.host.is_empty() {
        return Err(RowMergeError::Config("database-host is required".into()));
    }
    if config.user.is_empty() {
        return Err(RowMergeError::Config("database-user is required".into()));
    }
    if config.port == 0 {
        return Err(RowMergeError::Config(
            "database-port must be non-zero".into(),
        ));
    }
    if config.schema.is_empty() {
        return Err(RowMergeError::Config(
            "database-schema must not be empty".into(),
        ));
    }

    SslMode::parse(&config.ssl_mode)?;

    if config.pooling_args.max_size < 2 {
        return Err(RowMergeError::Config(format!(
            "pooling-args.max-size must be at least 2, got {}",
            config.pooling_args.max_size
        )));
    }

    validate_format("date-format", &config.date_format)?;
    validate_format("timestamp-format", &config.timestamp_format)?;

    Ok(())
}

fn validate_format(key: &str, pattern: &str) -> Result<()> {
    if pattern.is_empty() {
        return Err(RowMergeError::Config(format!("{} must not be empty", key)));
    }
    if StrftimeItems::new(pattern).any(|item| matches!(item, Item::Error)) {
        return Err(RowMergeError::Config(format!(
            "{} is not a valid strftime pattern: '{}'",
            key, pattern
        )));
    }
    Ok(())
}
