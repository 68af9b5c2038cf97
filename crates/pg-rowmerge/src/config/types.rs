//! Configuration type definitions.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Resolved database configuration.
///
/// Keys use the kebab-case names of the settings file, e.g.
/// `database-name` or `pooling-args`. Unknown keys are ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database engine (only PostgreSQL is supported).
    #[serde(rename = "database-engine", default = "default_engine")]
    pub engine: String,

    /// Server host.
    #[serde(rename = "database-host", default = "default_host")]
    pub host: String,

    /// Server port.
    #[serde(rename = "database-port", default = "default_port")]
    pub port: u16,

    /// Database name.
    #[serde(rename = "database-name", default)]
    pub name: String,

    /// Login role.
    #[serde(rename = "database-user", default = "default_user")]
    pub user: String,

    /// Password, if the server requires one.
    #[serde(
        rename = "database-password",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub password: Option<String>,

    /// Schema used for unqualified table names.
    #[serde(rename = "database-schema", default = "default_schema")]
    pub schema: String,

    /// SSL mode: disable, require, verify-ca, verify-full.
    #[serde(rename = "ssl-mode", default = "default_ssl_mode")]
    pub ssl_mode: String,

    /// Extra connection arguments.
    #[serde(rename = "connect-args", default)]
    pub connect_args: ConnectArgs,

    /// Connection pool sizing.
    #[serde(rename = "pooling-args", default)]
    pub pooling_args: PoolingArgs,

    /// strftime pattern used to parse and render `date` literals.
    #[serde(rename = "date-format", default = "default_date_format")]
    pub date_format: String,

    /// strftime pattern used to parse and render `timestamp` literals.
    #[serde(rename = "timestamp-format", default = "default_timestamp_format")]
    pub timestamp_format: String,
}

/// Connection arguments forwarded to the driver.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectArgs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application_name: Option<String>,

    /// Connect timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_timeout: Option<u64>,

    /// Server `options` string, e.g. `-c statement_timeout=60000`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keepalives: Option<bool>,

    /// Anything else; logged and ignored when connecting.
    #[serde(flatten)]
    pub other: BTreeMap<String, serde_json::Value>,
}

/// Connection pool arguments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolingArgs {
    /// Maximum pooled connections. A pipeline run holds one for its
    /// cursor and needs at least one more for staging and merging.
    #[serde(rename = "max-size", default = "default_pool_size")]
    pub max_size: usize,

    /// Seconds to wait for a free connection.
    #[serde(rename = "wait-timeout-secs", default = "default_wait_timeout")]
    pub wait_timeout_secs: u64,
}

impl Default for PoolingArgs {
    fn default() -> Self {
        Self {
            max_size: default_pool_size(),
            wait_timeout_secs: default_wait_timeout(),
        }
    }
}

/// Date and timestamp patterns used by the literal compiler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiteralFormats {
    pub date: String,
    pub timestamp: String,
}

impl Default for LiteralFormats {
    fn default() -> Self {
        Self {
            date: default_date_format(),
            timestamp: default_timestamp_format(),
        }
    }
}

impl DatabaseConfig {
    /// Configuration for `name` with every other key defaulted.
    pub fn for_database(name: impl Into<String>) -> Self {
        Self {
            engine: default_engine(),
            host: default_host(),
            port: default_port(),
            name: name.into(),
            user: default_user(),
            password: None,
            schema: default_schema(),
            ssl_mode: default_ssl_mode(),
            connect_args: ConnectArgs::default(),
            pooling_args: PoolingArgs::default(),
            date_format: default_date_format(),
            timestamp_format: default_timestamp_format(),
        }
    }

    /// Literal formats taken from this configuration.
    pub fn literal_formats(&self) -> LiteralFormats {
        LiteralFormats {
            date: self.date_format.clone(),
            timestamp: self.timestamp_format.clone(),
        }
    }
}

// Default value functions for serde
fn default_engine() -> String {
    "postgresql".to_string()
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    5432
}

fn default_user() -> String {
    "postgres".to_string()
}

fn default_schema() -> String {
    "public".to_string()
}

fn default_ssl_mode() -> String {
    "disable".to_string()
}

fn default_pool_size() -> usize {
    4
}

fn default_wait_timeout() -> u64 {
    30
}

fn default_date_format() -> String {
    "%Y-%m-%d".to_string()
}

fn default_timestamp_format() -> String {
    "%Y-%m-%d %H:%M:%S%.f".to_string()
}
