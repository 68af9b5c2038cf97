//! PostgreSQL driver.
//!
//! - [`PgDatabase`]: pooled connection provider implementing
//!   [`Catalog`](crate::core::traits::Catalog) and [`Session`]
//! - [`PgCursor`]: server-side cursor used for streaming reads

mod catalog;
mod reader;

pub use reader::PgCursor;

use std::time::{Duration, Instant};

use async_trait::async_trait;
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod, Runtime};
use serde::Serialize;
use tokio_postgres::Config as PgConfig;
use tracing::{debug, info, warn};

use crate::config::DatabaseConfig;
use crate::core::traits::{RowCursor, Session};
use crate::drivers::common::tls::{make_connector, SslMode};
use crate::error::{Result, RowMergeError};
use crate::typemap::PgTypeMapper;

/// Pooled PostgreSQL connection provider.
pub struct PgDatabase {
    pool: Pool,
    mapper: PgTypeMapper,
    endpoint: String,
}

/// Result of [`PgDatabase::health_check`].
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheckResult {
    pub endpoint: String,
    pub connected: bool,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PgDatabase {
    /// Build the pool for `config` and test it with `SELECT 1`.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        config.validate()?;

        let mut pg_config = PgConfig::new();
        pg_config.host(&config.host);
        pg_config.port(config.port);
        pg_config.dbname(&config.name);
        pg_config.user(&config.user);
        if let Some(ref password) = config.password {
            pg_config.password(password);
        }

        let args = &config.connect_args;
        pg_config.application_name(args.application_name.as_deref().unwrap_or("pg-rowmerge"));
        if let Some(secs) = args.connect_timeout {
            pg_config.connect_timeout(Duration::from_secs(secs));
        }
        if let Some(ref options) = args.options {
            pg_config.options(options);
        }
        if let Some(keepalives) = args.keepalives {
            pg_config.keepalives(keepalives);
        }
        for key in args.other.keys() {
            warn!("Ignoring unsupported connect-args key '{}'", key);
        }

        let mgr_config = ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        };

        let ssl_mode = SslMode::parse(&config.ssl_mode)?;
        let mgr = match make_connector(ssl_mode)? {
            Some(tls) => Manager::from_config(pg_config, tls, mgr_config),
            None => {
                if config.host != "localhost" && config.host != "127.0.0.1" {
                    warn!("PostgreSQL TLS is disabled. Credentials will be transmitted in plaintext.");
                }
                Manager::from_config(pg_config, tokio_postgres::NoTls, mgr_config)
            }
        };

        let pool = Pool::builder(mgr)
            .max_size(config.pooling_args.max_size)
            .wait_timeout(Some(Duration::from_secs(config.pooling_args.wait_timeout_secs)))
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| RowMergeError::pool(e, "creating PostgreSQL pool"))?;

        let endpoint = format!("{}:{}/{}", config.host, config.port, config.name);

        // Test connection
        let client = pool
            .get()
            .await
            .map_err(|e| RowMergeError::pool(e, "testing PostgreSQL connection"))?;
        client.simple_query("SELECT 1").await?;

        info!("Connected to PostgreSQL: {}", endpoint);

        Ok(Self {
            pool,
            mapper: PgTypeMapper,
            endpoint,
        })
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Round-trip a query and report latency. Connection failures are
    /// reported in the result rather than returned as errors.
    pub async fn health_check(&self) -> HealthCheckResult {
        let started = Instant::now();
        let outcome = async {
            let client = self
                .pool
                .get()
                .await
                .map_err(|e| RowMergeError::pool(e, "health check"))?;
            let row = client.query_one("SHOW server_version", &[]).await?;
            Ok::<String, RowMergeError>(row.try_get(0)?)
        }
        .await;

        let latency_ms = started.elapsed().as_millis() as u64;
        match outcome {
            Ok(version) => HealthCheckResult {
                endpoint: self.endpoint.clone(),
                connected: true,
                latency_ms,
                server_version: Some(version),
                error: None,
            },
            Err(e) => HealthCheckResult {
                endpoint: self.endpoint.clone(),
                connected: false,
                latency_ms,
                server_version: None,
                error: Some(e.to_string()),
            },
        }
    }

    pub(crate) async fn client(&self, context: &str) -> Result<deadpool_postgres::Object> {
        self.pool
            .get()
            .await
            .map_err(|e| RowMergeError::pool(e, context.to_string()))
    }
}

#[async_trait]
impl Session for PgDatabase {
    async fn execute(&self, sql: &str) -> Result<u64> {
        let client = self.client("executing statement").await?;
        debug!("execute: {}", sql);
        client
            .execute(sql, &[])
            .await
            .map_err(|e| RowMergeError::query(&e, sql))
    }

    async fn open_cursor(&self, select: &str) -> Result<Box<dyn RowCursor>> {
        let client = self.client("opening cursor").await?;
        let cursor = PgCursor::open(client, select).await?;
        Ok(Box::new(cursor))
    }
}
