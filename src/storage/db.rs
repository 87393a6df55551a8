//! Shared database connection pool management.
//!
//! One deadpool-postgres pool per process, built from `DATABASE_URL`. Pool
//! limits are conservative: the importer favors few fat batched statements
//! over many small ones.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use deadpool_postgres::{Config as PgConfig, Pool, PoolConfig, Runtime, Timeouts};
use once_cell::sync::Lazy;
use tokio_postgres::NoTls;

use crate::config::Config;
use crate::errors::StorageError;

static SHARED_POOL: Lazy<Arc<Mutex<Option<Arc<Pool>>>>> =
    Lazy::new(|| Arc::new(Mutex::new(None)));

/// Get or create the process-wide database pool.
pub async fn get_shared_pool(config: &Config) -> Result<Arc<Pool>, StorageError> {
    {
        let guard = SHARED_POOL.lock().unwrap();
        if let Some(ref pool) = *guard {
            return Ok(pool.clone());
        }
    }

    let pool = create_pool(config).await?;

    {
        let mut guard = SHARED_POOL.lock().unwrap();
        *guard = Some(pool.clone());
    }

    Ok(pool)
}

async fn create_pool(config: &Config) -> Result<Arc<Pool>, StorageError> {
    let database_url = config
        .database_url()
        .ok_or_else(|| StorageError::Pool("DATABASE_URL not configured".to_string()))?;

    let url = url::Url::parse(&database_url)
        .map_err(|e| StorageError::Pool(format!("Invalid DATABASE_URL format: {}", e)))?;

    if url.scheme() != "postgres" && url.scheme() != "postgresql" {
        return Err(StorageError::Pool(format!(
            "Invalid database scheme: expected 'postgres' or 'postgresql', got '{}'",
            url.scheme()
        )));
    }

    let mut pg_config = PgConfig::new();
    pg_config.host = Some(
        url.host_str()
            .ok_or_else(|| StorageError::Pool("Missing host in DATABASE_URL".to_string()))?
            .to_string(),
    );
    pg_config.port = Some(url.port().unwrap_or(5432));
    pg_config.user = Some(if !url.username().is_empty() {
        url.username().to_string()
    } else {
        "postgres".to_string()
    });
    pg_config.password = url.password().map(|p| p.to_string());
    pg_config.dbname = Some(url.path().trim_start_matches('/').to_string())
        .filter(|s| !s.is_empty())
        .or_else(|| Some("beefy".to_string()));
    pg_config.connect_timeout = Some(Duration::from_secs(5));

    pg_config.pool = Some(PoolConfig {
        max_size: 20,
        timeouts: Timeouts {
            create: Some(Duration::from_secs(5)),
            wait: Some(Duration::from_secs(30)),
            recycle: Some(Duration::from_secs(300)),
        },
        ..Default::default()
    });

    let pool = pg_config
        .create_pool(Some(Runtime::Tokio1), NoTls)
        .map_err(|e| StorageError::Pool(format!("Failed to create database pool: {}", e)))?;

    // Fail fast on a dead database rather than at first import tick
    let conn = pool
        .get()
        .await
        .map_err(|e| StorageError::Pool(format!("Failed to get database connection: {}", e)))?;
    conn.query_opt("SELECT 1 FROM import_state LIMIT 1", &[])
        .await
        .map_err(|e| StorageError::Pool(format!("Failed to verify import_state table: {}", e)))?;

    tracing::info!(max_size = 20, "Database pool created");

    Ok(Arc::new(pool))
}

/// Map a deadpool error into a storage error, preserving timeout-ness so the
/// retry path can classify it.
pub fn pool_error(e: deadpool_postgres::PoolError) -> StorageError {
    let msg = e.to_string();
    if msg.contains("timed out") || msg.contains("Timeout") {
        StorageError::ConnectionTimeout(msg)
    } else {
        StorageError::Pool(msg)
    }
}
