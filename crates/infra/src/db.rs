//! Database adapters: connection pool construction and SQLx error mapping.
//!
//! ## Error Mapping
//!
//! SQLx errors are mapped to `StoreError` as follows:
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError | Scenario |
//! |------------|----------------------|------------|----------|
//! | Database | `08xxx`, `53300`, `57P01`-`57P03` | `Connection` | Connection lost, server full or shutting down |
//! | Database | `40001`, `40P01` | `Connection` | Serialization failure / deadlock; the transaction was rolled back and may be retried |
//! | Database | `3F000`, `42P01` | `NotFound` | Tenant schema or table missing |
//! | Database | `42P06`, `42P07` | `SchemaRace` | Schema/table created concurrently |
//! | Database | Any other | `Query` | Constraint violations, syntax errors |
//! | PoolTimedOut, Io, Tls, Protocol | N/A | `Connection` | Pool exhausted or database unreachable |
//! | PoolClosed | N/A | `PoolClosed` | Pool closed by its owner |
//! | Other | N/A | `Query` | Decode failures, unexpected rows |

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

use crate::config::PoolConfig;
use crate::retry::{RetryPolicy, retry_transient};
use crate::tenant_store::StoreError;

/// Build pool options from configuration.
pub fn pool_options(config: &PoolConfig) -> PgPoolOptions {
    PgPoolOptions::new()
        .min_connections(config.min_connections)
        .max_connections(config.max_connections)
        .acquire_timeout(config.acquire_timeout)
        .idle_timeout(config.idle_timeout)
}

/// Connect a bounded pool, retrying transient failures per `retry`.
///
/// The pool is owned by the caller (the application's composition root) and
/// handed to the stores that need it.
pub async fn connect_pool(
    database_url: &str,
    config: &PoolConfig,
    retry: &RetryPolicy,
) -> Result<PgPool, StoreError> {
    let options = pool_options(config);
    let pool = retry_transient(retry, "connect_pool", || {
        let options = options.clone();
        async move {
            options
                .connect(database_url)
                .await
                .map_err(|e| map_sqlx_error("connect_pool", e))
        }
    })
    .await?;

    info!(
        min_connections = config.min_connections,
        max_connections = config.max_connections,
        "database pool connected"
    );
    Ok(pool)
}

/// Build a pool that opens connections on first use.
pub fn connect_pool_lazy(database_url: &str, config: &PoolConfig) -> Result<PgPool, StoreError> {
    pool_options(config)
        .connect_lazy(database_url)
        .map_err(|e| map_sqlx_error("connect_pool_lazy", e))
}

/// Map SQLx errors to StoreError.
pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some(code) if code.starts_with("08") => StoreError::Connection(msg),
                Some("53300" | "57P01" | "57P02" | "57P03" | "40001" | "40P01") => {
                    StoreError::Connection(msg)
                }
                // invalid_schema_name / undefined_table
                Some("3F000" | "42P01") => StoreError::NotFound(msg),
                // duplicate_schema / duplicate_table
                Some("42P06" | "42P07") => StoreError::SchemaRace(msg),
                _ => StoreError::Query(msg),
            }
        }
        sqlx::Error::PoolTimedOut => {
            StoreError::Connection(format!("timed out acquiring a connection in {}", operation))
        }
        sqlx::Error::PoolClosed => StoreError::PoolClosed,
        sqlx::Error::Io(e) => StoreError::Connection(format!("i/o error in {}: {}", operation, e)),
        sqlx::Error::Tls(e) => StoreError::Connection(format!("tls error in {}: {}", operation, e)),
        sqlx::Error::Protocol(e) => {
            StoreError::Connection(format!("protocol error in {}: {}", operation, e))
        }
        sqlx::Error::RowNotFound => {
            StoreError::Query(format!("unexpected row not found in {}", operation))
        }
        _ => StoreError::Query(format!("sqlx error in {}: {}", operation, err)),
    }
}

/// Check if an error is a unique constraint violation.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        return db_err.code().as_deref() == Some("23505");
    }
    false
}

/// Check if an error is a `numeric_value_out_of_range` failure.
pub(crate) fn is_numeric_overflow(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        return db_err.code().as_deref() == Some("22003");
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn pool_level_failures_are_connection_errors() {
        assert!(map_sqlx_error("op", sqlx::Error::PoolTimedOut).is_retryable());
        assert!(matches!(
            map_sqlx_error("op", sqlx::Error::PoolClosed),
            StoreError::PoolClosed
        ));
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert!(map_sqlx_error("op", sqlx::Error::Io(io)).is_retryable());
        assert!(!map_sqlx_error("op", sqlx::Error::RowNotFound).is_retryable());
    }

    #[tokio::test]
    async fn lazy_pool_respects_bounds() {
        let config = PoolConfig {
            min_connections: 1,
            max_connections: 4,
            acquire_timeout: Duration::from_millis(50),
            idle_timeout: None,
        };
        let pool = connect_pool_lazy("postgres://user:pw@127.0.0.1:1/none", &config).unwrap();
        assert_eq!(pool.options().get_max_connections(), 4);
        assert_eq!(pool.options().get_min_connections(), 1);
        pool.close().await;
    }
}
