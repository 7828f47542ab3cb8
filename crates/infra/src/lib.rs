//! Infrastructure layer: Postgres pool, configuration, tenant storage and
//! background workers.

pub mod config;
pub mod db;
pub mod retry;
pub mod tenant_store;
pub mod workers;

pub use config::{CleanupConfig, ConfigError, PoolConfig, StoreConfig};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use tenant_store::{InMemoryTenantStore, PostgresTenantStore, StoreError, TenantStore};
pub use workers::{CleanupSweeper, SweepStats, SweeperHandle};
