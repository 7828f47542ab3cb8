//! Tenant-isolated activity storage.
//!
//! One namespace per tenant, created lazily and swept when idle. See
//! [`TenantStore`] for the contract shared by the Postgres and in-memory
//! implementations.

pub mod in_memory;
pub mod postgres;
pub mod schema;
pub mod r#trait;

pub use in_memory::InMemoryTenantStore;
pub use postgres::PostgresTenantStore;
pub use r#trait::{StoreError, TenantStore};

use std::time::Duration;

use chrono::{DateTime, Datelike, Utc};

/// Earliest year a Postgres `timestamptz` can hold (4713 BC).
const EARLIEST_CUTOFF_YEAR: i32 = -4712;

/// Instant before which a namespace's last activity counts as stale.
///
/// Thresholds reaching past what a `timestamptz` can represent are rejected
/// as `InvalidInput` by every store.
pub(crate) fn stale_cutoff(age_threshold: Duration) -> Result<DateTime<Utc>, StoreError> {
    let out_of_range = || StoreError::InvalidInput("age threshold out of range".to_string());
    let age = chrono::Duration::from_std(age_threshold).map_err(|_| out_of_range())?;
    Utc::now()
        .checked_sub_signed(age)
        .filter(|cutoff| cutoff.year() >= EARLIEST_CUTOFF_YEAR)
        .ok_or_else(out_of_range)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_cutoff_accepts_ordinary_thresholds() {
        let cutoff = stale_cutoff(Duration::from_secs(3600)).unwrap();
        let expected = Utc::now() - chrono::Duration::hours(1);
        assert!((cutoff - expected).num_seconds().abs() <= 1);
        assert!(stale_cutoff(Duration::ZERO).is_ok());
    }

    #[test]
    fn stale_cutoff_rejects_unrepresentable_thresholds() {
        let ten_thousand_years = Duration::from_secs(10_000 * 366 * 24 * 3600);
        for age in [Duration::MAX, ten_thousand_years] {
            assert!(
                matches!(stale_cutoff(age), Err(StoreError::InvalidInput(_))),
                "{age:?}"
            );
        }
    }
}
