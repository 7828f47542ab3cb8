//! Tracing/logging initialization.

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,sqlx=warn";

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Initialize JSON logging for the process, configurable via `RUST_LOG`.
///
/// Safe to call multiple times (subsequent calls are no-ops). Returns whether
/// this call installed the subscriber.
pub fn init() -> bool {
    let filter = env_filter();
    let directives = filter.to_string();
    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false)
        .try_init()
        .is_ok();
    if installed {
        ::tracing::debug!(filter = %directives, format = "json", "tracing initialised");
    }
    installed
}

/// Plain-text variant of [`init`], writing through the test writer so output
/// is captured per test.
pub fn init_pretty() -> bool {
    let filter = env_filter();
    let directives = filter.to_string();
    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init()
        .is_ok();
    if installed {
        ::tracing::debug!(filter = %directives, format = "pretty", "tracing initialised");
    }
    installed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_initialisation_is_a_no_op() {
        init_pretty();
        assert!(!init_pretty());
        assert!(!init());
        ::tracing::info!("still logging after repeated init");
    }
}
