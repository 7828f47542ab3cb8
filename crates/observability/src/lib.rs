//! Tracing and logging setup shared by every binary in the workspace.

/// Initialize process-wide observability (tracing/logging).
///
/// This is safe to call multiple times; subsequent calls become no-ops and
/// return `false`.
pub fn init() -> bool {
    tracing::init()
}

/// Initialize human-readable logging for tests and local runs.
pub fn init_pretty() -> bool {
    tracing::init_pretty()
}

/// Tracing configuration (filters, layers).
pub mod tracing;
