//! Tracing/logging setup shared by workers, supervisors and tests.

/// Initialize process-wide tracing with JSON output and an `info` fallback
/// filter.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init();
}

pub use self::tracing::{LogFormat, ParseLogFormatError, init_with};

/// Tracing configuration (filters, output format).
pub mod tracing;
