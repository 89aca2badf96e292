//! Process-wide tracing setup shared by the binaries.

/// Tracing subscriber configuration.
pub mod tracing;

pub use self::tracing::{LogConfig, LogFormat, init_with};

/// Initialize logging from the environment (see [`tracing`] for the variables).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() -> std::io::Result<bool> {
    init_with(&LogConfig::from_env())
}
