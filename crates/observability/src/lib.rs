//! Process-wide tracing setup.

/// Initialize tracing for the process, reading `LOG_FORMAT` and `RUST_LOG`.
///
/// Fails without installing a subscriber when `LOG_FORMAT` is not recognised.
/// Safe to call multiple times; subsequent calls are no-ops.
pub fn init() -> Result<(), String> {
    tracing::init_with(tracing::LogFormat::from_env()?);
    Ok(())
}

/// Subscriber configuration (format, filter).
pub mod tracing;

pub use tracing::LogFormat;
