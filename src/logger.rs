//! Logging initialisation via tracing-subscriber.
//!
//! Call [`init`] once per process, before the first index operation. The
//! library itself only emits `tracing` events and never installs a
//! subscriber on its own.

use tracing_subscriber::EnvFilter;

use crate::error::StoreError;

/// Initialise the global tracing subscriber.
///
/// `level` accepts standard level strings: `"error"`, `"warn"`, `"info"`,
/// `"debug"`, `"trace"`. `RUST_LOG` takes precedence when set; `level` is
/// the fallback.
pub fn init(level: &str) -> Result<(), StoreError> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .map_err(|e| StoreError::InvalidInput(format!("invalid log level '{level}': {e}")))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| StoreError::InvalidInput(format!("failed to set subscriber: {e}")))?;

    Ok(())
}
