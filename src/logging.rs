//! Logging initialization helper.

use tracing_subscriber::{fmt, EnvFilter};

use crate::error::{Result, YggdrasilError};

/// Initializes the global tracing subscriber with the given filter
/// directive (e.g. `"info"` or `"yggdrasil=debug"`).
pub fn init_logging(level: &str) -> Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::try_new(level)
                .map_err(|e| YggdrasilError::InvalidArgument(format!("invalid log level: {e}")))?,
        )
        .with_target(true)
        .with_thread_ids(true)
        .try_init()
        .map_err(|_| YggdrasilError::InvalidArgument("logging already initialized".into()))
}
