use crate::error::{MetabaseError, Result};
use tracing_subscriber::{fmt, EnvFilter};

pub fn init_logging(level: &str) -> Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::try_new(level)
                .map_err(|e| MetabaseError::invalid(format!("invalid log level: {e}")))?,
        )
        .with_target(true)
        .with_thread_ids(true)
        .try_init()
        .map_err(|_| MetabaseError::invalid("logging already initialized"))
}
