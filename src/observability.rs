//! Process-wide logging initialization.
//!
//! Called once from the binary entry point; safe to call again (later calls
//! are no-ops because the global subscriber is already installed).

use crate::error::{KeystoneError, Result};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Install the tracing subscriber. `RUST_LOG` takes precedence over the
/// configured level.
pub fn init(log_level: &str) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init()
        .map_err(|e| KeystoneError::Internal(format!("failed to init logging: {}", e)))?;

    Ok(())
}
