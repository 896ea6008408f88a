//! Tracing subscriber setup.

use tracing_subscriber::EnvFilter;

use crate::EngineError;

/// Install a formatting subscriber for the whole process.
///
/// `filter` uses `EnvFilter` directive syntax (`"warn,pocket_ecs=debug"`).
/// When it is `None`, `RUST_LOG` is used, falling back to `warn`.
///
/// # Errors
///
/// Returns [`EngineError::Logging`] if the directives do not parse or a
/// global subscriber is already installed.
pub fn init_logging(filter: Option<&str>) -> Result<(), EngineError> {
    let filter = match filter {
        Some(directives) => {
            EnvFilter::try_new(directives).map_err(|e| EngineError::Logging(e.to_string()))?
        }
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|e| EngineError::Logging(e.to_string()))
}
