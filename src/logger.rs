use anyhow::Result;
use tracing_subscriber::EnvFilter;

/// Install the process-wide tracing subscriber.
///
/// `level` is a fallback directive (e.g. "info", "podlink=debug") used when
/// `RUST_LOG` is not set. Safe to call once per process; a second call
/// returns an error from the subscriber registry.
pub fn init_tracing(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|err| anyhow::anyhow!("failed to install tracing subscriber: {err}"))?;
    Ok(())
}
