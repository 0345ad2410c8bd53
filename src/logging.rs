use tracing_subscriber::EnvFilter;

pub const LOG_ENV: &str = "PHYSICS_BAR_LOG";

/// Installs the global subscriber. Logs go to stderr because the tool host's
/// stdout carries protocol frames.
pub fn init(default_directive: &str) {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default_directive));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
