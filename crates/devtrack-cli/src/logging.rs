use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Installs a stderr subscriber.
///
/// The filter comes from `DEVTRACK_LOG`, then `RUST_LOG`, defaulting to `warn`
/// so stdout stays clean for `--json` consumers.
pub fn init() {
    let filter = EnvFilter::try_from_env("DEVTRACK_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
}
