use std::{backtrace::Backtrace, fmt::Display, sync::Once};

use tracing::Level;

/// Installs the diagnostics subscriber. Results go to stdout, diagnostics to stderr.
pub fn init(verbose: bool) {
    static LOGGING: Once = Once::new();

    LOGGING.call_once(|| {
        let default = if verbose { Level::DEBUG } else { Level::INFO };

        let env_filter = tracing_subscriber::EnvFilter::builder()
            .with_default_directive(default.into())
            .from_env_lossy();

        // Another subscriber may already be installed by an embedding test harness.
        let _ = tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .try_init();
    });
}

pub fn error(message: impl Display) {
    tracing::error!("{message}");
}

/// Same as [`error`], followed by the backtrace of the caller.
pub fn error_with_trace(message: impl Display) {
    let backtrace = Backtrace::force_capture();
    tracing::error!("{message}\n{backtrace}");
}
