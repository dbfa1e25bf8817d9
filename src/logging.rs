//! Structured logging setup.
//!
//! Mirrors the teacher's logging bootstrap in `init.rs`/`main.rs`
//! (`tracing_subscriber::fmt()` driven by a level parsed out of config) but
//! factored into a single reusable entry point rather than inlined at each
//! startup site, and with an env-filter layer so `RUST_LOG` still works for
//! ad-hoc debugging.

use crate::config::LoggingConfig;
use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Initialize the global `tracing` subscriber from coordinator config.
///
/// Safe to call once per process; a second call is a no-op failure that is
/// swallowed, matching the teacher's tolerance for re-entrant init in tests.
pub fn init_tracing(config: &LoggingConfig) {
    let level = match config.level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string().to_lowercase()));

    let subscriber = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);

    let result = if config.format == "json" {
        subscriber.json().try_init()
    } else {
        subscriber.try_init()
    };

    if result.is_err() {
        tracing::debug!("tracing subscriber already initialized");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        let config = LoggingConfig {
            level: "debug".to_string(),
            format: "pretty".to_string(),
        };
        init_tracing(&config);
        init_tracing(&config);
    }
}
