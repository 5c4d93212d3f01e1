#![forbid(unsafe_code)]

//! Tracing subscriber setup shared by the binaries.

use anyhow::{Result, anyhow};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Directive used when `RUST_LOG` is unset or invalid.
pub fn default_directive(level: &str) -> String {
    format!("tubevault={level},backend={level},tower_http={level}")
}

/// Installs a compact stdout subscriber. `RUST_LOG` wins over `level`.
pub fn init_logging(level: &str) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directive(level)))
        .map_err(|err| anyhow!("failed to create log filter: {err}"))?;

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|err| anyhow!("failed to install tracing subscriber: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_directive_parses() {
        let directive = default_directive("debug");
        assert!(directive.starts_with("tubevault=debug"));
        assert!(EnvFilter::try_new(directive).is_ok());
    }

    #[test]
    fn second_install_is_an_error_not_a_panic() {
        let _ = init_logging("info");
        assert!(init_logging("info").is_err());
    }
}
