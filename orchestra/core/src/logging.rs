//! Logging setup
//!
//! The library only emits `tracing` events. Applications that do not install
//! their own subscriber can call [`init_logging`].

use anyhow::Context;
use tracing_subscriber::EnvFilter;

/// Install a global `fmt` subscriber
///
/// `RUST_LOG` wins when set; otherwise `default_directive` is used, e.g.
/// `"orchestra_core=info"` or the `log_filter` from
/// [`OrchestraConfig`](crate::config::OrchestraConfig).
///
/// # Errors
///
/// Fails if the directive does not parse or a global subscriber is already
/// installed.
pub fn init_logging(default_directive: &str) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(default_directive)
            .with_context(|| format!("invalid log filter: {default_directive}"))?,
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!(e))
        .context("failed to install tracing subscriber")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_fails_cleanly() {
        // Whichever call comes first may succeed; the second must not panic
        let _ = init_logging("orchestra_core=debug");
        assert!(init_logging("orchestra_core=debug").is_err());
    }
}
