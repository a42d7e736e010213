//! Opt-in tracing setup for tests and binaries embedding this crate
//!
//! The library itself only emits `tracing` events and never installs a
//! subscriber on its own. [`init`] wires a plain stderr subscriber honoring
//! the `LOCKWRITE_LOG` environment variable (`error`, `warn`, `info`,
//! `debug`, `trace`, or `off`; default `warn`), for embedders that have no
//! tracing stack of their own.

use std::sync::OnceLock;

use tracing_subscriber::filter::LevelFilter;

static INIT: OnceLock<()> = OnceLock::new();

/// Install the default subscriber once.
///
/// Safe to call repeatedly and from multiple threads; later calls are
/// no-ops, and an embedder's already-installed subscriber wins.
pub fn init() {
    INIT.get_or_init(|| {
        let level = std::env::var("LOCKWRITE_LOG")
            .ok()
            .and_then(|value| parse_level(&value))
            .unwrap_or(LevelFilter::WARN);
        let _ = tracing_subscriber::fmt()
            .with_max_level(level)
            .with_writer(std::io::stderr)
            .with_target(false)
            .try_init();
    });
}

fn parse_level(value: &str) -> Option<LevelFilter> {
    match value.to_ascii_lowercase().as_str() {
        "off" | "none" => Some(LevelFilter::OFF),
        "error" => Some(LevelFilter::ERROR),
        "warn" | "warning" => Some(LevelFilter::WARN),
        "info" => Some(LevelFilter::INFO),
        "debug" => Some(LevelFilter::DEBUG),
        "trace" => Some(LevelFilter::TRACE),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level_known_values() {
        assert_eq!(parse_level("trace"), Some(LevelFilter::TRACE));
        assert_eq!(parse_level("DEBUG"), Some(LevelFilter::DEBUG));
        assert_eq!(parse_level("warning"), Some(LevelFilter::WARN));
        assert_eq!(parse_level("off"), Some(LevelFilter::OFF));
    }

    #[test]
    fn test_parse_level_rejects_garbage() {
        assert_eq!(parse_level("loud"), None);
        assert_eq!(parse_level(""), None);
    }

    #[test]
    fn test_init_is_idempotent() {
        init();
        init();
    }
}
