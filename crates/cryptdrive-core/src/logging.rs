//! Logging bootstrap for the cryptdrive binaries.

use env_logger::{Builder, Env};

/// Environment variable that overrides the computed log filter.
pub const LOG_ENV: &str = "CRYPTDRIVE_LOG";

const LEVELS: &[&str] = &["error", "warn", "info", "debug", "trace"];

/// Install the global logger with `default_level` unless `CRYPTDRIVE_LOG` is set.
pub fn init(default_level: &str) {
    let _ = Builder::from_env(Env::new().filter_or(LOG_ENV, default_level))
        .format_timestamp(None)
        .format_target(false)
        .try_init();
}

/// Install the global logger, shifting the default `info` level by `delta`
/// (`-v` adds one, `-q` subtracts one).
pub fn init_with_verbosity(delta: i8) {
    init(level_for(delta));
}

/// Resolve the filter string for a verbosity delta relative to `info`.
pub fn level_for(delta: i8) -> &'static str {
    let index = (2 + i16::from(delta)).clamp(0, LEVELS.len() as i16 - 1);
    LEVELS[index as usize]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_shifts_from_info() {
        assert_eq!(level_for(0), "info");
        assert_eq!(level_for(1), "debug");
        assert_eq!(level_for(2), "trace");
        assert_eq!(level_for(9), "trace");
        assert_eq!(level_for(-1), "warn");
        assert_eq!(level_for(-5), "error");
    }
}
