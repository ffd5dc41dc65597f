//! Log setup for the custody daemon
//!
//! File output always goes through a non-blocking rolling appender. Operators
//! watching a console get a human-readable stdout layer; JSON mode is file-only
//! so log shippers see one record per line.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::RollingFileAppender;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::config::AppConfig;

/// Chatty dependencies capped at warn unless `RUST_LOG` says otherwise
const QUIET_TARGETS: &[&str] = &["hyper", "hyper_util", "reqwest", "rustls", "sqlx"];

fn rolling_appender(config: &AppConfig) -> RollingFileAppender {
    let (dir, file) = (&config.log_dir, &config.log_file);
    match config.rotation.as_str() {
        "hourly" => tracing_appender::rolling::hourly(dir, file),
        "daily" => tracing_appender::rolling::daily(dir, file),
        _ => tracing_appender::rolling::never(dir, file),
    }
}

fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let directives = QUIET_TARGETS
            .iter()
            .fold(level.to_string(), |acc, t| format!("{acc},{t}=warn"));
        EnvFilter::new(directives)
    })
}

/// Install the global subscriber. Keep the guard alive for the process
/// lifetime or buffered lines are lost on exit.
pub fn init_logging(config: &AppConfig) -> WorkerGuard {
    let (writer, guard) = tracing_appender::non_blocking(rolling_appender(config));
    let registry = tracing_subscriber::registry().with(env_filter(&config.log_level));

    if config.use_json {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_target(true)
                    .with_writer(writer)
                    .with_ansi(false),
            )
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_writer(writer)
                    .with_ansi(false),
            )
            .with(fmt::layer().compact().with_target(false))
            .init();
    }

    guard
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quiet_targets_appended_to_level() {
        // SAFETY: single-threaded test touching only RUST_LOG
        unsafe { std::env::remove_var("RUST_LOG") };
        let filter = env_filter("debug").to_string();
        assert!(filter.contains("debug"));
        assert!(filter.contains("sqlx=warn"));
        assert!(filter.contains("reqwest=warn"));
    }
}
