//! Log pipeline
//!
//! Two sinks: ANSI text on stdout for a human watching the sale, and a
//! rolling file behind a non-blocking writer, so a slow disk never stalls
//! a reserve call mid-flight. JSON file output is one switch away for
//! ingestion.
//!
//! The default filter quiets the per-query chatter of the storage and
//! HTTP-client crates. During a flash sale the hot path would otherwise
//! drown the lines that matter: reservations, expiries, saga transitions,
//! outbox rows going FAILED.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::RollingFileAppender;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::config::AppConfig;

fn filter_directives(level: &str) -> String {
    format!("{level},sqlx=warn,hyper=warn,reqwest=warn")
}

/// RUST_LOG wins when set; otherwise the configured level with the noisy
/// infrastructure crates pinned down to warnings.
fn default_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter_directives(level)))
}

fn file_appender(config: &AppConfig) -> RollingFileAppender {
    match config.rotation.as_str() {
        "hourly" => tracing_appender::rolling::hourly(&config.log_dir, &config.log_file),
        "never" => tracing_appender::rolling::never(&config.log_dir, &config.log_file),
        _ => tracing_appender::rolling::daily(&config.log_dir, &config.log_file),
    }
}

/// Install the global subscriber. The returned guard owns the background
/// file writer; drop it only at process exit or buffered lines are lost.
pub fn init_logging(config: &AppConfig) -> WorkerGuard {
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender(config));

    let stdout_layer = fmt::layer().compact().with_target(false);
    let registry = tracing_subscriber::registry()
        .with(default_filter(&config.log_level))
        .with(stdout_layer);

    if config.use_json {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_writer(file_writer)
                    .with_ansi(false),
            )
            .init();
    } else {
        registry
            .with(fmt::layer().with_writer(file_writer).with_ansi(false))
            .init();
    }

    guard
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_quiets_storage_crates() {
        let directives = filter_directives("debug");
        assert!(directives.starts_with("debug,"));
        assert!(directives.contains("sqlx=warn"));
        EnvFilter::new(directives); // must parse
    }
}
