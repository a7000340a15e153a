//! Logging bootstrap.
//!
//! Stdout is always on. The rolling file sink is optional: an empty
//! `log_dir` runs stdout-only (containerized deployments ship stdout to
//! the collector anyway). Unless RUST_LOG overrides it, the default
//! filter quiets the chatty transport crates under the router — sqlx
//! statement logs, hyper/reqwest connection churn, tungstenite frame
//! noise — so the signal left at `info` is the pipeline itself: webhook
//! dispatch, order lifecycle, reconciler loops.

use crate::config::LoggingConfig;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Keeps the non-blocking file writer alive; dropping it flushes and
/// stops the background thread.
pub struct LogGuard {
    _file: Option<WorkerGuard>,
}

fn router_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "{level},sqlx=warn,hyper=warn,hyper_util=warn,reqwest=warn,\
             tungstenite=warn,tokio_tungstenite=warn,rustls=warn"
        ))
    })
}

pub fn init_logging(config: &LoggingConfig) -> LogGuard {
    let base = tracing_subscriber::registry()
        .with(router_filter(&config.log_level))
        .with(fmt::layer().with_target(false).with_ansi(true));

    if config.log_dir.is_empty() {
        base.init();
        return LogGuard { _file: None };
    }

    let appender = match config.rotation.as_str() {
        "hourly" => tracing_appender::rolling::hourly(&config.log_dir, &config.log_file),
        "never" => tracing_appender::rolling::never(&config.log_dir, &config.log_file),
        _ => tracing_appender::rolling::daily(&config.log_dir, &config.log_file),
    };
    let (writer, guard) = tracing_appender::non_blocking(appender);

    if config.use_json {
        // JSON files keep targets so the order/reconcile subsystems can
        // be queried apart downstream.
        base.with(
            fmt::layer()
                .json()
                .with_target(true)
                .with_writer(writer)
                .with_ansi(false),
        )
        .init();
    } else {
        base.with(fmt::layer().with_target(false).with_writer(writer).with_ansi(false))
            .init();
    }

    LogGuard { _file: Some(guard) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_quiets_transport_crates() {
        // Only meaningful when RUST_LOG is unset in the test env; the
        // directives must at least parse.
        let filter = EnvFilter::new(
            "info,sqlx=warn,hyper=warn,hyper_util=warn,reqwest=warn,\
             tungstenite=warn,tokio_tungstenite=warn,rustls=warn",
        );
        assert!(filter.to_string().contains("sqlx=warn"));
        assert!(filter.to_string().contains("tokio_tungstenite=warn"));
    }
}
