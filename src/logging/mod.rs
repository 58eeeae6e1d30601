use crate::stats::StatsSnapshot;
use anyhow::Result;
use log::debug;
use std::sync::{Once, OnceLock};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

static INIT: Once = Once::new();

// Keeps the non-blocking file writer flushing for the life of the process
static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Initialize the global logger from a configured level, optionally writing
/// to a daily rolling file under `log_dir` instead of stdout.
///
/// Only the first call has any effect. The subscriber also installs the
/// `log` bridge, so `log` records land in the same output.
pub fn init_logger_with_config(log_level: &str, enable_file_logging: bool, log_dir: &str) {
    INIT.call_once(|| {
        let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));

        if enable_file_logging {
            let appender = tracing_appender::rolling::daily(log_dir, "upstream-pool.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let _ = FILE_GUARD.set(guard);

            FmtSubscriber::builder()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_target(false)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(false)
                .init();
        } else {
            FmtSubscriber::builder()
                .with_env_filter(filter)
                .with_target(false)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .with_level(true)
                .with_ansi(true)
                .init();
        }
    });
}

/// Log a pool stats snapshot as JSON at debug level
pub fn log_stats_snapshot(snapshot: &StatsSnapshot) -> Result<()> {
    let message = serde_json::to_string(snapshot)?;
    debug!("STATS {}", message);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::UpstreamStats;

    #[test]
    fn test_init_logger_is_idempotent() {
        init_logger_with_config("debug", false, "logs");
        init_logger_with_config("trace", true, "logs");
        debug!("logger initialized");
        assert!(FILE_GUARD.get().is_none());
    }

    #[test]
    fn test_log_stats_snapshot() {
        let stats = UpstreamStats::new();
        assert!(log_stats_snapshot(&stats.snapshot("cluster")).is_ok());
    }
}
