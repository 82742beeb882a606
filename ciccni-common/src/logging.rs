//! Logging setup for the ciccni agent.
//!
//! Structured `tracing` logging with two flavors:
//! - console output with local-time timestamps for interactive use
//! - JSON output for log aggregation when the agent runs as a DaemonSet

use anyhow::Result;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan, time::ChronoLocal},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

// ============================================================================
// Initialization Functions
// ============================================================================

/// Initialize logging with console output.
///
/// The level argument is the default filter; the `RUST_LOG` environment
/// variable takes precedence when set.
///
/// # Example
/// ```
/// ciccni_common::init_logging("info").unwrap();
/// ```
pub fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter).with(
        fmt::layer()
            .with_ansi(true)
            .with_target(true)
            .with_timer(ChronoLocal::new("%Y-%m-%d %H:%M:%S%.3f".to_string()))
            .with_span_events(FmtSpan::CLOSE),
    );

    subscriber.init();

    tracing::info!("═══════════════════════════════════════════════");
    tracing::info!(" CICCNI AGENT STARTING");
    tracing::info!(" Log Level: {}", level);
    tracing::info!("═══════════════════════════════════════════════");

    Ok(())
}

/// Initialize logging with JSON output format.
/// Suitable for production environments with log aggregation
/// (ELK, Grafana Loki, ...).
pub fn init_logging_json(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter).with(
        fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .with_target(true),
    );

    subscriber.init();

    Ok(())
}

// ============================================================================
// Timed Operation Helper
// ============================================================================

/// A helper struct that logs operation duration when finished.
pub struct TimedOperation {
    operation: String,
    start: std::time::Instant,
}

impl TimedOperation {
    pub fn new(operation: impl Into<String>) -> Self {
        let operation = operation.into();
        tracing::debug!(operation = %operation, "Starting");
        Self {
            operation,
            start: std::time::Instant::now(),
        }
    }

    pub fn success(self) {
        let ms = self.start.elapsed().as_millis();
        tracing::info!(
            component = "perf",
            operation = %self.operation,
            duration_ms = %ms,
            "{} completed in {}ms",
            self.operation,
            ms
        );
        std::mem::forget(self); // Don't run Drop
    }

    pub fn failure(self, error: &str) {
        let ms = self.start.elapsed().as_millis();
        tracing::error!(
            component = "perf",
            operation = %self.operation,
            duration_ms = %ms,
            error = error,
            "{} failed after {}ms: {}",
            self.operation,
            ms,
            error
        );
        std::mem::forget(self); // Don't run Drop
    }
}

impl Drop for TimedOperation {
    fn drop(&mut self) {
        let ms = self.start.elapsed().as_millis();
        tracing::warn!(
            component = "perf",
            operation = %self.operation,
            duration_ms = %ms,
            "{} ended without explicit success/failure after {}ms",
            self.operation,
            ms
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timed_operation_success_consumes_the_timer() {
        let timer = TimedOperation::new("test op");
        timer.success();
    }

    #[test]
    fn timed_operation_failure_consumes_the_timer() {
        let timer = TimedOperation::new("test op");
        timer.failure("simulated");
    }

    #[test]
    fn dropped_timer_logs_without_panicking() {
        let _timer = TimedOperation::new("abandoned op");
    }
}
