//! Logging setup for Steward.
//!
//! Structured JSON or pretty logging through `tracing-subscriber`.
//!
//! # Noise Filtering
//!
//! Runtime internals (mio, tokio_util) are held at `warn` so orchestration
//! logs stay readable at `debug`.

use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Modules that are filtered to warn level by default.
pub const NOISY_MODULES: &[&str] = &["mio", "tokio_util", "want", "polling"];

/// Build the filter directive string for a base level and extra exclusions.
fn build_directives(log_level: &str, excluded_targets: &[String]) -> String {
    let mut directives = String::from(log_level);

    for module in NOISY_MODULES {
        directives.push_str(&format!(",{}=warn", module));
    }

    for target in excluded_targets {
        directives.push_str(&format!(",{}=warn", target));
    }

    directives
}

/// Initialize logging with the given configuration.
///
/// * `log_level` - Base log level (trace, debug, info, warn, error)
/// * `log_format` - "json" for structured JSON, anything else for pretty output
///
/// `RUST_LOG` takes precedence over `log_level` when set. Calling this more
/// than once is harmless; later calls are ignored.
pub fn init_logging(log_level: &str, log_format: &str) {
    init_logging_with_exclusions(log_level, log_format, &[]);
}

/// Initialize logging with custom excluded targets.
///
/// Like `init_logging`, but also demotes `excluded_targets` to `warn`.
pub fn init_logging_with_exclusions(
    log_level: &str,
    log_format: &str,
    excluded_targets: &[String],
) {
    let directives = build_directives(log_level, excluded_targets);
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&directives));

    let subscriber = tracing_subscriber::registry().with(filter);

    if log_format == "json" {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_span_events(FmtSpan::CLOSE)
            .with_current_span(true)
            .with_target(true)
            .with_file(true)
            .with_line_number(true);
        let _ = subscriber.with(fmt_layer).try_init();
    } else {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_ansi(true)
            .with_target(true)
            .with_file(false)
            .with_line_number(false);
        let _ = subscriber.with(fmt_layer).try_init();
    }

    tracing::info!(
        log_level = %log_level,
        log_format = %log_format,
        noise_filtered = NOISY_MODULES.len() + excluded_targets.len(),
        "Logging initialized"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directives_include_noisy_modules() {
        let directives = build_directives("debug", &[]);
        assert!(directives.starts_with("debug"));
        for module in NOISY_MODULES {
            assert!(directives.contains(&format!("{module}=warn")));
        }
    }

    #[test]
    fn test_directives_include_exclusions() {
        let directives = build_directives("info", &["steward_core::scheduler".to_string()]);
        assert!(directives.ends_with(",steward_core::scheduler=warn"));
    }

    #[test]
    fn test_init_twice_does_not_panic() {
        init_logging("info", "pretty");
        init_logging("debug", "json");
    }
}
