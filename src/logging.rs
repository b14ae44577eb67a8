//! Tracing/logging initialization.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Initialize tracing-subscriber for the process.
///
/// The filter comes from the verbosity flags (`-v` -> debug, `-vv` ->
/// trace) or, at zero verbosity, from `EVMPROXY_LOG` (default `info`).
/// `EVMPROXY_LOG_FORMAT` selects `text` (default) or `json` output.
pub fn init_tracing(verbosity: u8) {
    let log_level_str = match verbosity {
        0 => std::env::var("EVMPROXY_LOG").unwrap_or_else(|_| "info".to_string()),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    };

    let env_filter = EnvFilter::try_new(&log_level_str)
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let log_format = std::env::var("EVMPROXY_LOG_FORMAT")
        .map_or_else(|_| "text".to_string(), |format| format.to_lowercase());
    if log_format != "json" && log_format != "text" {
        // Tracing is not yet initialized; eprintln! is the only output
        // channel available.
        eprintln!(
            "Warning: Unrecognized EVMPROXY_LOG_FORMAT '{log_format}'. Valid values: 'json', 'text'. Using 'text'."
        );
    }

    if log_format == "json" {
        let json_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_span_list(false)
            .with_target(true)
            .with_writer(std::io::stderr);
        let _ = tracing_subscriber::registry()
            .with(env_filter)
            .with(json_layer)
            .try_init();
    } else {
        let text_layer = tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_writer(std::io::stderr);
        let _ = tracing_subscriber::registry()
            .with(env_filter)
            .with(text_layer)
            .try_init();
    }
}
