use once_cell::sync::OnceCell;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

static INIT: OnceCell<()> = OnceCell::new();

const DEFAULT_JSON_LOG_FILE: &str = "counsel-stream.logs.jsonl";

fn parse_bool_env(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" | "enabled" => Some(true),
        "0" | "false" | "no" | "off" | "disabled" => Some(false),
        _ => None,
    }
}

fn observability_enabled() -> bool {
    match std::env::var("COUNSEL_STREAM_OBSERVABILITY_ENABLED") {
        Ok(value) => parse_bool_env(&value).unwrap_or(true),
        Err(_) => true,
    }
}

/// Level for everything outside this crate (reqwest, hyper, rustls).
const DEPENDENCY_LEVEL: &str = "warn";
const DEFAULT_CRATE_LEVEL: &str = "info";

/// Turns `COUNSEL_STREAM_LOG_LEVEL` into a filter directive.
///
/// A bare level (`debug`) applies to this crate only and keeps the HTTP stack
/// at `warn`; anything with a target or a comma is taken verbatim.
fn filter_directive(level: &str) -> String {
    let level = level.trim();
    if level.contains('=') || level.contains(',') {
        level.to_string()
    } else {
        format!("{DEPENDENCY_LEVEL},counsel_stream={level}")
    }
}

fn resolve_env_filter() -> tracing_subscriber::EnvFilter {
    if let Ok(level) = std::env::var("COUNSEL_STREAM_LOG_LEVEL")
        && let Ok(filter) = tracing_subscriber::EnvFilter::try_new(filter_directive(&level))
    {
        return filter;
    }
    tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(filter_directive(DEFAULT_CRATE_LEVEL))
    })
}

/// Installs the global tracing subscriber once per process.
///
/// Environment variables:
/// - `COUNSEL_STREAM_OBSERVABILITY_ENABLED`: optional enable/disable flag (default enabled).
/// - `COUNSEL_STREAM_LOG_LEVEL`: crate log level (`debug`) or a full filter
///   (`counsel_stream=trace,reqwest=debug`). Default `warn,counsel_stream=info`.
/// - `COUNSEL_STREAM_JSON_LOG_PATH`: optional log file path. If set, logs are JSONL in that file;
///   otherwise they go to stderr in compact form so stdout stays free for rendered text.
/// - `RUST_LOG`: fallback filter.
///
/// Every session event carries a `telemetry_id` field for correlating with server logs.
pub fn init_observability() {
    INIT.get_or_init(|| {
        if !observability_enabled() {
            return;
        }

        let env_filter = resolve_env_filter();
        if let Ok(path_raw) = std::env::var("COUNSEL_STREAM_JSON_LOG_PATH") {
            let path = std::path::PathBuf::from(path_raw);
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                let _ = std::fs::create_dir_all(parent);
            }
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| std::path::Path::new("."));
            let file_name = path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or(DEFAULT_JSON_LOG_FILE);
            let writer = tracing_appender::rolling::never(dir, file_name);
            let json_layer = tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(true)
                .with_target(true)
                .with_writer(writer);
            let _ = tracing_subscriber::registry()
                .with(env_filter)
                .with(json_layer)
                .try_init();
        } else {
            let console_layer = tracing_subscriber::fmt::layer()
                .compact()
                .with_target(false)
                .with_writer(std::io::stderr);
            let _ = tracing_subscriber::registry()
                .with(env_filter)
                .with(console_layer)
                .try_init();
        }
        tracing::debug!(version = env!("CARGO_PKG_VERSION"), "counsel-stream logging ready");
    });
}
