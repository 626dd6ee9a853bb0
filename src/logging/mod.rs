use std::env;
use tracing_subscriber::{fmt, EnvFilter};

/// Builds the filter directive; a non-empty `RUST_LOG` wins over the configured level
pub fn filter_directive(level: &str, rust_log: Option<&str>) -> String {
    rust_log
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| {
            format!(
                "laundry_repair={level},migrations={level},sea_orm_migration={level},sqlx=warn",
                level = level
            )
        })
}

/// Initializes the tracing subscriber
///
/// Safe to call more than once; later calls are ignored.
pub fn init_tracing(level: &str, json: bool) {
    let rust_log = env::var("RUST_LOG").ok();
    let directive = filter_directive(level, rust_log.as_deref());
    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new("info"));

    if json {
        let _ = fmt().with_env_filter(filter).json().try_init();
    } else {
        let _ = fmt().with_env_filter(filter).with_target(false).try_init();
    }
}
