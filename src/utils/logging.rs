use tracing_subscriber::EnvFilter;

use crate::core::config::LoggingConfig;

pub const DEFAULT_FILTER: &str = "video_segment_downloader=info";

fn filter_for(level: Option<&str>) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| match level {
        Some(level) => format!("video_segment_downloader={level}").into(),
        None => DEFAULT_FILTER.into(),
    })
}

/// Install the fmt subscriber. `RUST_LOG` wins over the default filter;
/// calling this again is a no-op.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter_for(None))
        .try_init();
}

pub fn init_tracing_with(config: &LoggingConfig) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter_for(Some(&config.log_level)))
        .with_target(false)
        .try_init();
}
