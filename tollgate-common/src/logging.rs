//! tracing-subscriber setup shared by the daemon and the test harness.

use chrono::Utc;
use tracing::metadata::LevelFilter;
use tracing_subscriber::{
    fmt::time::FormatTime, layer::SubscriberExt, util::SubscriberInitExt, Layer,
};

struct Time;

impl FormatTime for Time {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        w.write_fmt(format_args!("{}", Utc::now().format("%Y-%m-%dT%H:%M:%S%.6fZ")))
    }
}

/// Initialise the global subscriber. `debug` is the count of `-d` flags;
/// `LOG_LEVEL` wins when set. Calling twice is harmless (the second init is
/// ignored), which keeps forked workers and tests simple.
pub fn init(debug: u8) {
    let level = if let Ok(level) = std::env::var("LOG_LEVEL") {
        match level.to_ascii_lowercase().as_str() {
            "error" => LevelFilter::ERROR,
            "warn" => LevelFilter::WARN,
            "debug" => LevelFilter::DEBUG,
            "trace" => LevelFilter::TRACE,
            _ => LevelFilter::INFO,
        }
    } else {
        match debug {
            0 => LevelFilter::INFO,
            1 => LevelFilter::DEBUG,
            _ => LevelFilter::TRACE,
        }
    };

    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_timer(Time)
                .with_target(false)
                .with_filter(level),
        )
        .try_init();
}
