//! Logging setup (ambient stack, §4.7): a `tracing-subscriber` console layer driven by
//! `RUST_LOG`, defaulting to `info`. No file or OpenTelemetry layers; this binary has no
//! use for them.

use tracing_subscriber::{fmt, EnvFilter};

pub fn init(default_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    fmt().with_target(true).with_env_filter(filter).init();
}
