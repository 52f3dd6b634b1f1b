//! Structured logging bootstrap.
//!
//! Bunyan-formatted JSON on stdout, driven by `RUST_LOG`/`--log-level`,
//! the same stack the test harness wires up via `ctor` in `tests/mod.rs`.

use tracing_bunyan_formatter::{BunyanFormattingLayer, JsonStorageLayer};
use tracing_log::LogTracer;
use tracing_subscriber::{layer::SubscriberExt, registry::Registry, EnvFilter};

/// Initializes the global tracing subscriber. `default_level` is used
/// only when `RUST_LOG` is unset.
pub fn init(default_level: &str) {
    LogTracer::init().expect("unable to install log tracer");
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let app_name = concat!(env!("CARGO_PKG_NAME"), "-", env!("CARGO_PKG_VERSION")).to_string();
    let formatting_layer = BunyanFormattingLayer::new(app_name, std::io::stdout);
    let subscriber = Registry::default()
        .with(env_filter)
        .with(JsonStorageLayer)
        .with(formatting_layer);
    tracing::subscriber::set_global_default(subscriber).expect("unable to set global subscriber");
}
