// src/logging.rs
//! Structured logging setup, extracted from the teacher's inline `main.rs`
//! subscriber wiring. The TUI/file/JSON layering the teacher built for its
//! terminal UI is dropped — this crate has no UI — leaving the plain
//! stderr `fmt` layer the teacher also used for its own non-TUI CLI path.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

/// Initializes the global tracing subscriber from `RUST_LOG` if set,
/// falling back to `default_level` (typically the configured or CLI log
/// level).
pub fn init(default_level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let console_layer = fmt::layer().with_writer(std::io::stderr).with_target(true).with_line_number(true);

    Registry::default().with(env_filter).with(console_layer).init();
}
