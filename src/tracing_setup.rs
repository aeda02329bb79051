//! Logging setup: an `EnvFilter`-driven `tracing-subscriber` registry,
//! pretty/compact output to stderr by default, switching to single-line
//! JSON when the caller asks for machine-readable logs (e.g. a CI system
//! consuming kiln's own output).
//!
//! Installing a global subscriber twice is not an error here — a test binary
//! or an embedding application may have already installed one, and kiln
//! should keep working, just without its own formatting.

pub fn init(json: bool) {
    use tracing_subscriber::prelude::*;

    let env_filter = tracing_subscriber::EnvFilter::try_from_env("KILN_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    // `tracing_error::ErrorLayer` lets `color-eyre` attach the active span
    // trace to a report, not just the error's `Display` chain.
    let error_layer = tracing_error::ErrorLayer::default();

    let result = if json {
        let json_layer = tracing_subscriber::fmt::layer().json().with_target(true).with_writer(std::io::stderr);
        tracing_subscriber::registry().with(env_filter).with(error_layer).with(json_layer).try_init()
    } else {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
            .with_ansi(console::Term::stderr().features().colors_supported())
            .compact();
        tracing_subscriber::registry().with(env_filter).with(error_layer).with(fmt_layer).try_init()
    };

    if result.is_err() {
        // A subscriber is already installed (e.g. by an embedding test harness); continue with it.
    }
}
