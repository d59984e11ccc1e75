use tracing_subscriber::EnvFilter;

/// Default filter for a given `-v` count; `RUST_LOG` overrides it.
fn default_directive(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "warn,page_mirror=info",
        1 => "info,page_mirror=debug",
        _ => "debug,page_mirror=trace",
    }
}

/// Structured logging to stderr so stdout stays free for the summary.
///
/// Calling this twice is harmless; the second subscriber is ignored.
pub fn init(verbosity: u8, quiet: bool) {
    let directive = if quiet { "error" } else { default_directive(verbosity) };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
