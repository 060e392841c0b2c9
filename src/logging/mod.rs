/// Install the global tracing subscriber for embedding hosts that do not
/// bring their own. Honors `RUST_LOG`; defaults the crate to `info`.
pub fn init() {
    init_with_directive("mnemo=info");
}

/// Like [`init`], with an explicit default directive (e.g. `mnemo=debug`
/// in diagnostics mode).
pub fn init_with_directive(directive: &str) {
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(directive.parse().unwrap_or_else(|_| "info".parse().unwrap()));

    // try_init: the host may already have installed a subscriber.
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
