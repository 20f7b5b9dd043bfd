use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info";

fn filter_from_env() -> EnvFilter {
    EnvFilter::try_from_env("COMMSYNC_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Structured logs go to stderr so `--json` output on stdout stays clean.
/// `verbose` raises the crate's own level to debug.
pub fn init(verbose: bool) {
    let mut filter = filter_from_env();
    if verbose {
        if let Ok(directive) = "commsync=debug".parse() {
            filter = filter.add_directive(directive);
        }
    }
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
