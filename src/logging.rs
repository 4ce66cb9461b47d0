//! Tracing subscriber setup.
//!
//! Log events go to stderr so stdout stays clean for command output
//! (`deck research ... > report.md`). The filter comes from `DECK_LOG`, then
//! `RUST_LOG`, then the level implied by `--verbose` / `--quiet`.

use tracing_subscriber::EnvFilter;

pub fn init(quiet: bool, verbose: bool) -> anyhow::Result<()> {
    let level = if quiet {
        "error"
    } else if verbose {
        "debug"
    } else {
        "info"
    };

    let filter = EnvFilter::try_from_env("DECK_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|error| anyhow::anyhow!("failed to initialize tracing subscriber: {error}"))?;

    Ok(())
}
