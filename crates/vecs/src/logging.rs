//! `tracing` initialization. Library code never calls `println!`/
//! `eprintln!`; only this module (invoked from `main`) and tests configure
//! a subscriber.

use tracing_subscriber::EnvFilter;

/// Installs a `fmt` subscriber filtered by `RUST_LOG` (default `info`).
/// Call once, from `main`, before constructing anything else.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
