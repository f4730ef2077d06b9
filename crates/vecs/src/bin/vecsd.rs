//! Entry point: load config, wire up the reactor, run until a shutdown
//! signal arrives.

use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{error, info};
use vecs::{Config, HashingEmbedder, Reactor};

/// Dimension of the built-in reference embedder. A real model wired in
/// through the `Embedder` trait would report its own.
const DEFAULT_EMBEDDING_DIM: usize = 128;

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn request_shutdown(_signum: libc::c_int) {
    SHUTDOWN.store(true, Ordering::Relaxed);
}

/// Installs a bare `SIGINT`/`SIGTERM` handler that only flips an atomic
/// flag. No `signal-hook`: the reactor already polls with a 1-second
/// timeout, so a plain flag checked each iteration is enough and keeps the
/// dependency list to what the cache itself needs.
fn install_shutdown_handler() {
    let handler = request_shutdown as extern "C" fn(libc::c_int) as libc::sighandler_t;
    unsafe {
        libc::signal(libc::SIGINT, handler);
        libc::signal(libc::SIGTERM, handler);
    }
}

fn main() -> ExitCode {
    vecs::logging::init();

    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    install_shutdown_handler();

    let embedder = Arc::new(HashingEmbedder::new(DEFAULT_EMBEDDING_DIM));
    let mut reactor = match Reactor::new(config, embedder) {
        Ok(r) => r,
        Err(e) => {
            error!(error = %e, "failed to start reactor");
            return ExitCode::FAILURE;
        }
    };

    let result = reactor.run_until_shutdown(&SHUTDOWN);
    reactor.shutdown();

    match result {
        Ok(()) => {
            info!("clean shutdown");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "reactor exited with error");
            ExitCode::FAILURE
        }
    }
}
