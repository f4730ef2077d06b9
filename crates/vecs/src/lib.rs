//! Semantic cache proxy core: protocol parsing, the two-tier cache, the
//! worker pool, and the reactor that wires them together. `src/bin/vecsd.rs`
//! is the thin executable shell over this library.

pub mod buffer;
pub mod cache;
pub mod config;
pub mod connection;
pub mod embed;
pub mod error;
pub mod logging;
pub mod normalize;
pub mod protocol;
pub mod reactor;
pub mod snapshot;
pub mod worker_pool;

pub use config::Config;
pub use embed::{Embedder, HashingEmbedder};
pub use error::{Result, VecsError};
pub use reactor::Reactor;
