use thiserror::Error;

/// Unified error taxonomy for every fallible boundary in the cache.
///
/// Each reactor-facing variant maps to exactly one wire response, written
/// out at each call site in `reactor.rs`; no variant is allowed to unwind a
/// panic across a connection boundary.
#[derive(Error, Debug)]
pub enum VecsError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error")]
    Protocol,

    #[error("wrong number of arguments for '{command}'")]
    WrongArity { command: String },

    #[error("unknown command '{name}'")]
    UnknownCommand { name: String },

    #[error("vector embedding failed")]
    EmbeddingFailed,

    #[error("job queue full")]
    QueueFull,

    #[error("allocation failed")]
    Alloc,

    #[error("config error: {detail}")]
    Config { detail: String },

    #[error("snapshot corrupt: {detail}")]
    SnapshotCorrupt { detail: String },

    #[error("l2 cache full")]
    L2Full,
}

pub type Result<T> = std::result::Result<T, VecsError>;
