use thiserror::Error;

/// Errors surfaced by the consensus core.
///
/// Wire-level outcomes (stale terms, failed consistency checks) are not
/// errors; they are answered through the protocol itself. This enum covers
/// what a caller or the startup path can observe.
#[derive(Error, Debug)]
pub enum RaftError {
    #[error("not the leader")]
    NotLeader,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("corruption: {0}")]
    Corruption(String),

    #[error("node is stopped")]
    Stopped,
}

pub type Result<T> = std::result::Result<T, RaftError>;
