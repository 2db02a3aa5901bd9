//! Internal errors of the buffer manager.
use thiserror::Error;

/// Cooperative control-flow errors for optimistic operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Optimistic validation failed or a page fault was scheduled, the stack
    /// must unwind to a safe state and the operation must be retried from its
    /// entry point.
    #[error("optimistic validation failed")]
    Unwind,
}

pub type Result<T> = std::result::Result<T, Error>;

/// Environment failures. These are fatal to the buffer manager, there is no
/// retry path out of them.
#[derive(Error, Debug)]
pub enum BufMgrError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("os error: {0}")]
    Os(#[from] nix::Error),
    #[error("invalid option: {0}")]
    InvalidConfig(&'static str),
}
