//! Stable, stack-wide error kinds.
//!
//! Every protocol crate in this workspace returns [`Error`] (or a `Result<T, Error>`) instead of
//! a crate-local error type. Datapath failures (bad checksum, malformed header, unknown
//! protocol) are *not* represented here — those are dropped silently and counted per the
//! propagation policy, never surfaced as a `Result::Err` to a caller.

/// Error kinds, matching the values named in the error handling design.
///
/// Variants are intentionally flat (no nested data beyond what's needed to act on the error) so
/// that callers can match on kind without reaching into protocol internals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("out of memory")]
    OutOfMemory,
    #[error("buffer error")]
    Buffer,
    #[error("operation timed out")]
    Timeout,
    #[error("no route to host")]
    Routing,
    #[error("address or port already in use")]
    InUse,
    #[error("already connected")]
    AlreadyConnected,
    #[error("not connected")]
    NotConnected,
    #[error("connection aborted")]
    ConnectionAborted,
    #[error("connection reset by peer")]
    ConnectionReset,
    #[error("connection closed")]
    ConnectionClosed,
    #[error("illegal argument")]
    IllegalArgument,
    #[error("illegal operation for current state")]
    IllegalOperation,
    #[error("operation would block")]
    WouldBlock,
    #[error("interface error")]
    InterfaceError,
}

pub type Result<T> = core::result::Result<T, Error>;
