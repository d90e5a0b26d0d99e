//! Shared error model for cross-crate APIs.

use thiserror::Error;

/// Unified result type used by all public interfaces in `reef`.
pub type EngineResult<T> = Result<T, EngineError>;

/// Engine error taxonomy shared by the DCP core and its collaborator seams.
///
/// `Success` has no variant; fallible entry points return `Ok(_)` instead. Every variant maps
/// onto one status the wire layer can relay to a peer.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum EngineError {
    /// The keyed resource already exists (for example a duplicate passive stream).
    #[error("key already exists")]
    KeyExists,

    /// The requested operation variant is not implemented by this engine.
    #[error("operation is not supported: {0}")]
    NotSupported(&'static str),

    /// Peer-specific connection state is missing; the peer must disconnect and retry.
    #[error("connection state is missing, peer must disconnect")]
    Disconnect,

    /// Transient resource exhaustion; the caller should retry later.
    #[error("temporary failure, retry later")]
    TempFail,

    /// The addressed vbucket is not owned by this node.
    #[error("vbucket is not owned by this node")]
    NotMyVbucket,

    /// A request argument is malformed or semantically invalid.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// A seqno lies outside the window the request permits.
    #[error("seqno window violation: {0}")]
    OutOfRange(&'static str),

    /// Runtime state does not allow this operation.
    #[error("invalid runtime state: {0}")]
    InvalidState(&'static str),
}
