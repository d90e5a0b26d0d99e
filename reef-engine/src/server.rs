//! Server/network layer seam consumed by the connection registry.

use reef_common::error::EngineResult;
use reef_common::ids::Cookie;

/// Callbacks into the server layer that owns connection cookies.
///
/// The registry never calls these while holding its own tables lock; callbacks are serialized
/// under a dedicated release lock to avoid re-entrancy deadlocks with the network layer.
pub trait ServerGateway: Send + Sync {
    /// Signals the server layer that I/O on one cookie can resume, carrying the outcome.
    fn notify_io_complete(&self, cookie: Cookie, status: EngineResult<()>);

    /// Drops the server layer's reservation on one cookie, allowing it to free the connection.
    fn release_reference(&self, cookie: Cookie);
}
