// Error types for the session engine.
//
// Only configuration-time and bind-time failures surface as `NetError`.
// Runtime network faults (accept/read/write failures, peer shutdown) never
// reach callers; they are logged and turned into lifecycle events by
// `listener.rs` and `session.rs`. Handler failures are isolated per request
// by `router.rs` and travel as `HandlerError`.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Errors returned by engine operations.
#[derive(Error, Debug)]
pub enum NetError {
    #[error("{0} is already being listened on")]
    AlreadyBound(SocketAddr),

    #[error("listener is already running on {0}")]
    ListenerActive(SocketAddr),

    #[error("service {0:?} is already registered")]
    DuplicateService(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Error a service handler may return. Logged by the router, never propagated.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;
