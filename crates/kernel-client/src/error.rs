//! Error type shared by every kernel-client operation.

use std::time::Duration;

/// Errors produced while talking to a Jupyter server.
///
/// Exceptions raised by *user code* are not errors: they come back as
/// [`ExceptionRecord`](crate::ExceptionRecord)s inside a successful result.
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    /// The server could not be reached, or refused to create/delete a kernel.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The channels handshake was rejected, or a required payload field was
    /// missing or mis-typed.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Sending on an established channel failed, or the channel went away
    /// while a request was in flight.
    #[error("Transport error: {0}")]
    Transport(String),

    /// An operation referenced an execution id that is not present.
    #[error("Execution {0} not found")]
    NotFound(i64),

    /// The kernel did not report idle within the configured limit.
    #[error("Kernel did not finish executing within {0:?}")]
    Timeout(Duration),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T, E = KernelError> = std::result::Result<T, E>;
