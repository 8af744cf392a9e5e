//! Error types for the server runtime.

use crate::session::SessionStage;
use meridian_core::{CipherError, DispatchError, ExchangeError, FrameError};
use thiserror::Error;

/// Errors raised while building or running a [`crate::WorldServer`].
#[derive(Debug, Error)]
pub enum ServerError {
    /// Network-related error (bind, listen, accept)
    #[error("Network error: {0}")]
    Network(String),

    /// Invalid server configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal server error (queue closed, invalid state, etc.)
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Errors that end (or refuse to change) a single connection session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Invalid session transition from {from:?} to {to:?}")]
    InvalidTransition { from: SessionStage, to: SessionStage },

    #[error("Key exchange failed: {0}")]
    Exchange(#[from] ExchangeError),

    #[error("Cipher failure: {0}")]
    Cipher(#[from] CipherError),

    #[error("Protocol fault: {0}")]
    Frame(#[from] FrameError),

    #[error("Dispatch failure: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Transport error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Receive timeout in stage {0:?}")]
    Timeout(SessionStage),

    #[error("Session is closed")]
    Closed,
}

impl SessionError {
    /// Protocol faults get logged with the offending bytes.
    pub fn is_protocol_fault(&self) -> bool {
        matches!(
            self,
            SessionError::Frame(_)
                | SessionError::Exchange(_)
                | SessionError::Cipher(_)
                | SessionError::InvalidTransition { .. }
        )
    }
}
