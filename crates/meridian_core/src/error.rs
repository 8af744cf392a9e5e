//! Error types for the wire and queue layers.

use crate::types::{EntityId, RegionKey, SessionId};
use thiserror::Error;

/// Key exchange failures. Any of these is fatal for the connection.
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("Key exchange already completed")]
    AlreadyCompleted,

    #[error("Malformed exchange message: {0}")]
    Malformed(String),

    #[error("Unexpected message type {0:#06x} during key exchange")]
    UnexpectedMessage(u16),

    #[error("Invalid exchange: peer public key rejected")]
    InvalidExchange,

    #[error("Key exchange timed out")]
    Timeout,
}

/// Symmetric cipher failures.
#[derive(Debug, Error)]
pub enum CipherError {
    #[error("Invalid key material")]
    InvalidKey,

    #[error("Frame authentication failed")]
    Authentication,

    #[error("Sealing failed")]
    Seal,
}

/// Framing faults detected while decoding the inbound byte stream.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Declared frame length {0} is shorter than the header")]
    TooShort(usize),

    #[error("Declared frame length {length} exceeds the maximum of {max}")]
    TooLong { length: usize, max: usize },

    #[error("Frame trailer mismatch for type {type_code:#06x}")]
    TrailerMismatch { type_code: u16 },

    #[error("Payload of {0} bytes does not fit in a frame")]
    PayloadTooLarge(usize),
}

/// Failures while submitting or running queued work.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Queue '{0}' is closed")]
    QueueClosed(String),

    #[error("Unknown entity {0}")]
    UnknownEntity(EntityId),

    #[error("Unknown session {0}")]
    UnknownSession(SessionId),

    #[error("Message type {type_code:#06x} not allowed in {region}")]
    NotAllowed { region: RegionKey, type_code: u16 },

    #[error("Handler failed: {0}")]
    Handler(String),

    #[error("Transport failure: {0}")]
    Transport(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
