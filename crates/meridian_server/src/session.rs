//! Per-connection state.
//!
//! A [`ConnectionSession`] is created by the listener when a connection is
//! accepted and walks a one-way lifecycle:
//!
//! ```text
//! Accepting -> Exchanging -> Receiving -> Disconnected
//!      \____________\_____________\________^
//! ```
//!
//! Every stage except `Disconnected` is entered at most once; entering
//! `Disconnected` again is a no-op. The read path (listener task and read
//! queue) and the write path (write queue) touch disjoint halves of the
//! session, so neither blocks the other.

use crate::error::SessionError;
use bytes::Bytes;
use meridian_core::{
    opcodes, EntityId, ExchangeError, ExchangeOffer, ExchangeReply, Frame, FrameCipher,
    FrameCodec, FrameError, KeyExchange, LinkKind, PartitionId, SessionId,
};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tracing::{debug, trace};

/// Lifecycle stage of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionStage {
    Accepting,
    Exchanging,
    Receiving,
    Disconnected,
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The peer closed the connection
    PeerClosed,
    /// Read or write failure on the socket
    Transport(String),
    /// Malformed frame, failed exchange or other protocol violation
    Protocol(String),
    /// No exchange reply within the bootstrap timeout
    BootstrapTimeout,
    /// Nothing received within the idle timeout
    IdleTimeout,
    /// Closed on request (kick, ban, follow-up close)
    Kicked(String),
    /// The server is shutting down
    Shutdown,
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DisconnectReason::PeerClosed => write!(f, "peer closed"),
            DisconnectReason::Transport(e) => write!(f, "transport error: {e}"),
            DisconnectReason::Protocol(e) => write!(f, "protocol fault: {e}"),
            DisconnectReason::BootstrapTimeout => write!(f, "bootstrap timeout"),
            DisconnectReason::IdleTimeout => write!(f, "idle timeout"),
            DisconnectReason::Kicked(why) => write!(f, "kicked: {why}"),
            DisconnectReason::Shutdown => write!(f, "server shutdown"),
        }
    }
}

/// Receive timeouts applied before and after the key exchange.
#[derive(Debug, Clone, Copy)]
pub struct SessionTimeouts {
    pub bootstrap: Duration,
    pub idle: Duration,
}

impl Default for SessionTimeouts {
    fn default() -> Self {
        Self {
            bootstrap: Duration::from_secs(10),
            idle: Duration::from_secs(300),
        }
    }
}

type Writer = Box<dyn AsyncWrite + Send + Unpin>;

/// State of one accepted transport connection.
pub struct ConnectionSession {
    id: SessionId,
    kind: LinkKind,
    remote_addr: SocketAddr,
    partition: PartitionId,
    codec: FrameCodec,
    timeouts: SessionTimeouts,
    created_at: Instant,

    stage: Mutex<SessionStage>,
    exchange: Mutex<Option<KeyExchange>>,
    inbound: Mutex<Option<FrameCipher>>,
    outbound: Mutex<Option<FrameCipher>>,
    writer: tokio::sync::Mutex<Option<Writer>>,
    entity: Mutex<Option<EntityId>>,
    disconnect_reason: Mutex<Option<DisconnectReason>>,
    closed: watch::Sender<bool>,
}

impl std::fmt::Debug for ConnectionSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionSession")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("remote_addr", &self.remote_addr)
            .field("partition", &self.partition)
            .field("stage", &self.stage())
            .field("entity", &self.entity())
            .finish()
    }
}

impl ConnectionSession {
    pub fn new<W>(
        kind: LinkKind,
        remote_addr: SocketAddr,
        partition: PartitionId,
        codec: FrameCodec,
        writer: W,
        timeouts: SessionTimeouts,
    ) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (closed, _) = watch::channel(false);
        Self {
            id: SessionId::new(),
            kind,
            remote_addr,
            partition,
            codec,
            timeouts,
            created_at: Instant::now(),
            stage: Mutex::new(SessionStage::Accepting),
            exchange: Mutex::new(None),
            inbound: Mutex::new(None),
            outbound: Mutex::new(None),
            writer: tokio::sync::Mutex::new(Some(Box::new(writer))),
            entity: Mutex::new(None),
            disconnect_reason: Mutex::new(None),
            closed,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn kind(&self) -> LinkKind {
        self.kind
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    pub fn codec(&self) -> &FrameCodec {
        &self.codec
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn stage(&self) -> SessionStage {
        *self.stage.lock()
    }

    pub fn is_established(&self) -> bool {
        self.stage() == SessionStage::Receiving
    }

    pub fn is_closed(&self) -> bool {
        self.stage() == SessionStage::Disconnected
    }

    /// Receive timeout for the current stage: short until the exchange
    /// completes, long afterwards.
    pub fn receive_timeout(&self) -> Duration {
        match self.stage() {
            SessionStage::Receiving => self.timeouts.idle,
            _ => self.timeouts.bootstrap,
        }
    }

    /// Moves to `to`, returning the stage left behind.
    ///
    /// Illegal transitions fail and leave the stage untouched.
    pub fn transition(&self, to: SessionStage) -> Result<SessionStage, SessionError> {
        use SessionStage::*;

        let mut stage = self.stage.lock();
        let from = *stage;
        let legal = matches!(
            (from, to),
            (Accepting, Exchanging) | (Exchanging, Receiving) | (_, Disconnected)
        );
        if !legal {
            return Err(SessionError::InvalidTransition { from, to });
        }
        *stage = to;
        trace!(session = %self.id, "Session stage {:?} -> {:?}", from, to);
        Ok(from)
    }

    // ------------------------------------------------------------------------
    // Key exchange
    // ------------------------------------------------------------------------

    /// Generates the server offer. Only valid while `Exchanging`.
    pub fn begin_exchange(&self) -> Result<ExchangeOffer, SessionError> {
        let stage = self.stage();
        if stage != SessionStage::Exchanging {
            return Err(SessionError::InvalidTransition { from: stage, to: SessionStage::Exchanging });
        }

        let mut slot = self.exchange.lock();
        if slot.is_some() {
            return Err(ExchangeError::UnexpectedMessage(opcodes::EXCHANGE_OFFER).into());
        }
        let (exchange, offer) = KeyExchange::begin_exchange(self.kind.ships_ivs())?;
        *slot = Some(exchange);
        Ok(offer)
    }

    /// Completes the exchange, installs both cipher halves and moves the
    /// session to `Receiving`.
    ///
    /// On a session that is already `Receiving` this fails without touching
    /// the installed ciphers.
    pub fn complete_exchange(&self, reply: &ExchangeReply) -> Result<(), SessionError> {
        let stage = self.stage();
        if stage != SessionStage::Exchanging {
            return Err(SessionError::InvalidTransition { from: stage, to: SessionStage::Receiving });
        }

        let mut exchange = self
            .exchange
            .lock()
            .take()
            .ok_or(ExchangeError::UnexpectedMessage(opcodes::EXCHANGE_REPLY))?;
        let keys = exchange.complete_exchange(reply)?;
        let (inbound, outbound) = FrameCipher::pair(self.kind.cipher_tier(), &keys)?;

        *self.inbound.lock() = Some(inbound);
        *self.outbound.lock() = Some(outbound);
        self.transition(SessionStage::Receiving)?;
        debug!(session = %self.id, kind = %self.kind, "Key exchange completed");
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Frame I/O
    // ------------------------------------------------------------------------

    /// Decrypts an inbound frame. Frames must be opened in wire order.
    pub fn open(&self, frame: Frame) -> Result<Frame, SessionError> {
        let mut guard = self.inbound.lock();
        let Some(cipher) = guard.as_mut() else {
            return Ok(frame);
        };
        let mut payload = frame.payload.to_vec();
        cipher.open(frame.type_code, &mut payload)?;
        Ok(Frame::new(frame.type_code, payload))
    }

    /// Encrypts and frames `frame`. A payload that would not fit once sealed
    /// is refused before the cipher counter moves.
    fn seal(&self, frame: &Frame) -> Result<Bytes, SessionError> {
        let mut guard = self.outbound.lock();
        let wire = match guard.as_mut() {
            Some(cipher) => {
                let sealed_len = frame.payload.len() + cipher.overhead();
                if sealed_len > self.codec.max_payload() {
                    return Err(FrameError::PayloadTooLarge(sealed_len).into());
                }
                let mut payload = frame.payload.to_vec();
                cipher.seal(frame.type_code, &mut payload)?;
                self.codec.to_bytes(&Frame::new(frame.type_code, payload))?
            }
            None => self.codec.to_bytes(frame)?,
        };
        Ok(wire)
    }

    /// Encrypts and writes one frame to the socket.
    ///
    /// Sealing happens under the writer lock so cipher counters follow the
    /// byte order on the wire.
    ///
    /// # Returns
    ///
    /// `Closed` after [`shutdown_writer`](Self::shutdown_writer),
    /// `Frame(PayloadTooLarge)` if the sealed frame would exceed the frame
    /// limit (nothing is written and the session stays usable), or the
    /// socket error.
    pub async fn write_frame(&self, frame: &Frame) -> Result<(), SessionError> {
        let mut writer = self.writer.lock().await;
        let sink = writer.as_mut().ok_or(SessionError::Closed)?;
        let wire = self.seal(frame)?;
        sink.write_all(&wire).await?;
        sink.flush().await?;
        Ok(())
    }

    /// Flushes and closes the write side. Later writes fail with `Closed`.
    pub async fn shutdown_writer(&self) {
        let mut writer = self.writer.lock().await;
        if let Some(mut sink) = writer.take() {
            if let Err(e) = sink.shutdown().await {
                trace!(session = %self.id, "Writer shutdown error: {}", e);
            }
        }
    }

    // ------------------------------------------------------------------------
    // Entity binding and close
    // ------------------------------------------------------------------------

    pub fn entity(&self) -> Option<EntityId> {
        *self.entity.lock()
    }

    /// Binds an entity, returning the one previously bound.
    pub fn bind_entity(&self, entity: EntityId) -> Option<EntityId> {
        self.entity.lock().replace(entity)
    }

    pub fn unbind_entity(&self) -> Option<EntityId> {
        self.entity.lock().take()
    }

    /// Marks the session disconnected and wakes its reader.
    ///
    /// Returns `false` if it was already disconnected; the first reason wins.
    pub fn close(&self, reason: DisconnectReason) -> bool {
        match self.transition(SessionStage::Disconnected) {
            Ok(SessionStage::Disconnected) | Err(_) => false,
            Ok(_) => {
                debug!(session = %self.id, %reason, "Session closing");
                *self.disconnect_reason.lock() = Some(reason);
                self.closed.send_replace(true);
                true
            }
        }
    }

    pub fn disconnect_reason(&self) -> Option<DisconnectReason> {
        self.disconnect_reason.lock().clone()
    }

    /// Resolves once [`close`](Self::close) has been called.
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}
