//! Inter-server links.
//!
//! Login, AI and admin processes talk to the world process over the same
//! listener/pipeline substrate as game clients, but their frames carry JSON
//! [`ControlMessage`]s. [`ControlRouter`] checks what each link kind may ask
//! for and serializes the work: entity-targeted messages on the entity's
//! queue, everything else on the global queue.
//!
//! [`LinkClient`] is the dialing side, used by peer processes and tests.

use crate::error::SessionError;
use crate::handler::DispatchContext;
use crate::pipeline::FrameRouter;
use crate::registry::DispatchRegistry;
use crate::session::{ConnectionSession, DisconnectReason, SessionStage};
use async_trait::async_trait;
use bytes::BytesMut;
use meridian_core::{
    hex_preview, opcodes, ControlMessage, ControlScope, DispatchError, EntityAction, ExchangeError,
    ExchangeOffer, Frame, FrameCipher, FrameCodec, KeyExchange, LinkKind, RegionKey,
    DEFAULT_MAX_FRAME,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Domain logic for control messages.
#[async_trait]
pub trait ControlHandler: Send + Sync {
    async fn handle(
        &self,
        ctx: &DispatchContext,
        origin: LinkKind,
        message: ControlMessage,
    ) -> Result<(), DispatchError>;
}

/// Whether a link kind may send a given control message.
///
/// Admin panels may do anything. Login servers manage roles and sanctions,
/// AI servers drive NPCs. Game clients never speak control messages.
pub fn is_permitted(origin: LinkKind, message: &ControlMessage) -> bool {
    use ControlMessage as M;

    match origin {
        LinkKind::AdminPanel => true,
        LinkKind::LoginLink => matches!(
            message,
            M::RoleLogin { .. } | M::RoleLogout { .. } | M::Ban { .. } | M::Kick { .. } | M::Maintenance { .. }
        ),
        LinkKind::AiLink => matches!(
            message,
            M::EntityAction { .. }
                | M::SpawnNpc { .. }
                | M::DespawnNpc { .. }
                | M::StatusAttach { .. }
                | M::StatusDetach { .. }
        ),
        LinkKind::GameClient => false,
    }
}

/// Decodes control frames and schedules them on the right queue.
pub struct ControlRouter {
    registry: Arc<DispatchRegistry>,
    handler: Arc<dyn ControlHandler>,
}

impl ControlRouter {
    pub fn new(registry: Arc<DispatchRegistry>, handler: Arc<dyn ControlHandler>) -> Self {
        Self { registry, handler }
    }

    /// Schedules an already decoded message as if it arrived from `origin`.
    pub fn submit(&self, origin: LinkKind, message: ControlMessage) -> Result<(), DispatchError> {
        if !is_permitted(origin, &message) {
            warn!(%origin, kind = message.kind(), "Control message not permitted on this link");
            return Ok(());
        }

        let ctx = DispatchContext::new(self.registry.clone());
        let handler = self.handler.clone();
        debug!(%origin, kind = message.kind(), "Scheduling control message");

        match message.scope() {
            ControlScope::Entity(entity) => {
                let queued = self.registry.entities().enqueue(entity, async move {
                    handler.handle(&ctx, origin, message).await
                });
                match queued {
                    Err(DispatchError::UnknownEntity(entity)) => {
                        warn!(%origin, %entity, "Control message for unknown entity dropped");
                        Ok(())
                    }
                    other => other,
                }
            }
            ControlScope::Spawn(entity) => self.registry.run_global(async move {
                ctx.entities().enter(entity);
                let inner = ctx.clone();
                ctx.entities().enqueue(entity, async move {
                    handler.handle(&inner, origin, message).await
                })
            }),
            ControlScope::Global => self.registry.run_global(async move {
                handler.handle(&ctx, origin, message).await
            }),
        }
    }
}

impl FrameRouter for ControlRouter {
    fn route(&self, session: &Arc<ConnectionSession>, frame: Frame) -> Result<(), DispatchError> {
        if frame.type_code != opcodes::CONTROL {
            warn!(
                session = %session.id(),
                type_code = frame.type_code,
                bytes = %hex_preview(&frame.payload, 64),
                "Protocol fault: unexpected frame type on control link"
            );
            session.close(DisconnectReason::Protocol(format!(
                "unexpected frame type {:#06x}",
                frame.type_code
            )));
            return Ok(());
        }

        let message = match ControlMessage::from_frame(&frame) {
            Ok(message) => message,
            Err(e) => {
                warn!(
                    session = %session.id(),
                    bytes = %hex_preview(&frame.payload, 64),
                    "Protocol fault: undecodable control message: {}", e
                );
                session.close(DisconnectReason::Protocol(e.to_string()));
                return Ok(());
            }
        };

        self.submit(session.kind(), message)
    }
}

/// Default control handler: applies the bookkeeping the substrate itself
/// owns (regions, sessions, shutdown, maintenance) and logs the rest.
#[derive(Debug, Default)]
pub struct LoggingControlHandler;

#[async_trait]
impl ControlHandler for LoggingControlHandler {
    async fn handle(
        &self,
        ctx: &DispatchContext,
        origin: LinkKind,
        message: ControlMessage,
    ) -> Result<(), DispatchError> {
        let registry = ctx.registry();
        match message {
            ControlMessage::EntityAction { entity, action } => match action {
                EntityAction::FlyMap { region, x, y } => {
                    registry.world().load_region(region);
                    registry.set_region(entity, region);
                    debug!(%entity, %region, x, y, "Entity moved to region");
                }
                EntityAction::LeaveMap => registry.set_region(entity, RegionKey::NONE),
                EntityAction::RemoteShutdown => {
                    if let Some(session) = registry.session_of(entity) {
                        session.close(DisconnectReason::Kicked(format!("remote shutdown by {origin}")));
                    }
                }
                other => debug!(%entity, action = ?other, "Entity action"),
            },
            ControlMessage::SpawnNpc { entity, region, template } => {
                registry.world().load_region(region);
                registry.set_region(entity, region);
                info!(%entity, %region, template, "NPC spawned");
            }
            ControlMessage::DespawnNpc { entity } => {
                registry.forget_entity(entity);
                ctx.entities().leave(entity);
                info!(%entity, "NPC despawned");
            }
            ControlMessage::RoleLogin { entity, .. } => {
                info!(%entity, %origin, "Role login handed over");
            }
            ControlMessage::RoleLogout { entity } => {
                if let Some(session) = registry.session_of(entity) {
                    session.close(DisconnectReason::Kicked("logout".to_string()));
                }
                registry.forget_entity(entity);
                ctx.entities().leave(entity);
                info!(%entity, "Role logged out");
            }
            ControlMessage::StatusAttach { entity, flag } => debug!(%entity, ?flag, "Status attached"),
            ControlMessage::StatusDetach { entity, flag } => debug!(%entity, ?flag, "Status detached"),
            ControlMessage::Ban { entity, reason } => {
                if let Some(session) = registry.session_of(entity) {
                    session.close(DisconnectReason::Kicked(format!("banned: {reason}")));
                }
                warn!(%entity, %reason, "Entity banned");
            }
            ControlMessage::Kick { entity } => {
                if let Some(session) = registry.session_of(entity) {
                    session.close(DisconnectReason::Kicked(format!("kicked by {origin}")));
                }
            }
            ControlMessage::Maintenance { countdown_secs } => {
                registry.begin_maintenance(Duration::from_secs(countdown_secs.into()));
            }
            ControlMessage::Shutdown => registry.request_shutdown(),
        }
        Ok(())
    }
}

// ============================================================================
// Dialing side
// ============================================================================

/// Client end of a link: dials a listener, completes the exchange and then
/// sends and receives frames with the negotiated cipher.
pub struct LinkClient {
    kind: LinkKind,
    stream: TcpStream,
    codec: FrameCodec,
    buf: BytesMut,
    inbound: FrameCipher,
    outbound: FrameCipher,
}

impl std::fmt::Debug for LinkClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkClient").field("kind", &self.kind).finish()
    }
}

impl LinkClient {
    /// Connects with the default frame limit and a 10 second handshake bound.
    pub async fn connect(addr: SocketAddr, kind: LinkKind) -> Result<Self, SessionError> {
        Self::connect_with(addr, kind, DEFAULT_MAX_FRAME, Duration::from_secs(10)).await
    }

    pub async fn connect_with(
        addr: SocketAddr,
        kind: LinkKind,
        max_frame: usize,
        handshake_timeout: Duration,
    ) -> Result<Self, SessionError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let codec = if kind.uses_trailer() {
            FrameCodec::with_trailer(max_frame)
        } else {
            FrameCodec::new(None, max_frame)
        };

        let mut client = Self {
            kind,
            stream,
            codec,
            buf: BytesMut::with_capacity(4096),
            inbound: FrameCipher::Plain,
            outbound: FrameCipher::Plain,
        };

        if kind.requires_handshake() {
            tokio::time::timeout(handshake_timeout, client.handshake())
                .await
                .map_err(|_| SessionError::Timeout(SessionStage::Exchanging))??;
        }
        debug!(%kind, %addr, "Link established");
        Ok(client)
    }

    async fn handshake(&mut self) -> Result<(), SessionError> {
        let frame = self.read_raw().await?.ok_or(SessionError::Closed)?;
        if frame.type_code != opcodes::EXCHANGE_OFFER {
            return Err(ExchangeError::UnexpectedMessage(frame.type_code).into());
        }
        let offer = ExchangeOffer::decode(&frame.payload)?;
        let (reply, keys) = KeyExchange::respond(&offer)?;
        self.send_raw(&Frame::new(opcodes::EXCHANGE_REPLY, reply.encode())).await?;

        let (inbound, outbound) = FrameCipher::pair(self.kind.cipher_tier(), &keys)?;
        self.inbound = inbound;
        self.outbound = outbound;
        Ok(())
    }

    pub fn kind(&self) -> LinkKind {
        self.kind
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.stream.local_addr()
    }

    /// Writes a frame without encrypting it.
    pub async fn send_raw(&mut self, frame: &Frame) -> Result<(), SessionError> {
        let wire = self.codec.to_bytes(frame)?;
        self.stream.write_all(&wire).await?;
        Ok(())
    }

    /// Encrypts and writes a frame.
    pub async fn send_frame(&mut self, frame: &Frame) -> Result<(), SessionError> {
        let mut payload = frame.payload.to_vec();
        self.outbound.seal(frame.type_code, &mut payload)?;
        self.send_raw(&Frame::new(frame.type_code, payload)).await
    }

    pub async fn send(&mut self, message: &ControlMessage) -> Result<(), SessionError> {
        let frame = message.to_frame()?;
        self.send_frame(&frame).await
    }

    async fn read_raw(&mut self) -> Result<Option<Frame>, SessionError> {
        loop {
            if let Some(frame) = self.codec.try_extract(&mut self.buf)? {
                return Ok(Some(frame));
            }
            if self.stream.read_buf(&mut self.buf).await? == 0 {
                return Ok(None);
            }
        }
    }

    /// Reads and decrypts the next frame. `None` once the server hung up.
    pub async fn recv_frame(&mut self) -> Result<Option<Frame>, SessionError> {
        let Some(frame) = self.read_raw().await? else {
            return Ok(None);
        };
        let mut payload = frame.payload.to_vec();
        self.inbound.open(frame.type_code, &mut payload)?;
        Ok(Some(Frame::new(frame.type_code, payload)))
    }

    pub async fn recv_timeout(&mut self, wait: Duration) -> Result<Option<Frame>, SessionError> {
        tokio::time::timeout(wait, self.recv_frame())
            .await
            .map_err(|_| SessionError::Timeout(SessionStage::Receiving))?
    }

    pub async fn close(mut self) -> Result<(), SessionError> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_core::{EntityId, StatusFlag};

    #[test]
    fn test_trust_levels() {
        let kick = ControlMessage::Kick { entity: EntityId(1) };
        let spawn = ControlMessage::SpawnNpc { entity: EntityId(2), region: RegionKey(1), template: 9 };
        let status = ControlMessage::StatusAttach { entity: EntityId(2), flag: StatusFlag::Frozen };

        assert!(is_permitted(LinkKind::AdminPanel, &ControlMessage::Shutdown));
        assert!(!is_permitted(LinkKind::AiLink, &ControlMessage::Shutdown));
        assert!(!is_permitted(LinkKind::LoginLink, &ControlMessage::Shutdown));
        assert!(is_permitted(LinkKind::LoginLink, &kick));
        assert!(!is_permitted(LinkKind::AiLink, &kick));
        assert!(is_permitted(LinkKind::AiLink, &spawn));
        assert!(is_permitted(LinkKind::AiLink, &status));
        assert!(!is_permitted(LinkKind::GameClient, &status));
    }
}
