//! The seam between the dispatch substrate and game logic.
//!
//! Game client frames leave the read queue through [`GameRouter`], which
//! picks the region queue for the sending session and runs the configured
//! [`PacketHandler`] there. Handlers get a [`DispatchContext`] to reach the
//! entity queues and to send replies through the pipeline.

use crate::pipeline::{FrameRouter, Followup};
use crate::registry::DispatchRegistry;
use crate::session::ConnectionSession;
use async_trait::async_trait;
use meridian_core::{opcodes, DispatchError, EntityId, Frame, RegionKey, SessionId};
use std::sync::Arc;
use tracing::{debug, info, trace};

/// A decrypted inbound frame together with where it came from.
#[derive(Debug, Clone)]
pub struct InboundPacket {
    pub session: SessionId,
    pub entity: Option<EntityId>,
    pub region: RegionKey,
    pub frame: Frame,
}

/// Handle given to handlers for everything they may touch.
#[derive(Clone)]
pub struct DispatchContext {
    registry: Arc<DispatchRegistry>,
}

impl DispatchContext {
    pub fn new(registry: Arc<DispatchRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<DispatchRegistry> {
        &self.registry
    }

    pub fn entities(&self) -> &crate::entity::EntityQueues {
        self.registry.entities()
    }

    pub fn send(&self, session: SessionId, frame: Frame) -> Result<(), DispatchError> {
        self.registry.send(session, frame)
    }

    pub fn send_then(&self, session: SessionId, frame: Frame, followup: Followup) -> Result<(), DispatchError> {
        self.registry.send_then(session, frame, Some(followup))
    }

    pub fn send_to_entity(&self, entity: EntityId, frame: Frame) -> Result<(), DispatchError> {
        self.registry.send_to_entity(entity, frame)
    }
}

/// Game logic entry point for client traffic.
#[async_trait]
pub trait PacketHandler: Send + Sync {
    /// Runs on the worker of `packet.region`.
    async fn handle(&self, ctx: &DispatchContext, packet: InboundPacket) -> Result<(), DispatchError>;

    /// Runs on the entity's own queue after its session disconnected.
    ///
    /// The session may already be gone from the registry by then.
    async fn on_disconnect(
        &self,
        ctx: &DispatchContext,
        session: SessionId,
        entity: EntityId,
    ) -> Result<(), DispatchError> {
        debug!(%session, %entity, "Releasing entity after disconnect");
        ctx.registry().forget_entity(entity);
        ctx.entities().leave(entity);
        Ok(())
    }
}

/// Routes game client frames to region queues.
pub struct GameRouter {
    registry: Arc<DispatchRegistry>,
    handler: Arc<dyn PacketHandler>,
}

impl GameRouter {
    pub fn new(registry: Arc<DispatchRegistry>, handler: Arc<dyn PacketHandler>) -> Self {
        Self { registry, handler }
    }
}

impl FrameRouter for GameRouter {
    fn route(&self, session: &Arc<ConnectionSession>, frame: Frame) -> Result<(), DispatchError> {
        let region = self.registry.region_for_session(session);
        let type_code = frame.type_code;
        let packet = InboundPacket {
            session: session.id(),
            entity: session.entity(),
            region,
            frame,
        };
        let ctx = DispatchContext::new(self.registry.clone());
        let handler = self.handler.clone();

        match self.registry.world().dispatch(region, type_code, async move {
            handler.handle(&ctx, packet).await
        }) {
            // Already logged by the lobby filter.
            Err(DispatchError::NotAllowed { .. }) => Ok(()),
            other => other,
        }
    }

    fn on_disconnect(&self, session: &Arc<ConnectionSession>) {
        // Already behind the session's last routed frame; the region hop puts
        // it behind that frame's handler too.
        let region = self.registry.region_for_session(session);
        let cleanup = {
            let registry = self.registry.clone();
            let handler = self.handler.clone();
            let session = session.clone();
            async move {
                release_entity(&registry, handler, &session);
                Ok::<(), DispatchError>(())
            }
        };
        if let Err(e) = self.registry.world().schedule(region, cleanup) {
            debug!(session = %session.id(), %region, "Region queue unavailable for cleanup: {}", e);
            release_entity(&self.registry, self.handler.clone(), session);
        }
    }
}

/// Runs the handler's disconnect hook on the entity's queue, or drops the
/// binding inline if that queue is already gone.
fn release_entity(
    registry: &Arc<DispatchRegistry>,
    handler: Arc<dyn PacketHandler>,
    session: &Arc<ConnectionSession>,
) {
    let Some(entity) = session.entity() else {
        return;
    };
    let ctx = DispatchContext::new(registry.clone());
    let id = session.id();
    let queued = registry.entities().enqueue(entity, async move {
        handler.on_disconnect(&ctx, id, entity).await
    });
    if let Err(e) = queued {
        debug!(session = %id, %entity, "Disconnect cleanup skipped: {}", e);
        session.unbind_entity();
        registry.forget_entity(entity);
    }
}

/// Minimal handler: binds lobby connects to entities and logs everything
/// else on the sender's entity queue.
///
/// A lobby connect carries the entity id as a little-endian `u32`; the same
/// id is echoed back once the binding is in place.
#[derive(Debug, Default)]
pub struct LoggingPacketHandler;

#[async_trait]
impl PacketHandler for LoggingPacketHandler {
    async fn handle(&self, ctx: &DispatchContext, packet: InboundPacket) -> Result<(), DispatchError> {
        let Some(entity) = packet.entity else {
            if packet.frame.type_code == opcodes::LOBBY_CONNECT && packet.frame.payload.len() >= 4 {
                let raw = &packet.frame.payload[..4];
                let entity = EntityId(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]));
                // Binding fails once the session is gone; no queue is created then.
                ctx.registry().bind(packet.session, entity)?;
                ctx.entities().enter(entity);
                info!(session = %packet.session, %entity, "👋 Entity connected");
                return ctx.send(packet.session, Frame::new(opcodes::LOBBY_CONNECT, entity.0.to_le_bytes().to_vec()));
            }
            debug!(
                session = %packet.session,
                type_code = packet.frame.type_code,
                "Lobby message without entity"
            );
            return Ok(());
        };

        let type_code = packet.frame.type_code;
        let len = packet.frame.payload.len();
        let region = packet.region;
        ctx.entities().enqueue(entity, async move {
            trace!(%entity, %region, type_code, len, "Entity message");
            Ok(())
        })
    }
}
