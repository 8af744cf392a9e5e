//! Process-wide dispatch state.
//!
//! The registry is the one object every listener, router and handler shares.
//! It holds the live session table, which entity each session controls and
//! which region each entity stands in, together with the dispatch layers:
//! region queues, entity queues, the global control queue and the packet
//! pipeline used for replies.

use crate::entity::EntityQueues;
use crate::pipeline::{Followup, PacketPipeline};
use crate::session::{ConnectionSession, DisconnectReason};
use crate::world::WorldDispatch;
use dashmap::DashMap;
use meridian_core::{
    join_all_within, DispatchError, EntityId, Frame, QueueWorker, RegionKey, SerialQueue,
    SessionId,
};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub struct DispatchRegistry {
    sessions: DashMap<SessionId, Arc<ConnectionSession>>,
    entity_sessions: DashMap<EntityId, SessionId>,
    entity_regions: DashMap<EntityId, RegionKey>,
    entities: EntityQueues,
    world: WorldDispatch,
    pipeline: Arc<PacketPipeline>,
    global: SerialQueue,
    global_worker: Mutex<Option<QueueWorker>>,
    maintenance_deadline: Mutex<Option<Instant>>,
    shutdown_requested: watch::Sender<bool>,
}

impl DispatchRegistry {
    /// Builds the registry around a running pipeline. Spawns the global
    /// queue and the lobby region queue.
    pub fn new(pipeline: Arc<PacketPipeline>, lobby_allow: impl IntoIterator<Item = u16>) -> Self {
        let (global, global_worker) = SerialQueue::spawn("global");
        let (shutdown_requested, _) = watch::channel(false);
        Self {
            sessions: DashMap::new(),
            entity_sessions: DashMap::new(),
            entity_regions: DashMap::new(),
            entities: EntityQueues::new(),
            world: WorldDispatch::new(lobby_allow),
            pipeline,
            global,
            global_worker: Mutex::new(Some(global_worker)),
            maintenance_deadline: Mutex::new(None),
            shutdown_requested,
        }
    }

    pub fn pipeline(&self) -> &Arc<PacketPipeline> {
        &self.pipeline
    }

    pub fn world(&self) -> &WorldDispatch {
        &self.world
    }

    pub fn entities(&self) -> &EntityQueues {
        &self.entities
    }

    // ------------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------------

    pub fn register_session(&self, session: Arc<ConnectionSession>) {
        self.sessions.insert(session.id(), session);
    }

    pub fn remove_session(&self, id: SessionId) -> Option<Arc<ConnectionSession>> {
        self.sessions.remove(&id).map(|(_, session)| session)
    }

    pub fn session(&self, id: SessionId) -> Option<Arc<ConnectionSession>> {
        self.sessions.get(&id).map(|s| s.clone())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn sessions(&self) -> Vec<Arc<ConnectionSession>> {
        self.sessions.iter().map(|s| s.value().clone()).collect()
    }

    /// Closes a session; its listener task runs the disconnect cleanup.
    pub fn kick(&self, id: SessionId, reason: impl Into<String>) -> Result<(), DispatchError> {
        let session = self.session(id).ok_or(DispatchError::UnknownSession(id))?;
        session.close(DisconnectReason::Kicked(reason.into()));
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Entity bindings
    // ------------------------------------------------------------------------

    /// Binds a session to the entity it controls. The entity starts in the
    /// lobby until [`set_region`](Self::set_region) moves it.
    pub fn bind(&self, session: SessionId, entity: EntityId) -> Result<(), DispatchError> {
        let handle = self.session(session).ok_or(DispatchError::UnknownSession(session))?;
        if let Some(previous) = handle.bind_entity(entity) {
            if previous != entity {
                self.entity_sessions.remove(&previous);
            }
        }
        if let Some(old) = self.entity_sessions.insert(entity, session) {
            if old != session {
                warn!(%entity, "Entity rebound from session {} to {}", old, session);
            }
        }
        self.entity_regions.entry(entity).or_insert(RegionKey::NONE);
        debug!(%session, %entity, "Session bound");
        Ok(())
    }

    pub fn unbind(&self, session: SessionId) -> Option<EntityId> {
        let entity = self.session(session)?.unbind_entity()?;
        self.entity_sessions.remove_if(&entity, |_, bound| *bound == session);
        Some(entity)
    }

    pub fn bound_entity(&self, session: SessionId) -> Option<EntityId> {
        self.session(session)?.entity()
    }

    pub fn session_of(&self, entity: EntityId) -> Option<Arc<ConnectionSession>> {
        let id = *self.entity_sessions.get(&entity)?;
        self.session(id)
    }

    pub fn set_region(&self, entity: EntityId, region: RegionKey) {
        self.entity_regions.insert(entity, region);
    }

    /// Region the entity stands in; [`RegionKey::NONE`] if unknown.
    pub fn region_of(&self, entity: EntityId) -> RegionKey {
        self.entity_regions
            .get(&entity)
            .map_or(RegionKey::NONE, |r| *r)
    }

    /// Region whose queue handles this session's traffic.
    pub fn region_for_session(&self, session: &ConnectionSession) -> RegionKey {
        session.entity().map_or(RegionKey::NONE, |e| self.region_of(e))
    }

    /// Drops everything known about an entity except its queue.
    pub fn forget_entity(&self, entity: EntityId) {
        self.entity_regions.remove(&entity);
        self.entity_sessions.remove(&entity);
    }

    // ------------------------------------------------------------------------
    // Outbound traffic
    // ------------------------------------------------------------------------

    pub fn send(&self, session: SessionId, frame: Frame) -> Result<(), DispatchError> {
        self.send_then(session, frame, None)
    }

    pub fn send_then(
        &self,
        session: SessionId,
        frame: Frame,
        followup: Option<Followup>,
    ) -> Result<(), DispatchError> {
        let handle = self.session(session).ok_or(DispatchError::UnknownSession(session))?;
        self.pipeline.enqueue_write(&handle, frame, followup)
    }

    /// Sends to the session controlling `entity`, if any.
    pub fn send_to_entity(&self, entity: EntityId, frame: Frame) -> Result<(), DispatchError> {
        let handle = self.session_of(entity).ok_or(DispatchError::UnknownEntity(entity))?;
        self.pipeline.enqueue_write(&handle, frame, None)
    }

    // ------------------------------------------------------------------------
    // Global queue and process state
    // ------------------------------------------------------------------------

    /// Runs `work` on the process-wide serial queue.
    pub fn run_global<F>(&self, work: F) -> Result<(), DispatchError>
    where
        F: Future<Output = Result<(), DispatchError>> + Send + 'static,
    {
        self.global.run(work)
    }

    pub fn begin_maintenance(&self, countdown: Duration) {
        warn!("🛠️ Maintenance in {:?}", countdown);
        *self.maintenance_deadline.lock() = Some(Instant::now() + countdown);
    }

    /// Time left before maintenance, if a countdown is running.
    pub fn maintenance_remaining(&self) -> Option<Duration> {
        self.maintenance_deadline
            .lock()
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Asks whoever owns the process to shut it down.
    pub fn request_shutdown(&self) {
        if !self.shutdown_requested.send_replace(true) {
            info!("🛑 Shutdown requested");
        }
    }

    pub fn is_shutdown_requested(&self) -> bool {
        *self.shutdown_requested.borrow()
    }

    /// Resolves once [`request_shutdown`](Self::request_shutdown) was called.
    pub async fn shutdown_requested(&self) {
        let mut rx = self.shutdown_requested.subscribe();
        let _ = rx.wait_for(|requested| *requested).await;
    }

    /// Closes the world, entity and global queues and waits for them under a
    /// single `grace` deadline. Returns how many queues were still busy.
    pub async fn drain(&self, grace: Duration) -> usize {
        let deadline = Instant::now() + grace;
        let remaining = || deadline.saturating_duration_since(Instant::now());

        let mut busy = self.world.shutdown(remaining()).await;
        busy += self.entities.shutdown(remaining()).await;

        self.global.close();
        let worker = self.global_worker.lock().take();
        if let Some(worker) = worker {
            busy += join_all_within(vec![worker], remaining()).await;
        }
        busy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{SessionStage, SessionTimeouts};
    use meridian_core::{opcodes, FrameCodec, LinkKind, PartitionId};

    fn registry() -> DispatchRegistry {
        DispatchRegistry::new(Arc::new(PacketPipeline::start(1)), opcodes::DEFAULT_LOBBY_ALLOW)
    }

    fn session() -> Arc<ConnectionSession> {
        let (io, _) = tokio::io::duplex(1024);
        let session = ConnectionSession::new(
            LinkKind::GameClient,
            "127.0.0.1:7000".parse().unwrap(),
            PartitionId(0),
            FrameCodec::with_trailer(1024),
            io,
            SessionTimeouts::default(),
        );
        session.transition(SessionStage::Exchanging).unwrap();
        Arc::new(session)
    }

    #[tokio::test]
    async fn test_bind_and_region_lookup() {
        let registry = registry();
        let s = session();
        registry.register_session(s.clone());
        assert_eq!(registry.region_for_session(&s), RegionKey::NONE);

        registry.bind(s.id(), EntityId(10)).unwrap();
        assert_eq!(registry.bound_entity(s.id()), Some(EntityId(10)));
        assert_eq!(registry.session_of(EntityId(10)).unwrap().id(), s.id());
        assert_eq!(registry.region_for_session(&s), RegionKey::NONE);

        registry.set_region(EntityId(10), RegionKey(1002));
        assert_eq!(registry.region_for_session(&s), RegionKey(1002));

        assert_eq!(registry.unbind(s.id()), Some(EntityId(10)));
        assert!(registry.session_of(EntityId(10)).is_none());
        assert_eq!(registry.region_for_session(&s), RegionKey::NONE);
    }

    #[tokio::test]
    async fn test_unknown_targets() {
        let registry = registry();
        let ghost = SessionId::new();
        assert!(matches!(
            registry.bind(ghost, EntityId(1)),
            Err(DispatchError::UnknownSession(_))
        ));
        assert!(matches!(
            registry.send_to_entity(EntityId(1), Frame::empty(1)),
            Err(DispatchError::UnknownEntity(_))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_request_and_maintenance() {
        let registry = Arc::new(registry());
        assert!(!registry.is_shutdown_requested());
        let waiter = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.shutdown_requested().await })
        };
        registry.request_shutdown();
        waiter.await.unwrap();
        assert!(registry.is_shutdown_requested());

        registry.begin_maintenance(Duration::from_secs(60));
        let left = registry.maintenance_remaining().unwrap();
        assert!(left <= Duration::from_secs(60) && left > Duration::from_secs(50));

        assert_eq!(registry.drain(Duration::from_secs(1)).await, 0);
    }
}
