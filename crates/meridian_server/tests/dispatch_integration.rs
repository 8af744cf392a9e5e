//! End-to-end tests over loopback TCP.
//!
//! Each test starts its own world server on ephemeral ports and drives it
//! with [`LinkClient`]s, the same way game clients and peer servers do.

use async_trait::async_trait;
use meridian_core::{
    opcodes, ControlMessage, DispatchError, EntityAction, EntityId, ExchangeReply, Frame,
    KeyExchange, LinkKind, RegionKey,
};
use meridian_server::{
    ControlHandler, DispatchContext, InboundPacket, LinkClient, LoggingControlHandler,
    LoggingPacketHandler, PacketHandler, ServerConfig, WorldServer,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::Barrier;
use tokio::time::{timeout, Duration};

const REGION_PING: u16 = 0x07d0;
const POISON: u8 = 0xff;
const SLOW: u8 = 0xfe;

/// Tracks overlap and order of the work it is handed.
#[derive(Default)]
struct Tracker {
    in_flight: AtomicUsize,
    max_seen: AtomicUsize,
    done: AtomicUsize,
    connects: AtomicUsize,
    seen: Mutex<Vec<(u32, u16)>>,
}

impl Tracker {
    async fn exclusive(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_seen.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(2)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.done.fetch_add(1, Ordering::SeqCst);
    }

    fn record(&self, entity: u32, value: u16) {
        self.seen.lock().push((entity, value));
    }

    fn seen(&self) -> Vec<(u32, u16)> {
        self.seen.lock().clone()
    }
}

struct RecordingPacketHandler {
    tracker: Arc<Tracker>,
    barrier: Arc<Barrier>,
}

#[async_trait]
impl PacketHandler for RecordingPacketHandler {
    async fn handle(&self, ctx: &DispatchContext, packet: InboundPacket) -> Result<(), DispatchError> {
        match (packet.entity, packet.frame.type_code) {
            (None, opcodes::LOBBY_REGISTER) => {
                let marker = packet.frame.payload.first().copied().unwrap_or_default();
                if marker == POISON {
                    panic!("poisoned packet");
                }
                if marker == SLOW {
                    tokio::time::sleep(Duration::from_millis(300)).await;
                }
                self.tracker.record(0, marker.into());
                Ok(())
            }
            (Some(entity), REGION_PING) => {
                self.barrier.wait().await;
                self.tracker.record(entity.0, packet.region.0 as u16);
                Ok(())
            }
            (Some(entity), _) => {
                let tracker = self.tracker.clone();
                ctx.entities().enqueue(entity, async move {
                    tracker.exclusive().await;
                    Ok(())
                })
            }
            (None, opcodes::LOBBY_CONNECT) => {
                let result = LoggingPacketHandler.handle(ctx, packet).await;
                self.tracker.connects.fetch_add(1, Ordering::SeqCst);
                result
            }
            (None, _) => LoggingPacketHandler.handle(ctx, packet).await,
        }
    }
}

struct RecordingControlHandler {
    tracker: Arc<Tracker>,
}

#[async_trait]
impl ControlHandler for RecordingControlHandler {
    async fn handle(
        &self,
        ctx: &DispatchContext,
        origin: LinkKind,
        message: ControlMessage,
    ) -> Result<(), DispatchError> {
        match message {
            ControlMessage::EntityAction {
                entity,
                action: EntityAction::Walk { x, .. },
            } => {
                self.tracker.exclusive().await;
                self.tracker.record(entity.0, x);
                Ok(())
            }
            other => LoggingControlHandler.handle(ctx, origin, other).await,
        }
    }
}

fn test_config() -> ServerConfig {
    let any = "127.0.0.1:0".parse().unwrap();
    ServerConfig {
        partitions: 2,
        shutdown_grace: Duration::from_secs(2),
        ..ServerConfig::default()
    }
    .with_listener(LinkKind::GameClient, any)
    .with_listener(LinkKind::AdminPanel, any)
    .with_listener(LinkKind::AiLink, any)
}

async fn start_recording(config: ServerConfig) -> (WorldServer, Arc<Tracker>) {
    let tracker = Arc::new(Tracker::default());
    let server = WorldServer::new(
        config,
        Arc::new(RecordingPacketHandler {
            tracker: tracker.clone(),
            barrier: Arc::new(Barrier::new(2)),
        }),
        Arc::new(RecordingControlHandler { tracker: tracker.clone() }),
    );
    server.start().await.expect("Failed to start server");
    (server, tracker)
}

async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let reached = timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "Timed out waiting for {what}");
}

async fn connect(server: &WorldServer, kind: LinkKind) -> LinkClient {
    let addr = server.local_addr(kind).expect("listener not bound");
    LinkClient::connect(addr, kind).await.expect("Failed to connect")
}

/// Connects a game client and binds it to `entity`.
async fn login(server: &WorldServer, entity: u32) -> LinkClient {
    let mut client = connect(server, LinkKind::GameClient).await;
    client
        .send_frame(&Frame::new(opcodes::LOBBY_CONNECT, entity.to_le_bytes().to_vec()))
        .await
        .unwrap();
    let echo = client
        .recv_timeout(Duration::from_secs(5))
        .await
        .unwrap()
        .expect("connection closed before lobby echo");
    assert_eq!(echo.type_code, opcodes::LOBBY_CONNECT);
    assert_eq!(&echo.payload[..], &entity.to_le_bytes()[..]);
    client
}

fn walk(entity: u32, x: u16) -> ControlMessage {
    ControlMessage::EntityAction {
        entity: EntityId(entity),
        action: EntityAction::Walk { x, y: 0 },
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_frames_from_one_connection_stay_in_order() {
    let (server, tracker) = start_recording(test_config()).await;
    let mut client = connect(&server, LinkKind::GameClient).await;

    for marker in 0..50u8 {
        client
            .send_frame(&Frame::new(opcodes::LOBBY_REGISTER, vec![marker]))
            .await
            .unwrap();
    }

    wait_until("50 lobby frames", || tracker.seen().len() == 50).await;
    let markers: Vec<u16> = tracker.seen().into_iter().map(|(_, m)| m).collect();
    assert_eq!(markers, (0..50).collect::<Vec<u16>>());

    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_entity_work_never_overlaps_across_links() {
    let (server, tracker) = start_recording(test_config()).await;
    let mut client = login(&server, 5).await;
    let mut admin = connect(&server, LinkKind::AdminPanel).await;

    let from_client = async {
        for i in 0..20u8 {
            client
                .send_frame(&Frame::new(opcodes::LOBBY_REGISTER, vec![i]))
                .await
                .unwrap();
        }
    };
    let from_admin = async {
        for x in 0..20u16 {
            admin.send(&walk(5, x)).await.unwrap();
        }
    };
    tokio::join!(from_client, from_admin);

    wait_until("40 entity operations", || tracker.done.load(Ordering::SeqCst) == 40).await;
    assert_eq!(tracker.max_seen.load(Ordering::SeqCst), 1);

    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_regions_run_concurrently() {
    let (server, tracker) = start_recording(test_config()).await;
    let registry = server.registry().clone();
    let mut a = login(&server, 1).await;
    let mut b = login(&server, 2).await;
    let mut admin = connect(&server, LinkKind::AdminPanel).await;

    for (entity, region) in [(1, 10), (2, 20)] {
        admin
            .send(&ControlMessage::EntityAction {
                entity: EntityId(entity),
                action: EntityAction::FlyMap { region: RegionKey(region), x: 0, y: 0 },
            })
            .await
            .unwrap();
    }
    wait_until("both entities placed", || {
        registry.region_of(EntityId(1)) == RegionKey(10)
            && registry.region_of(EntityId(2)) == RegionKey(20)
    })
    .await;
    assert_eq!(registry.world().loaded_regions(), vec![RegionKey(10), RegionKey(20)]);

    // Both handlers wait on one barrier; only parallel regions get past it.
    a.send_frame(&Frame::empty(REGION_PING)).await.unwrap();
    b.send_frame(&Frame::empty(REGION_PING)).await.unwrap();

    wait_until("both region pings", || tracker.seen().len() == 2).await;
    let mut seen = tracker.seen();
    seen.sort();
    assert_eq!(seen, vec![(1, 10), (2, 20)]);

    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_interleaved_entity_ops_keep_per_entity_order() {
    let (server, tracker) = start_recording(test_config()).await;
    let registry = server.registry().clone();
    let mut admin = connect(&server, LinkKind::AdminPanel).await;

    for entity in [100, 200] {
        admin
            .send(&ControlMessage::SpawnNpc {
                entity: EntityId(entity),
                region: RegionKey(3),
                template: 1,
            })
            .await
            .unwrap();
    }
    wait_until("NPCs spawned", || {
        registry.entities().contains(EntityId(100)) && registry.entities().contains(EntityId(200))
    })
    .await;

    for x in 0..100u16 {
        let entity = if x % 2 == 0 { 100 } else { 200 };
        admin.send(&walk(entity, x)).await.unwrap();
    }

    wait_until("100 walks", || tracker.seen().len() == 100).await;
    let seen = tracker.seen();
    for entity in [100, 200] {
        let xs: Vec<u16> = seen.iter().filter(|(e, _)| *e == entity).map(|(_, x)| *x).collect();
        assert_eq!(xs.len(), 50);
        assert!(xs.windows(2).all(|w| w[0] < w[1]), "entity {entity} out of order: {xs:?}");
    }
    assert_eq!(registry.region_of(EntityId(100)), RegionKey(3));

    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_panicking_handler_does_not_stall_region() {
    let (server, tracker) = start_recording(test_config()).await;
    let mut client = connect(&server, LinkKind::GameClient).await;

    client
        .send_frame(&Frame::new(opcodes::LOBBY_REGISTER, vec![1]))
        .await
        .unwrap();
    client
        .send_frame(&Frame::new(opcodes::LOBBY_REGISTER, vec![POISON]))
        .await
        .unwrap();
    client
        .send_frame(&Frame::new(opcodes::LOBBY_REGISTER, vec![2]))
        .await
        .unwrap();

    wait_until("frames around the panic", || tracker.seen().len() == 2).await;
    assert_eq!(tracker.seen(), vec![(0, 1), (0, 2)]);
    assert_eq!(server.registry().session_count(), 1);

    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_replayed_exchange_leaves_cipher_intact() {
    let server = WorldServer::with_defaults(test_config());
    server.start().await.unwrap();
    let mut client = connect(&server, LinkKind::GameClient).await;

    client
        .send_frame(&Frame::new(opcodes::LOBBY_REGISTER, vec![7, 7, 7]))
        .await
        .unwrap();

    let (_, offer) = KeyExchange::begin_exchange(true).unwrap();
    let (reply, _): (ExchangeReply, _) = KeyExchange::respond(&offer).unwrap();
    client
        .send_frame(&Frame::new(opcodes::EXCHANGE_REPLY, reply.encode()))
        .await
        .unwrap();

    client
        .send_frame(&Frame::new(opcodes::LOBBY_CONNECT, 42u32.to_le_bytes().to_vec()))
        .await
        .unwrap();
    let echo = client
        .recv_timeout(Duration::from_secs(5))
        .await
        .unwrap()
        .expect("session dropped after replayed exchange");
    assert_eq!(&echo.payload[..], &42u32.to_le_bytes()[..]);
    assert_eq!(server.registry().session_count(), 1);

    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_replayed_exchange_on_block_link_keeps_session() {
    let server = WorldServer::with_defaults(test_config());
    server.start().await.unwrap();
    let registry = server.registry().clone();
    let mut admin = connect(&server, LinkKind::AdminPanel).await;

    let (_, offer) = KeyExchange::begin_exchange(false).unwrap();
    let (reply, _) = KeyExchange::respond(&offer).unwrap();
    admin
        .send_frame(&Frame::new(opcodes::EXCHANGE_REPLY, reply.encode()))
        .await
        .unwrap();
    admin.send(&ControlMessage::Shutdown).await.unwrap();

    timeout(Duration::from_secs(5), registry.shutdown_requested())
        .await
        .expect("control message after the replay was lost");
    assert_eq!(registry.session_count(), 1);

    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_disconnect_right_after_lobby_connect_releases_entity() {
    let (server, tracker) = start_recording(test_config()).await;
    let registry = server.registry().clone();
    let mut client = connect(&server, LinkKind::GameClient).await;

    // Keeps the lobby queue busy so the connect is handled after the hang-up.
    client
        .send_frame(&Frame::new(opcodes::LOBBY_REGISTER, vec![SLOW]))
        .await
        .unwrap();
    client
        .send_frame(&Frame::new(opcodes::LOBBY_CONNECT, 77u32.to_le_bytes().to_vec()))
        .await
        .unwrap();
    client.close().await.unwrap();

    wait_until("session removed", || registry.session_count() == 0).await;
    wait_until("lobby connect handled", || tracker.connects.load(Ordering::SeqCst) == 1).await;
    wait_until("entity released", || {
        registry.entities().is_empty() && registry.session_of(EntityId(77)).is_none()
    })
    .await;
    assert!(!registry.entities().contains(EntityId(77)));

    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_disconnect_of_bound_client_leaves_entity() {
    let (server, _tracker) = start_recording(test_config()).await;
    let registry = server.registry().clone();
    let client = login(&server, 31).await;
    assert!(registry.entities().contains(EntityId(31)));

    client.close().await.unwrap();
    wait_until("entity released", || {
        !registry.entities().contains(EntityId(31)) && registry.session_of(EntityId(31)).is_none()
    })
    .await;
    wait_until("session removed", || registry.session_count() == 0).await;

    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_link_permissions_and_remote_shutdown() {
    let server = WorldServer::with_defaults(test_config());
    server.start().await.unwrap();
    let registry = server.registry().clone();

    let mut ai = connect(&server, LinkKind::AiLink).await;
    ai.send(&ControlMessage::Shutdown).await.unwrap();
    ai.send(&ControlMessage::SpawnNpc {
        entity: EntityId(9),
        region: RegionKey(4),
        template: 2,
    })
    .await
    .unwrap();
    wait_until("NPC spawned", || registry.entities().contains(EntityId(9))).await;
    assert!(!registry.is_shutdown_requested());

    let mut admin = connect(&server, LinkKind::AdminPanel).await;
    admin
        .send(&ControlMessage::Maintenance { countdown_secs: 600 })
        .await
        .unwrap();
    admin.send(&ControlMessage::Shutdown).await.unwrap();
    timeout(Duration::from_secs(5), registry.shutdown_requested())
        .await
        .expect("shutdown was never requested");
    assert!(registry.maintenance_remaining().is_some());

    server.shutdown().await;
    assert_eq!(registry.session_count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unexpected_frame_on_control_link_closes_it() {
    let server = WorldServer::with_defaults(test_config());
    server.start().await.unwrap();
    let mut admin = connect(&server, LinkKind::AdminPanel).await;

    admin
        .send_frame(&Frame::new(opcodes::LOBBY_CONNECT, vec![1, 2, 3, 4]))
        .await
        .unwrap();
    let next = admin.recv_timeout(Duration::from_secs(5)).await;
    assert!(matches!(next, Ok(None) | Err(_)), "control link stayed open: {next:?}");
    wait_until("session removed", || server.registry().session_count() == 0).await;

    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_silent_peer_hits_bootstrap_timeout() {
    let config = ServerConfig {
        bootstrap_timeout: Duration::from_millis(200),
        ..test_config()
    };
    let server = WorldServer::with_defaults(config);
    server.start().await.unwrap();

    let mut raw = TcpStream::connect(server.local_addr(LinkKind::GameClient).unwrap())
        .await
        .unwrap();
    let mut received = Vec::new();
    let read = timeout(Duration::from_secs(5), raw.read_to_end(&mut received)).await;
    assert!(read.is_ok(), "server never dropped the silent peer");
    // Only the offer was sent before the timeout.
    assert_eq!(u16::from_le_bytes([received[2], received[3]]), opcodes::EXCHANGE_OFFER);

    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_connection_limit() {
    let config = ServerConfig {
        max_connections: 1,
        ..test_config()
    };
    let server = WorldServer::with_defaults(config);
    server.start().await.unwrap();
    let addr = server.local_addr(LinkKind::GameClient).unwrap();

    let first = LinkClient::connect(addr, LinkKind::GameClient).await.unwrap();
    let refused = LinkClient::connect_with(addr, LinkKind::GameClient, 8192, Duration::from_secs(2)).await;
    assert!(refused.is_err());

    first.close().await.unwrap();
    wait_until("first session released", || server.registry().session_count() == 0).await;
    let second = LinkClient::connect(addr, LinkKind::GameClient).await;
    assert!(second.is_ok());

    server.shutdown().await;
}
