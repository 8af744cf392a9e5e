//! TCP listeners and the per-connection handshake state machine.
//!
//! Each accepted connection gets its own task which:
//!
//! 1. assigns an I/O partition through the [`PartitionBalancer`];
//! 2. sends the key exchange offer (if the link kind has one) and waits for
//!    the reply under the short bootstrap timeout;
//! 3. reads frames under the idle timeout and hands them to the pipeline;
//! 4. on any exit, releases the partition and queues the router's disconnect
//!    hook behind the frames still waiting on the read queue.

use crate::balancer::PartitionBalancer;
use crate::config::{ListenerConfig, ServerConfig};
use crate::error::{ServerError, SessionError};
use crate::pipeline::FrameRouter;
use crate::registry::DispatchRegistry;
use crate::session::{ConnectionSession, DisconnectReason, SessionStage, SessionTimeouts};
use bytes::BytesMut;
use meridian_core::{
    hex_preview, opcodes, DispatchError, ExchangeError, ExchangeReply, Frame, FrameCodec, LinkKind,
};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

const LISTEN_BACKLOG: i32 = 1024;
const FAULT_PREVIEW: usize = 64;

/// Accepts connections of one [`LinkKind`] on one address.
pub struct TransportListener {
    kind: LinkKind,
    listener: TcpListener,
    local_addr: SocketAddr,
    max_frame_size: usize,
    max_connections: usize,
    timeouts: SessionTimeouts,
    balancer: Arc<PartitionBalancer>,
    registry: Arc<DispatchRegistry>,
    router: Arc<dyn FrameRouter>,
    active: AtomicUsize,
}

impl TransportListener {
    /// Binds the listening socket. Must run inside a Tokio runtime.
    pub fn bind(
        endpoint: &ListenerConfig,
        config: &ServerConfig,
        balancer: Arc<PartitionBalancer>,
        registry: Arc<DispatchRegistry>,
        router: Arc<dyn FrameRouter>,
    ) -> Result<Self, ServerError> {
        let addr = endpoint.bind_address;
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
            .map_err(|e| ServerError::Network(format!("Socket creation failed: {e}")))?;
        socket.set_reuse_address(true).ok();
        socket
            .set_nonblocking(true)
            .map_err(|e| ServerError::Network(format!("Nonblocking mode failed: {e}")))?;
        socket
            .bind(&addr.into())
            .map_err(|e| ServerError::Network(format!("Bind {addr} failed: {e}")))?;
        socket
            .listen(LISTEN_BACKLOG)
            .map_err(|e| ServerError::Network(format!("Listen on {addr} failed: {e}")))?;

        let std_listener: StdTcpListener = socket.into();
        let listener = TcpListener::from_std(std_listener)
            .map_err(|e| ServerError::Network(format!("Tokio listener creation failed: {e}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| ServerError::Network(format!("Local address lookup failed: {e}")))?;

        info!("✅ {} listener bound on {}", endpoint.kind, local_addr);
        Ok(Self {
            kind: endpoint.kind,
            listener,
            local_addr,
            max_frame_size: config.max_frame_size,
            max_connections: config.max_connections,
            timeouts: SessionTimeouts {
                bootstrap: config.bootstrap_timeout,
                idle: config.idle_timeout,
            },
            balancer,
            registry,
            router,
            active: AtomicUsize::new(0),
        })
    }

    pub fn kind(&self) -> LinkKind {
        self.kind
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Accept loop. Runs until `shutdown` fires, then waits up to `grace` for
    /// the connection tasks it spawned.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>, grace: Duration) {
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        if self.active.load(Ordering::Acquire) >= self.max_connections {
                            warn!(kind = %self.kind, %remote, "Connection limit {} reached, refusing", self.max_connections);
                            drop(stream);
                            continue;
                        }
                        self.active.fetch_add(1, Ordering::AcqRel);
                        let this = self.clone();
                        connections.spawn(async move { this.serve(stream, remote).await });
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        info!("{} listener on {} stopped accepting", self.kind, self.local_addr);
        let drained = tokio::time::timeout(grace, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!("{} connection task(s) still running after {:?}", connections.len(), grace);
            connections.abort_all();
        }
    }

    fn codec(&self) -> FrameCodec {
        if self.kind.uses_trailer() {
            FrameCodec::with_trailer(self.max_frame_size)
        } else {
            FrameCodec::new(None, self.max_frame_size)
        }
    }

    async fn serve(self: Arc<Self>, stream: TcpStream, remote: SocketAddr) {
        let partition = self.balancer.select();
        stream.set_nodelay(true).ok();
        let (reader, writer) = stream.into_split();

        let session = Arc::new(ConnectionSession::new(
            self.kind,
            remote,
            partition,
            self.codec(),
            writer,
            self.timeouts,
        ));
        let id = session.id();
        self.registry.register_session(session.clone());
        debug!(session = %id, kind = %self.kind, %remote, %partition, "🔗 Connection accepted");

        let outcome = self.drive(&session, reader).await;
        let reason = match outcome {
            Ok(()) => DisconnectReason::PeerClosed,
            Err(ref e) => classify(e),
        };
        session.close(reason);
        let reason = session
            .disconnect_reason()
            .unwrap_or(DisconnectReason::PeerClosed);

        self.registry
            .pipeline()
            .enqueue_disconnect(&session, self.router.clone());
        if self.registry.pipeline().enqueue_finish(&session).is_err() {
            session.shutdown_writer().await;
        }
        self.balancer.deselect(partition);
        self.active.fetch_sub(1, Ordering::AcqRel);
        self.registry.remove_session(id);

        info!(
            session = %id,
            kind = %self.kind,
            %remote,
            lifetime_ms = session.age().as_millis() as u64,
            "Connection closed: {}", reason
        );
    }

    async fn drive(
        &self,
        session: &Arc<ConnectionSession>,
        mut reader: OwnedReadHalf,
    ) -> Result<(), SessionError> {
        let mut buf = BytesMut::with_capacity(4096);
        session.transition(SessionStage::Exchanging)?;

        if self.kind.requires_handshake() {
            let offer = session.begin_exchange()?;
            session
                .write_frame(&Frame::new(opcodes::EXCHANGE_OFFER, offer.encode()))
                .await?;

            let Some(frame) = next_frame(session, &mut reader, &mut buf).await? else {
                return Ok(());
            };
            if frame.type_code != opcodes::EXCHANGE_REPLY {
                log_fault(session, &frame, "expected exchange reply");
                return Err(ExchangeError::UnexpectedMessage(frame.type_code).into());
            }
            let reply = ExchangeReply::decode(&frame.payload).inspect_err(|_| {
                log_fault(session, &frame, "malformed exchange reply");
            })?;
            session.complete_exchange(&reply)?;
        } else {
            session.transition(SessionStage::Receiving)?;
        }
        debug!(session = %session.id(), "Session established");

        loop {
            let Some(frame) = next_frame(session, &mut reader, &mut buf).await? else {
                return Ok(());
            };

            // Decryption and exchange replays are handled in wire order on the
            // read queue.
            match self
                .registry
                .pipeline()
                .enqueue_read(session, frame, self.router.clone())
            {
                Ok(()) => {}
                Err(DispatchError::QueueClosed(_)) => {
                    session.close(DisconnectReason::Shutdown);
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Pulls the next frame, reading more bytes as needed under the receive
/// timeout of the session's current stage. `None` on EOF or close.
async fn next_frame(
    session: &ConnectionSession,
    reader: &mut OwnedReadHalf,
    buf: &mut BytesMut,
) -> Result<Option<Frame>, SessionError> {
    loop {
        match session.codec().try_extract(buf) {
            Ok(Some(frame)) => return Ok(Some(frame)),
            Ok(None) => {}
            Err(e) => {
                warn!(
                    session = %session.id(),
                    bytes = %hex_preview(buf, FAULT_PREVIEW),
                    "Protocol fault: {}", e
                );
                return Err(e.into());
            }
        }

        let stage = session.stage();
        let wait = session.receive_timeout();
        tokio::select! {
            _ = session.closed() => return Ok(None),
            read = tokio::time::timeout(wait, reader.read_buf(buf)) => match read {
                Err(_) => return Err(SessionError::Timeout(stage)),
                Ok(Ok(0)) => return Ok(None),
                Ok(Ok(_)) => {}
                Ok(Err(e)) => return Err(e.into()),
            },
        }
    }
}

fn log_fault(session: &ConnectionSession, frame: &Frame, what: &str) {
    warn!(
        session = %session.id(),
        type_code = frame.type_code,
        bytes = %hex_preview(&frame.payload, FAULT_PREVIEW),
        "Protocol fault: {}", what
    );
}

fn classify(error: &SessionError) -> DisconnectReason {
    match error {
        SessionError::Timeout(SessionStage::Receiving) => DisconnectReason::IdleTimeout,
        SessionError::Timeout(_) => DisconnectReason::BootstrapTimeout,
        SessionError::Io(e) => DisconnectReason::Transport(e.to_string()),
        SessionError::Closed => DisconnectReason::PeerClosed,
        SessionError::Dispatch(DispatchError::QueueClosed(_)) => DisconnectReason::Shutdown,
        e if e.is_protocol_fault() => DisconnectReason::Protocol(e.to_string()),
        e => DisconnectReason::Transport(e.to_string()),
    }
}
