//! The world server: wires listeners, the packet pipeline and the dispatch
//! layers together and owns the shutdown sequence.

use crate::balancer::PartitionBalancer;
use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::handler::{GameRouter, LoggingPacketHandler, PacketHandler};
use crate::link::{ControlHandler, ControlRouter, LoggingControlHandler};
use crate::listener::TransportListener;
use crate::pipeline::{FrameRouter, PacketPipeline};
use crate::registry::DispatchRegistry;
use crate::session::DisconnectReason;
use meridian_core::LinkKind;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// One process of the game world.
///
/// Construction spawns the pipeline and dispatch workers, so it must happen
/// inside a Tokio runtime. [`start`](Self::start) binds every configured
/// listener and returns once they are accepting; [`shutdown`](Self::shutdown)
/// stops them and drains every queue within the configured grace period.
pub struct WorldServer {
    config: ServerConfig,
    registry: Arc<DispatchRegistry>,
    balancer: Arc<PartitionBalancer>,
    packet_handler: Arc<dyn PacketHandler>,
    control_handler: Arc<dyn ControlHandler>,
    shutdown_sender: broadcast::Sender<()>,
    accept_tasks: Mutex<Vec<JoinHandle<()>>>,
    bound: Mutex<Vec<(LinkKind, SocketAddr)>>,
}

impl WorldServer {
    /// Builds the server and spawns its dispatch workers.
    ///
    /// # Arguments
    ///
    /// * `config` - Partitions, timeouts, limits and listeners
    /// * `packet_handler` - Game logic for client traffic
    /// * `control_handler` - Game logic for peer-server control messages
    pub fn new(
        config: ServerConfig,
        packet_handler: Arc<dyn PacketHandler>,
        control_handler: Arc<dyn ControlHandler>,
    ) -> Self {
        let partitions = config.partitions.max(1);
        let pipeline = Arc::new(PacketPipeline::start(partitions));
        let registry = Arc::new(DispatchRegistry::new(
            pipeline,
            config.lobby_allow.iter().copied(),
        ));
        let (shutdown_sender, _) = broadcast::channel(1);

        Self {
            balancer: Arc::new(PartitionBalancer::new(partitions)),
            config,
            registry,
            packet_handler,
            control_handler,
            shutdown_sender,
            accept_tasks: Mutex::new(Vec::new()),
            bound: Mutex::new(Vec::new()),
        }
    }

    /// A server whose handlers only bind entities and log traffic.
    pub fn with_defaults(config: ServerConfig) -> Self {
        Self::new(
            config,
            Arc::new(LoggingPacketHandler),
            Arc::new(LoggingControlHandler),
        )
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<DispatchRegistry> {
        &self.registry
    }

    pub fn balancer(&self) -> &Arc<PartitionBalancer> {
        &self.balancer
    }

    /// Binds all listeners and spawns their accept loops.
    ///
    /// Either every listener is bound or none is left running.
    ///
    /// # Returns
    ///
    /// * `Ok(())` - Every listener is accepting
    /// * `Err(ServerError::Config)` - No listener is configured
    /// * `Err(ServerError::Network)` - A bind failed
    /// * `Err(ServerError::Internal)` - The server was already started
    pub async fn start(&self) -> Result<(), ServerError> {
        if self.config.listeners.is_empty() {
            return Err(ServerError::Config("no listeners configured".to_string()));
        }
        if !self.accept_tasks.lock().is_empty() {
            return Err(ServerError::Internal("server already started".to_string()));
        }

        info!(
            "🚀 Starting world server with {} I/O partition(s)",
            self.balancer.partitions()
        );

        let mut listeners = Vec::with_capacity(self.config.listeners.len());
        for endpoint in &self.config.listeners {
            let router: Arc<dyn FrameRouter> = match endpoint.kind {
                LinkKind::GameClient => Arc::new(GameRouter::new(
                    self.registry.clone(),
                    self.packet_handler.clone(),
                )),
                _ => Arc::new(ControlRouter::new(
                    self.registry.clone(),
                    self.control_handler.clone(),
                )),
            };
            let listener = TransportListener::bind(
                endpoint,
                &self.config,
                self.balancer.clone(),
                self.registry.clone(),
                router,
            )?;
            listeners.push(Arc::new(listener));
        }

        let mut tasks = self.accept_tasks.lock();
        let mut bound = self.bound.lock();
        for listener in listeners {
            bound.push((listener.kind(), listener.local_addr()));
            let shutdown = self.shutdown_sender.subscribe();
            let grace = self.config.shutdown_grace;
            tasks.push(tokio::spawn(listener.run(shutdown, grace)));
        }

        info!("🌐 World server accepting on {} listener(s)", bound.len());
        Ok(())
    }

    /// Address a listener of `kind` actually bound to.
    pub fn local_addr(&self, kind: LinkKind) -> Option<SocketAddr> {
        self.bound
            .lock()
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, addr)| *addr)
    }

    /// Stops accepting, closes every session and drains the queues.
    ///
    /// Steps run in order: listeners stop, sessions close, connection tasks
    /// finish, the pipeline drains, then region, entity and global queues
    /// drain under one grace deadline. Work still running after the deadline
    /// is logged and abandoned.
    pub async fn shutdown(&self) {
        info!("🛑 Shutting down world server");
        let _ = self.shutdown_sender.send(());

        let sessions = self.registry.sessions();
        for session in &sessions {
            session.close(DisconnectReason::Shutdown);
        }
        if !sessions.is_empty() {
            info!("Closing {} session(s)", sessions.len());
        }

        let tasks = std::mem::take(&mut *self.accept_tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Listener task ended abnormally: {}", e);
            }
        }

        let grace = self.config.shutdown_grace;
        self.registry.pipeline().shutdown(grace).await;
        let busy = self.registry.drain(grace).await;
        if busy > 0 {
            warn!("{} dispatch queue(s) abandoned after {:?}", busy, grace);
        }
        info!("✅ World server stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_start_without_listeners() {
        let server = WorldServer::with_defaults(ServerConfig::default());
        assert!(matches!(server.start().await, Err(ServerError::Config(_))));
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let config = ServerConfig {
            partitions: 2,
            ..ServerConfig::default()
        }
        .with_listener(LinkKind::GameClient, "127.0.0.1:0".parse().unwrap())
        .with_listener(LinkKind::AdminPanel, "127.0.0.1:0".parse().unwrap());
        let server = WorldServer::with_defaults(config);
        server.start().await.unwrap();

        let game = server.local_addr(LinkKind::GameClient).unwrap();
        assert_ne!(game.port(), 0);
        assert!(server.local_addr(LinkKind::AdminPanel).is_some());
        assert!(server.local_addr(LinkKind::AiLink).is_none());
        assert!(matches!(server.start().await, Err(ServerError::Internal(_))));

        server.shutdown().await;
        assert_eq!(server.registry().session_count(), 0);
    }
}
