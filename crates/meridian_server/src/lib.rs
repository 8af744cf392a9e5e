//! # Meridian Server
//!
//! The world process runtime: TCP listeners for game clients and peer
//! servers, the partitioned packet pipeline, and the three dispatch layers
//! that decide which work may run concurrently.
//!
//! ## Message Flow
//!
//! 1. A [`TransportListener`] accepts a connection, pins it to the least
//!    loaded I/O partition and performs the key exchange
//! 2. Every frame read from the socket goes to that partition's read queue,
//!    where it is decrypted and handed to a router
//! 3. Game client frames run on the queue of the sender's region
//!    ([`WorldDispatch`]); control frames from peer servers run on the
//!    targeted entity's queue ([`EntityQueues`]) or the global queue
//! 4. Replies go through the partition's write queue, so they leave in the
//!    order they were produced
//!
//! ## Ordering guarantees
//!
//! * Frames from one connection are handled in arrival order
//! * Frames to one connection are written in submission order
//! * Work for one region, or one entity, never overlaps
//! * Different regions and different entities run in parallel
//!
//! ## Example
//!
//! ```rust,no_run
//! use meridian_core::LinkKind;
//! use meridian_server::{ServerConfig, WorldServer};
//!
//! # async fn run() -> Result<(), meridian_server::ServerError> {
//! let config = ServerConfig::default()
//!     .with_listener(LinkKind::GameClient, "0.0.0.0:7000".parse().unwrap())
//!     .with_listener(LinkKind::AdminPanel, "127.0.0.1:7100".parse().unwrap());
//!
//! let server = WorldServer::with_defaults(config);
//! server.start().await?;
//! server.registry().shutdown_requested().await;
//! server.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub use balancer::PartitionBalancer;
pub use config::{ListenerConfig, ServerConfig};
pub use entity::EntityQueues;
pub use error::{ServerError, SessionError};
pub use handler::{DispatchContext, GameRouter, InboundPacket, LoggingPacketHandler, PacketHandler};
pub use link::{is_permitted, ControlHandler, ControlRouter, LinkClient, LoggingControlHandler};
pub use listener::TransportListener;
pub use pipeline::{Followup, FrameRouter, PacketPipeline};
pub use registry::DispatchRegistry;
pub use server::WorldServer;
pub use session::{ConnectionSession, DisconnectReason, SessionStage, SessionTimeouts};
pub use world::WorldDispatch;

pub mod balancer;
pub mod config;
pub mod entity;
pub mod error;
pub mod handler;
pub mod link;
pub mod listener;
pub mod pipeline;
pub mod registry;
pub mod server;
pub mod session;
pub mod world;
