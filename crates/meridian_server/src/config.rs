//! Server configuration types and defaults.
//!
//! [`ServerConfig`] is the fully resolved runtime configuration. The binary
//! builds it from its TOML file and command-line overrides; tests build it
//! directly.

use meridian_core::{opcodes, LinkKind, DEFAULT_MAX_FRAME};
use std::net::SocketAddr;
use std::time::Duration;

/// One endpoint the server listens on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerConfig {
    /// Which kind of peer connects here
    pub kind: LinkKind,
    /// Address to bind (port 0 picks a free port)
    pub bind_address: SocketAddr,
}

impl ListenerConfig {
    pub fn new(kind: LinkKind, bind_address: SocketAddr) -> Self {
        Self { kind, bind_address }
    }
}

/// Configuration structure for the world server.
///
/// Contains the I/O partitioning, framing limits, per-stage timeouts, the
/// shutdown grace period and the set of listeners to open.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Number of I/O partitions (read/write queue pairs)
    pub partitions: usize,

    /// Largest frame (header plus payload) accepted on any link
    pub max_frame_size: usize,

    /// Receive timeout while the key exchange is in progress
    pub bootstrap_timeout: Duration,

    /// Receive timeout once a session is established
    pub idle_timeout: Duration,

    /// How long shutdown waits for world and entity queues to drain
    pub shutdown_grace: Duration,

    /// Maximum number of concurrent connections per listener
    pub max_connections: usize,

    /// Type codes accepted from sessions outside any region
    pub lobby_allow: Vec<u16>,

    /// Endpoints to open on start
    pub listeners: Vec<ListenerConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            partitions: num_cpus::get().max(1),
            max_frame_size: DEFAULT_MAX_FRAME,
            bootstrap_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(300),
            shutdown_grace: Duration::from_secs(5),
            max_connections: 5000,
            lobby_allow: opcodes::DEFAULT_LOBBY_ALLOW.to_vec(),
            listeners: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Adds a listener and returns the config, for builder-style setup.
    pub fn with_listener(mut self, kind: LinkKind, bind_address: SocketAddr) -> Self {
        self.listeners.push(ListenerConfig::new(kind, bind_address));
        self
    }

    pub fn listener(&self, kind: LinkKind) -> Option<&ListenerConfig> {
        self.listeners.iter().find(|l| l.kind == kind)
    }
}
