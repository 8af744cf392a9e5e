//! # Core Type Definitions
//!
//! Identifiers and link classifications shared by every Meridian process.
//!
//! ## Key Types
//!
//! - [`SessionId`] - Opaque token for one accepted transport connection
//! - [`EntityId`] - Identifier of a simulated actor (player, monster, NPC)
//! - [`RegionKey`] - Dispatch partition key of a loaded map
//! - [`PartitionId`] - Index of an I/O partition in the packet pipeline
//! - [`LinkKind`] - What sits on the other end of a connection, and how much we trust it

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Identifiers
// ============================================================================

/// Opaque identity of a connection session.
///
/// Wraps a UUID so session tokens can never be confused with entity or
/// region identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    /// Creates a new random session id using UUID v4.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a simulated entity.
///
/// Players, monsters and NPCs share one id space; the world process hands
/// them out when an entity enters the simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(pub u32);

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Dispatch key of a spatial region (a loaded map).
///
/// A region keeps its key for as long as it stays loaded. [`RegionKey::NONE`]
/// is reserved for traffic from sessions that are not inside any region yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RegionKey(pub u32);

impl RegionKey {
    /// The "no region" sentinel used for lobby and pre-spawn traffic.
    pub const NONE: RegionKey = RegionKey(u32::MAX);

    pub fn is_none(self) -> bool {
        self == Self::NONE
    }
}

impl std::fmt::Display for RegionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_none() {
            write!(f, "region:none")
        } else {
            write!(f, "region:{}", self.0)
        }
    }
}

/// Index of an I/O partition inside the packet pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionId(pub usize);

impl std::fmt::Display for PartitionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "p{}", self.0)
    }
}

// ============================================================================
// Link classification
// ============================================================================

/// Post-exchange cipher family used on a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CipherTier {
    /// Mutually trusted link, frames travel in the clear.
    Plain,
    /// Light rolling stream cipher used for game clients.
    Stream,
    /// AES-256-GCM used for admin and control links.
    Block,
}

/// The kind of peer sitting on the far end of a connection.
///
/// Every kind runs on the same substrate; the kind only selects the cipher
/// tier, whether a key exchange happens at all, and whether frames carry the
/// resync trailer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkKind {
    GameClient,
    AiLink,
    LoginLink,
    AdminPanel,
}

impl LinkKind {
    pub fn cipher_tier(self) -> CipherTier {
        match self {
            LinkKind::GameClient => CipherTier::Stream,
            LinkKind::AiLink => CipherTier::Plain,
            LinkKind::LoginLink | LinkKind::AdminPanel => CipherTier::Block,
        }
    }

    /// Whether the listener must complete a key exchange before accepting frames.
    pub fn requires_handshake(self) -> bool {
        self.cipher_tier() != CipherTier::Plain
    }

    /// Whether the IVs are generated by the server and shipped in the offer.
    ///
    /// Control links derive both IVs from the shared secret instead.
    pub fn ships_ivs(self) -> bool {
        matches!(self, LinkKind::GameClient)
    }

    /// Whether frames on this link end with the resync trailer.
    pub fn uses_trailer(self) -> bool {
        matches!(self, LinkKind::GameClient)
    }

    /// Links that carry control messages rather than player traffic.
    pub fn is_control(self) -> bool {
        !matches!(self, LinkKind::GameClient)
    }
}

impl std::fmt::Display for LinkKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LinkKind::GameClient => "game",
            LinkKind::AiLink => "ai",
            LinkKind::LoginLink => "login",
            LinkKind::AdminPanel => "admin",
        };
        f.write_str(name)
    }
}
