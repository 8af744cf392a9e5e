//! Control messages exchanged between world, login, AI and admin processes.
//!
//! Control messages are JSON documents carried in frames of type
//! [`opcodes::CONTROL`]. They are tagged by `"type"` so peers written against
//! an older message set can still log what they could not understand.

use crate::codec::Frame;
use crate::error::DispatchError;
use crate::types::{EntityId, RegionKey};
use serde::{Deserialize, Serialize};

/// Reserved frame type codes.
pub mod opcodes {
    /// Server key exchange offer.
    pub const EXCHANGE_OFFER: u16 = 0x0001;
    /// Peer key exchange reply.
    pub const EXCHANGE_REPLY: u16 = 0x0002;
    /// JSON control message on inter-server links.
    pub const CONTROL: u16 = 0x0100;

    /// Lobby traffic accepted from sessions without a region.
    pub const LOBBY_CONNECT: u16 = 0x03e9;
    pub const LOBBY_REGISTER: u16 = 0x03ea;
    pub const LOBBY_RANK_QUERY: u16 = 0x03eb;

    /// Type codes accepted from sessions that are not inside a region yet.
    pub const DEFAULT_LOBBY_ALLOW: [u16; 3] = [LOBBY_CONNECT, LOBBY_REGISTER, LOBBY_RANK_QUERY];
}

/// An action applied to one entity on behalf of a peer process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum EntityAction {
    LeaveMap,
    FlyMap { region: RegionKey, x: u16, y: u16 },
    Walk { x: u16, y: u16 },
    Run { x: u16, y: u16 },
    Jump { x: u16, y: u16 },
    SetProtection,
    ClearProtection,
    RemoteShutdown,
}

/// Status flags a peer can attach to or detach from an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusFlag {
    Muted,
    Frozen,
    Invisible,
    Gm,
}

/// Everything a control link can ask the world process to do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    EntityAction { entity: EntityId, action: EntityAction },
    SpawnNpc { entity: EntityId, region: RegionKey, template: u32 },
    DespawnNpc { entity: EntityId },
    RoleLogin { entity: EntityId, token: String },
    RoleLogout { entity: EntityId },
    StatusAttach { entity: EntityId, flag: StatusFlag },
    StatusDetach { entity: EntityId, flag: StatusFlag },
    Ban { entity: EntityId, reason: String },
    Kick { entity: EntityId },
    Maintenance { countdown_secs: u32 },
    Shutdown,
}

/// How a control message is serialized inside the world process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlScope {
    /// Runs on the named entity's queue.
    Entity(EntityId),
    /// Creates the entity, so it runs on the global queue.
    Spawn(EntityId),
    /// Runs on the process-wide serial queue.
    Global,
}

impl ControlMessage {
    pub fn scope(&self) -> ControlScope {
        match self {
            ControlMessage::SpawnNpc { entity, .. } | ControlMessage::RoleLogin { entity, .. } => {
                ControlScope::Spawn(*entity)
            }
            ControlMessage::EntityAction { entity, .. }
            | ControlMessage::DespawnNpc { entity }
            | ControlMessage::RoleLogout { entity }
            | ControlMessage::StatusAttach { entity, .. }
            | ControlMessage::StatusDetach { entity, .. }
            | ControlMessage::Ban { entity, .. }
            | ControlMessage::Kick { entity } => ControlScope::Entity(*entity),
            ControlMessage::Maintenance { .. } | ControlMessage::Shutdown => ControlScope::Global,
        }
    }

    /// Short name used in log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            ControlMessage::EntityAction { .. } => "entity_action",
            ControlMessage::SpawnNpc { .. } => "spawn_npc",
            ControlMessage::DespawnNpc { .. } => "despawn_npc",
            ControlMessage::RoleLogin { .. } => "role_login",
            ControlMessage::RoleLogout { .. } => "role_logout",
            ControlMessage::StatusAttach { .. } => "status_attach",
            ControlMessage::StatusDetach { .. } => "status_detach",
            ControlMessage::Ban { .. } => "ban",
            ControlMessage::Kick { .. } => "kick",
            ControlMessage::Maintenance { .. } => "maintenance",
            ControlMessage::Shutdown => "shutdown",
        }
    }

    pub fn to_frame(&self) -> Result<Frame, DispatchError> {
        Ok(Frame::new(opcodes::CONTROL, serde_json::to_vec(self)?))
    }

    pub fn from_frame(frame: &Frame) -> Result<Self, DispatchError> {
        Ok(serde_json::from_slice(&frame.payload)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_shape() {
        let message = ControlMessage::EntityAction {
            entity: EntityId(7),
            action: EntityAction::FlyMap { region: RegionKey(1002), x: 40, y: 51 },
        };
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["type"], "entity_action");
        assert_eq!(json["entity"], 7);
        assert_eq!(json["action"]["action"], "fly_map");
        assert_eq!(json["action"]["region"], 1002);

        let frame = message.to_frame().unwrap();
        assert_eq!(frame.type_code, opcodes::CONTROL);
        assert_eq!(ControlMessage::from_frame(&frame).unwrap(), message);
    }

    #[test]
    fn test_scopes() {
        assert_eq!(ControlMessage::Shutdown.scope(), ControlScope::Global);
        assert_eq!(
            ControlMessage::Kick { entity: EntityId(3) }.scope(),
            ControlScope::Entity(EntityId(3))
        );
        assert_eq!(
            ControlMessage::RoleLogin { entity: EntityId(9), token: "t".into() }.scope(),
            ControlScope::Spawn(EntityId(9))
        );
    }

    #[test]
    fn test_garbage_payload_is_rejected() {
        let frame = Frame::new(opcodes::CONTROL, &b"{\"type\":\"teleport\"}"[..]);
        assert!(matches!(
            ControlMessage::from_frame(&frame),
            Err(DispatchError::Serialization(_))
        ));
    }
}
