//! Diffie-Hellman session key negotiation.
//!
//! The server side calls [`KeyExchange::begin_exchange`], ships the returned
//! [`ExchangeOffer`] to the peer and feeds the peer's [`ExchangeReply`] into
//! [`KeyExchange::complete_exchange`]. The peer side does both halves at once
//! with [`KeyExchange::respond`]. Both ends end up with mirrored
//! [`SessionKeys`].
//!
//! The agreement is X25519 (`x25519-dalek`); the shared secret never leaves
//! this module except through HKDF-SHA256 derived per-direction keys.

use crate::error::ExchangeError;
use hkdf::Hkdf;
use rand::rngs::OsRng;
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey};

/// Group identifier carried in the offer. Only X25519 is spoken today.
pub const GROUP_X25519: u8 = 1;

pub const PUBLIC_KEY_LEN: usize = 32;
pub const IV_LEN: usize = 16;
pub const KEY_LEN: usize = 32;

const INFO_KEY: &[u8] = b"meridian/direction-key";
const INFO_SERVER_IV: &[u8] = b"meridian/iv/server";
const INFO_CLIENT_IV: &[u8] = b"meridian/iv/client";

pub type Iv = [u8; IV_LEN];

/// Key and IV for one direction of traffic.
#[derive(Clone)]
pub struct DirectionKey {
    pub key: [u8; KEY_LEN],
    pub iv: Iv,
}

impl std::fmt::Debug for DirectionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectionKey").field("key", &"[redacted]").finish()
    }
}

/// Symmetric key material for one session, seen from one end.
///
/// `outbound` seals what this end sends; `inbound` opens what it receives.
/// The peer holds the same two keys with the roles swapped.
#[derive(Debug, Clone)]
pub struct SessionKeys {
    pub outbound: DirectionKey,
    pub inbound: DirectionKey,
}

/// Public parameters the server sends first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeOffer {
    pub group: u8,
    pub public_key: Vec<u8>,
    /// `(server_iv, client_iv)` when the link kind ships IVs in the clear.
    pub ivs: Option<(Iv, Iv)>,
}

impl ExchangeOffer {
    /// `group:u8 | key_len:u16le | key | has_ivs:u8 | [server_iv | client_iv]`
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.public_key.len() + 2 * IV_LEN);
        out.push(self.group);
        out.extend_from_slice(&(self.public_key.len() as u16).to_le_bytes());
        out.extend_from_slice(&self.public_key);
        match &self.ivs {
            Some((server_iv, client_iv)) => {
                out.push(1);
                out.extend_from_slice(server_iv);
                out.extend_from_slice(client_iv);
            }
            None => out.push(0),
        }
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self, ExchangeError> {
        if data.len() < 4 {
            return Err(ExchangeError::Malformed(format!("offer too short ({} bytes)", data.len())));
        }
        let group = data[0];
        if group != GROUP_X25519 {
            return Err(ExchangeError::Malformed(format!("unsupported group {group}")));
        }
        let key_len = u16::from_le_bytes([data[1], data[2]]) as usize;
        if key_len != PUBLIC_KEY_LEN || data.len() < 3 + key_len + 1 {
            return Err(ExchangeError::Malformed(format!("bad public key length {key_len}")));
        }
        let public_key = data[3..3 + key_len].to_vec();
        let rest = &data[3 + key_len..];
        let ivs = match rest[0] {
            0 => None,
            1 if rest.len() == 1 + 2 * IV_LEN => {
                let mut server_iv = [0u8; IV_LEN];
                let mut client_iv = [0u8; IV_LEN];
                server_iv.copy_from_slice(&rest[1..1 + IV_LEN]);
                client_iv.copy_from_slice(&rest[1 + IV_LEN..]);
                Some((server_iv, client_iv))
            }
            _ => return Err(ExchangeError::Malformed("bad IV block".to_string())),
        };
        Ok(Self { group, public_key, ivs })
    }
}

/// The peer's answer: just its public key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeReply {
    pub public_key: Vec<u8>,
}

impl ExchangeReply {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 + self.public_key.len());
        out.extend_from_slice(&(self.public_key.len() as u16).to_le_bytes());
        out.extend_from_slice(&self.public_key);
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self, ExchangeError> {
        if data.len() < 2 {
            return Err(ExchangeError::Malformed("reply too short".to_string()));
        }
        let key_len = u16::from_le_bytes([data[0], data[1]]) as usize;
        if key_len != PUBLIC_KEY_LEN || data.len() != 2 + key_len {
            return Err(ExchangeError::Malformed(format!("bad public key length {key_len}")));
        }
        Ok(Self { public_key: data[2..].to_vec() })
    }
}

/// Server half of the handshake.
///
/// The ephemeral private key is consumed by the first completion, so a
/// replayed reply can never re-key the session.
pub struct KeyExchange {
    private_key: Option<EphemeralSecret>,
    ivs: Option<(Iv, Iv)>,
}

impl std::fmt::Debug for KeyExchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyExchange")
            .field("completed", &self.private_key.is_none())
            .field("ships_ivs", &self.ivs.is_some())
            .finish()
    }
}

impl KeyExchange {
    /// Generates an ephemeral key pair (and fresh IVs when `ship_ivs` is set).
    pub fn begin_exchange(ship_ivs: bool) -> Result<(Self, ExchangeOffer), ExchangeError> {
        let private_key = EphemeralSecret::random_from_rng(OsRng);
        let public_key = PublicKey::from(&private_key).as_bytes().to_vec();

        let ivs = ship_ivs.then(|| (rand::random::<Iv>(), rand::random::<Iv>()));

        let offer = ExchangeOffer { group: GROUP_X25519, public_key, ivs };
        Ok((Self { private_key: Some(private_key), ivs }, offer))
    }

    pub fn is_completed(&self) -> bool {
        self.private_key.is_none()
    }

    /// Consumes the peer's reply and derives the server-side keys.
    pub fn complete_exchange(&mut self, reply: &ExchangeReply) -> Result<SessionKeys, ExchangeError> {
        let private_key = self.private_key.take().ok_or(ExchangeError::AlreadyCompleted)?;
        let secret = agree(private_key, &reply.public_key)?;
        let (server_iv, client_iv) = match self.ivs {
            Some(ivs) => ivs,
            None => derive_ivs(&secret)?,
        };
        Ok(SessionKeys {
            outbound: direction_key(&secret, server_iv)?,
            inbound: direction_key(&secret, client_iv)?,
        })
    }

    /// Peer half: answers an offer and derives the peer-side keys.
    pub fn respond(offer: &ExchangeOffer) -> Result<(ExchangeReply, SessionKeys), ExchangeError> {
        if offer.group != GROUP_X25519 {
            return Err(ExchangeError::Malformed(format!("unsupported group {}", offer.group)));
        }
        let private_key = EphemeralSecret::random_from_rng(OsRng);
        let public_key = PublicKey::from(&private_key).as_bytes().to_vec();

        let secret = agree(private_key, &offer.public_key)?;
        let (server_iv, client_iv) = match offer.ivs {
            Some(ivs) => ivs,
            None => derive_ivs(&secret)?,
        };
        let keys = SessionKeys {
            outbound: direction_key(&secret, client_iv)?,
            inbound: direction_key(&secret, server_iv)?,
        };
        Ok((ExchangeReply { public_key }, keys))
    }
}

fn agree(private_key: EphemeralSecret, peer_public: &[u8]) -> Result<[u8; 32], ExchangeError> {
    let peer: [u8; PUBLIC_KEY_LEN] = peer_public
        .try_into()
        .map_err(|_| ExchangeError::InvalidExchange)?;
    let shared = private_key.diffie_hellman(&PublicKey::from(peer));
    // Low-order peer points yield an all-zero secret.
    if !shared.was_contributory() {
        return Err(ExchangeError::InvalidExchange);
    }
    Ok(shared.to_bytes())
}

fn derive_ivs(secret: &[u8; 32]) -> Result<(Iv, Iv), ExchangeError> {
    let hk = Hkdf::<Sha256>::new(None, secret);
    let mut server_iv = [0u8; IV_LEN];
    let mut client_iv = [0u8; IV_LEN];
    hk.expand(INFO_SERVER_IV, &mut server_iv)
        .map_err(|_| ExchangeError::InvalidExchange)?;
    hk.expand(INFO_CLIENT_IV, &mut client_iv)
        .map_err(|_| ExchangeError::InvalidExchange)?;
    Ok((server_iv, client_iv))
}

fn direction_key(secret: &[u8; 32], iv: Iv) -> Result<DirectionKey, ExchangeError> {
    let hk = Hkdf::<Sha256>::new(Some(&iv), secret);
    let mut key = [0u8; KEY_LEN];
    hk.expand(INFO_KEY, &mut key)
        .map_err(|_| ExchangeError::InvalidExchange)?;
    Ok(DirectionKey { key, iv })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_both_ends_agree() {
        let (mut server, offer) = KeyExchange::begin_exchange(true).unwrap();
        let (reply, client_keys) = KeyExchange::respond(&offer).unwrap();
        let server_keys = server.complete_exchange(&reply).unwrap();

        assert_eq!(server_keys.outbound.key, client_keys.inbound.key);
        assert_eq!(server_keys.inbound.key, client_keys.outbound.key);
        assert_ne!(server_keys.outbound.key, server_keys.inbound.key);
        assert_eq!(Some((server_keys.outbound.iv, server_keys.inbound.iv)), offer.ivs);
    }

    #[test]
    fn test_derived_ivs_when_not_shipped() {
        let (mut server, offer) = KeyExchange::begin_exchange(false).unwrap();
        assert!(offer.ivs.is_none());
        let (reply, client_keys) = KeyExchange::respond(&offer).unwrap();
        let server_keys = server.complete_exchange(&reply).unwrap();
        assert_eq!(server_keys.outbound.iv, client_keys.inbound.iv);
        assert_eq!(server_keys.inbound.iv, client_keys.outbound.iv);
    }

    #[test]
    fn test_second_completion_is_rejected() {
        let (mut server, offer) = KeyExchange::begin_exchange(true).unwrap();
        let (reply, _) = KeyExchange::respond(&offer).unwrap();
        server.complete_exchange(&reply).unwrap();
        assert!(server.is_completed());

        let err = server.complete_exchange(&reply).unwrap_err();
        assert!(matches!(err, ExchangeError::AlreadyCompleted));
    }

    #[test]
    fn test_malformed_public_key_is_invalid() {
        let (mut server, _) = KeyExchange::begin_exchange(false).unwrap();
        let reply = ExchangeReply { public_key: vec![7u8; 5] };
        assert!(matches!(
            server.complete_exchange(&reply),
            Err(ExchangeError::InvalidExchange)
        ));
    }

    #[test]
    fn test_low_order_point_is_invalid() {
        let (mut server, _) = KeyExchange::begin_exchange(false).unwrap();
        let reply = ExchangeReply { public_key: vec![0u8; PUBLIC_KEY_LEN] };
        assert!(matches!(
            server.complete_exchange(&reply),
            Err(ExchangeError::InvalidExchange)
        ));
    }

    #[test]
    fn test_offer_wire_format() {
        let (_, offer) = KeyExchange::begin_exchange(true).unwrap();
        let decoded = ExchangeOffer::decode(&offer.encode()).unwrap();
        assert_eq!(decoded, offer);

        let truncated = &offer.encode()[..10];
        assert!(ExchangeOffer::decode(truncated).is_err());
        assert!(ExchangeReply::decode(&[32, 0, 1, 2]).is_err());
    }
}
