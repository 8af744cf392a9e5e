//! Post-exchange frame ciphers.
//!
//! Each connection holds two [`FrameCipher`] halves: one that seals outbound
//! payloads (owned by the write path) and one that opens inbound payloads
//! (owned by the read path). Both halves keep their own running counter, so
//! frames must be sealed and opened in wire order.

use super::exchange::{DirectionKey, SessionKeys};
use crate::error::CipherError;
use crate::types::CipherTier;
use hkdf::Hkdf;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use sha2::Sha256;

/// Bytes appended to every payload sealed by the block tier.
pub const BLOCK_TAG_LEN: usize = 16;

const STREAM_TABLE_INFO: &[u8] = b"meridian/stream-tables";

/// One direction of a session cipher.
pub enum FrameCipher {
    Plain,
    Stream(RollingCipher),
    Block(BlockCipher),
}

impl std::fmt::Debug for FrameCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameCipher::Plain => f.write_str("FrameCipher::Plain"),
            FrameCipher::Stream(_) => f.write_str("FrameCipher::Stream"),
            FrameCipher::Block(_) => f.write_str("FrameCipher::Block"),
        }
    }
}

impl FrameCipher {
    /// Builds the `(inbound, outbound)` pair for a tier from negotiated keys.
    pub fn pair(tier: CipherTier, keys: &SessionKeys) -> Result<(Self, Self), CipherError> {
        Ok(match tier {
            CipherTier::Plain => (FrameCipher::Plain, FrameCipher::Plain),
            CipherTier::Stream => (
                FrameCipher::Stream(RollingCipher::new(&keys.inbound)?),
                FrameCipher::Stream(RollingCipher::new(&keys.outbound)?),
            ),
            CipherTier::Block => (
                FrameCipher::Block(BlockCipher::new(&keys.inbound)?),
                FrameCipher::Block(BlockCipher::new(&keys.outbound)?),
            ),
        })
    }

    /// Encrypts `payload` in place. The frame type code is bound as
    /// associated data where the tier supports it.
    pub fn seal(&mut self, type_code: u16, payload: &mut Vec<u8>) -> Result<(), CipherError> {
        match self {
            FrameCipher::Plain => Ok(()),
            FrameCipher::Stream(cipher) => {
                cipher.apply(payload);
                Ok(())
            }
            FrameCipher::Block(cipher) => cipher.seal(type_code, payload),
        }
    }

    /// Decrypts `payload` in place.
    pub fn open(&mut self, type_code: u16, payload: &mut Vec<u8>) -> Result<(), CipherError> {
        match self {
            FrameCipher::Plain => Ok(()),
            FrameCipher::Stream(cipher) => {
                cipher.apply(payload);
                Ok(())
            }
            FrameCipher::Block(cipher) => cipher.open(type_code, payload),
        }
    }

    /// Worst-case growth of a payload after sealing.
    pub fn overhead(&self) -> usize {
        match self {
            FrameCipher::Block(_) => BLOCK_TAG_LEN,
            _ => 0,
        }
    }
}

// ============================================================================
// Stream tier
// ============================================================================

/// Rolling XOR keystream for game clients.
///
/// Two 256-byte tables are expanded from the direction key; the keystream
/// byte for position `n` mixes both tables indexed by the low bytes of `n`
/// with its high byte. Cheap enough to run on every client byte.
pub struct RollingCipher {
    table_a: [u8; 256],
    table_b: [u8; 256],
    counter: u32,
}

impl RollingCipher {
    pub fn new(key: &DirectionKey) -> Result<Self, CipherError> {
        let hk = Hkdf::<Sha256>::new(Some(&key.iv), &key.key);
        let mut tables = [0u8; 512];
        hk.expand(STREAM_TABLE_INFO, &mut tables)
            .map_err(|_| CipherError::InvalidKey)?;

        let mut table_a = [0u8; 256];
        let mut table_b = [0u8; 256];
        table_a.copy_from_slice(&tables[..256]);
        table_b.copy_from_slice(&tables[256..]);
        Ok(Self { table_a, table_b, counter: 0 })
    }

    pub fn apply(&mut self, data: &mut [u8]) {
        for byte in data.iter_mut() {
            let n = self.counter;
            let ks = self.table_a[(n & 0xff) as usize]
                ^ self.table_b[((n >> 8) & 0xff) as usize].rotate_left((n >> 16) & 7)
                ^ 0xab;
            *byte ^= ks;
            self.counter = n.wrapping_add(1);
        }
    }
}

// ============================================================================
// Block tier
// ============================================================================

/// AES-256-GCM with a per-direction frame counter folded into the nonce.
pub struct BlockCipher {
    key: LessSafeKey,
    nonce_base: [u8; NONCE_LEN],
    counter: u64,
}

impl BlockCipher {
    pub fn new(key: &DirectionKey) -> Result<Self, CipherError> {
        let unbound = UnboundKey::new(&AES_256_GCM, &key.key).map_err(|_| CipherError::InvalidKey)?;
        let mut nonce_base = [0u8; NONCE_LEN];
        nonce_base.copy_from_slice(&key.iv[..NONCE_LEN]);
        Ok(Self { key: LessSafeKey::new(unbound), nonce_base, counter: 0 })
    }

    fn next_nonce(&mut self) -> Nonce {
        let mut bytes = self.nonce_base;
        for (slot, c) in bytes[NONCE_LEN - 8..].iter_mut().zip(self.counter.to_be_bytes()) {
            *slot ^= c;
        }
        self.counter = self.counter.wrapping_add(1);
        Nonce::assume_unique_for_key(bytes)
    }

    pub fn seal(&mut self, type_code: u16, payload: &mut Vec<u8>) -> Result<(), CipherError> {
        let nonce = self.next_nonce();
        self.key
            .seal_in_place_append_tag(nonce, Aad::from(type_code.to_le_bytes()), payload)
            .map_err(|_| CipherError::Seal)
    }

    pub fn open(&mut self, type_code: u16, payload: &mut Vec<u8>) -> Result<(), CipherError> {
        let nonce = self.next_nonce();
        let plain_len = self
            .key
            .open_in_place(nonce, Aad::from(type_code.to_le_bytes()), payload.as_mut_slice())
            .map_err(|_| CipherError::Authentication)?
            .len();
        payload.truncate(plain_len);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::exchange::KeyExchange;

    fn negotiated() -> (SessionKeys, SessionKeys) {
        let (mut server, offer) = KeyExchange::begin_exchange(true).unwrap();
        let (reply, client) = KeyExchange::respond(&offer).unwrap();
        (server.complete_exchange(&reply).unwrap(), client)
    }

    #[test]
    fn test_stream_tier_pairs_up() {
        let (server_keys, client_keys) = negotiated();
        let (_, mut server_out) = FrameCipher::pair(CipherTier::Stream, &server_keys).unwrap();
        let (mut client_in, _) = FrameCipher::pair(CipherTier::Stream, &client_keys).unwrap();

        for message in [&b"hello"[..], &b"second frame, longer payload"[..]] {
            let mut buf = message.to_vec();
            server_out.seal(1001, &mut buf).unwrap();
            assert_ne!(buf, message);
            client_in.open(1001, &mut buf).unwrap();
            assert_eq!(buf, message);
        }
    }

    #[test]
    fn test_block_tier_authenticates_type_code() {
        let (server_keys, client_keys) = negotiated();
        let (_, mut server_out) = FrameCipher::pair(CipherTier::Block, &server_keys).unwrap();
        let (mut client_in, _) = FrameCipher::pair(CipherTier::Block, &client_keys).unwrap();

        let mut buf = b"ban 42".to_vec();
        server_out.seal(0x0100, &mut buf).unwrap();
        assert_eq!(buf.len(), 6 + BLOCK_TAG_LEN);

        let mut tampered = buf.clone();
        assert!(matches!(
            client_in.open(0x0101, &mut tampered),
            Err(CipherError::Authentication)
        ));
    }

    #[test]
    fn test_block_tier_round_trip() {
        let (server_keys, client_keys) = negotiated();
        let (mut server_in, _) = FrameCipher::pair(CipherTier::Block, &server_keys).unwrap();
        let (_, mut client_out) = FrameCipher::pair(CipherTier::Block, &client_keys).unwrap();

        let mut buf = b"shutdown".to_vec();
        client_out.seal(7, &mut buf).unwrap();
        server_in.open(7, &mut buf).unwrap();
        assert_eq!(buf, b"shutdown");
    }

    #[test]
    fn test_plain_tier_is_identity() {
        let (keys, _) = negotiated();
        let (mut inbound, mut outbound) = FrameCipher::pair(CipherTier::Plain, &keys).unwrap();
        let mut buf = b"spawn".to_vec();
        outbound.seal(3, &mut buf).unwrap();
        inbound.open(3, &mut buf).unwrap();
        assert_eq!(buf, b"spawn");
        assert_eq!(outbound.overhead(), 0);
    }
}
