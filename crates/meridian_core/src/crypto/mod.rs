//! Session key negotiation and the ciphers it feeds.

pub mod cipher;
pub mod exchange;

pub use cipher::{BlockCipher, FrameCipher, RollingCipher, BLOCK_TAG_LEN};
pub use exchange::{
    DirectionKey, ExchangeOffer, ExchangeReply, KeyExchange, SessionKeys, GROUP_X25519, IV_LEN,
};
