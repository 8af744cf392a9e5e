//! # Meridian Core
//!
//! Building blocks shared by every process of the Meridian server cluster
//! (world, login, AI and admin panel).
//!
//! ## Contents
//!
//! - [`types`] - Session, entity, region and partition identifiers, plus [`LinkKind`]
//! - [`crypto`] - X25519 key exchange and the per-tier frame ciphers
//! - [`codec`] - Length/type framing of the binary TCP protocols
//! - [`queue`] - [`SerialQueue`], the single-worker FIFO every dispatch layer is built on
//! - [`control`] - JSON control messages spoken on inter-server links
//! - [`error`] - Error types for all of the above
//!
//! ## Example
//!
//! ```rust
//! use meridian_core::{Frame, FrameCodec};
//! use bytes::BytesMut;
//!
//! let codec = FrameCodec::with_trailer(1024);
//! let mut buf = BytesMut::new();
//! codec.encode(&Frame::new(1010, &b"hello"[..]), &mut buf).unwrap();
//!
//! let frame = codec.try_extract(&mut buf).unwrap().unwrap();
//! assert_eq!(frame.type_code, 1010);
//! ```

pub mod codec;
pub mod control;
pub mod crypto;
pub mod error;
pub mod queue;
pub mod types;

pub use codec::{hex_preview, Frame, FrameCodec, DEFAULT_MAX_FRAME, GAME_TRAILER, HEADER_LEN};
pub use control::{opcodes, ControlMessage, ControlScope, EntityAction, StatusFlag};
pub use crypto::{ExchangeOffer, ExchangeReply, FrameCipher, KeyExchange, SessionKeys};
pub use error::{CipherError, DispatchError, ExchangeError, FrameError};
pub use queue::{join_all_within, Job, QueueStats, QueueWorker, SerialQueue};
pub use types::{CipherTier, EntityId, LinkKind, PartitionId, RegionKey, SessionId};
