//! ciphertalk-core: Shared protocol library for ciphertalk.
//!
//! Provides X25519 sealed-box key contexts, JSON envelopes and their type
//! vocabulary, handshake rejection codes, frame codec, and the
//! message-oriented stream halves used by both server and client.

pub mod codec;
pub mod envelope;
pub mod error;
pub mod handshake;
pub mod identity;
pub mod keys;
pub mod messages;
pub mod transport;

// Re-export commonly used items at crate root.
pub use codec::{frame_encode, FrameDecoder};
pub use envelope::Envelope;
pub use error::{TalkError, TalkResult};
pub use handshake::{parse_reject_code, RejectCode, DEFAULT_VERIFICATION_LEN, MIN_VERIFICATION_LEN};
pub use identity::{fingerprint, short_fingerprint};
pub use keys::{KeyPairManager, RemotePublicKey, MAX_PLAINTEXT_LEN, SEAL_OVERHEAD};
pub use transport::{split_stream, FrameReader, FrameWriter, Framing, DEFAULT_MAX_FRAME_LEN};
