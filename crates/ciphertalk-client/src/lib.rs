//! ciphertalk-client: Rust client library for ciphertalk.
//!
//! Runs the client half of the key-exchange handshake, then exchanges sealed
//! envelopes with the server: fire-and-forget sends, correlated
//! request/response calls, and per-type handlers for server pushes.

pub mod client;
pub mod correlator;
pub mod dispatch;
pub mod handshake;

pub use client::{random_user, ChatClient, ClientConfig};
pub use correlator::{Correlator, PendingCall};
pub use dispatch::ClientDispatch;
pub use handshake::{ClientHandshake, Negotiated};
