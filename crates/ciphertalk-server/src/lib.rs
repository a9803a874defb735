//! ciphertalk-server: relay server for ciphertalk.
//!
//! Accepts TCP connections, runs the key-exchange / verification / identity
//! handshake, registers each established session under its identity, and
//! dispatches decrypted envelopes to request handlers.

pub mod config;
pub mod dispatch;
pub mod handlers;
pub mod handshake;
pub mod keyfile;
pub mod registry;
pub mod server;
pub mod session;

pub use config::{ConfigOverrides, IdentityRules, ServerConfig};
pub use dispatch::{DispatchTable, RequestHandler};
pub use registry::Registry;
pub use server::ChatServer;
pub use session::Session;
