//! Routes decoded envelopes to request handlers by `type`.

use crate::handlers::{BroadcastMessage, GetUsers, Whisper};
use crate::registry::Registry;
use crate::session::Session;
use async_trait::async_trait;
use ciphertalk_core::messages::{
    fields, BROADCAST_MESSAGE, ERROR_INVALID_JSON, ERROR_INVALID_PACKET_TYPE, GET_USERS, WHISPER,
};
use ciphertalk_core::{Envelope, TalkResult};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Handles one envelope `type`.
///
/// Application errors are answered with an `error.*` envelope on `session`;
/// an `Err` return means a reply could not be delivered.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(
        &self,
        request: Envelope,
        session: &Arc<Session>,
        registry: &Registry,
    ) -> TalkResult<()>;
}

#[derive(Default)]
pub struct DispatchTable {
    handlers: HashMap<String, Arc<dyn RequestHandler>>,
}

impl DispatchTable {
    /// An empty table: every type is answered with `error.invalidPacketType`.
    pub fn new() -> Self {
        Self::default()
    }

    /// `broadcastMessage`, `whisper` and `getUsers`.
    pub fn with_builtin_handlers() -> Self {
        let mut table = Self::new();
        table.register(BROADCAST_MESSAGE, BroadcastMessage);
        table.register(WHISPER, Whisper);
        table.register(GET_USERS, GetUsers);
        table
    }

    /// Route `msg_type` to `handler`, returning any handler it replaces.
    pub fn register(
        &mut self,
        msg_type: impl Into<String>,
        handler: impl RequestHandler + 'static,
    ) -> Option<Arc<dyn RequestHandler>> {
        self.handlers.insert(msg_type.into(), Arc::new(handler))
    }

    pub fn contains(&self, msg_type: &str) -> bool {
        self.handlers.contains_key(msg_type)
    }

    pub fn types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    /// Dispatch a decoded envelope from `session`.
    pub async fn dispatch(
        &self,
        request: Envelope,
        session: &Arc<Session>,
        registry: &Registry,
    ) -> TalkResult<()> {
        let handler = match request.msg_type() {
            Some(msg_type) => self.handlers.get(msg_type).cloned(),
            None => {
                warn!(user = %session.identity(), "envelope without type dropped");
                return Ok(());
            }
        };

        match handler {
            Some(handler) => handler.handle(request, session, registry).await,
            None => {
                debug!(
                    user = %session.identity(),
                    msg_type = request.msg_type().unwrap_or_default(),
                    "unknown packet type"
                );
                session.send(&Envelope::reply_to(ERROR_INVALID_PACKET_TYPE, &request))
            }
        }
    }

    /// Decrypt, decode and dispatch one buffer read from `session`'s stream.
    ///
    /// Undecryptable buffers are dropped. Plaintext that is not a JSON object
    /// is answered with `error.invalidJSON` carrying the text as `recv`.
    pub async fn dispatch_buffer(
        &self,
        sealed: &[u8],
        session: &Arc<Session>,
        registry: &Registry,
    ) -> TalkResult<()> {
        let plaintext = match session.open(sealed) {
            Ok(plaintext) => plaintext,
            Err(e) => {
                warn!(user = %session.identity(), len = sealed.len(), error = %e, "dropping undecryptable buffer");
                return Ok(());
            }
        };

        match Envelope::decode(&plaintext) {
            Ok(request) => self.dispatch(request, session, registry).await,
            Err(e) => {
                debug!(user = %session.identity(), error = %e, "invalid JSON");
                let text = String::from_utf8_lossy(&plaintext).into_owned();
                session.send(&Envelope::new(ERROR_INVALID_JSON).with(fields::RECV, text))
            }
        }
    }
}
