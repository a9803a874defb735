//! Client-side routing of inbound envelopes by `type`.

use ciphertalk_core::Envelope;
use std::collections::HashMap;
use std::fmt;
use tracing::{trace, warn};

pub type Handler = Box<dyn Fn(&Envelope) + Send + Sync>;

/// One handler per envelope type, fixed before the connection starts.
#[derive(Default)]
pub struct ClientDispatch {
    handlers: HashMap<String, Handler>,
}

impl ClientDispatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route envelopes of `msg_type` to `handler`, replacing any previous one.
    pub fn on<F>(mut self, msg_type: &str, handler: F) -> Self
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        self.handlers.insert(msg_type.to_string(), Box::new(handler));
        self
    }

    pub fn contains(&self, msg_type: &str) -> bool {
        self.handlers.contains_key(msg_type)
    }

    /// Run the handler for `envelope`'s type. Returns whether one ran.
    pub fn dispatch(&self, envelope: &Envelope) -> bool {
        let Some(msg_type) = envelope.msg_type() else {
            warn!("envelope without a type, dropped");
            return false;
        };
        match self.handlers.get(msg_type) {
            Some(handler) => {
                handler(envelope);
                true
            }
            None => {
                trace!(msg_type, "no handler registered");
                false
            }
        }
    }
}

impl fmt::Debug for ClientDispatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        f.debug_struct("ClientDispatch").field("types", &types).finish()
    }
}
