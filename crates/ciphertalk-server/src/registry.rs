//! Registry of established sessions, keyed by identity.
//!
//! Membership changes are announced to every registered session while the
//! write lock is held, so each `user.connect`/`user.disconnect` is ordered
//! with the change it describes.

use crate::session::Session;
use ciphertalk_core::messages::{fields, USER_CONNECT, USER_DISCONNECT};
use ciphertalk_core::{Envelope, TalkError, TalkResult};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

#[derive(Clone, Default)]
pub struct Registry {
    sessions: Arc<RwLock<HashMap<String, Arc<Session>>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a session under its identity and announce it to everyone,
    /// the new session included.
    ///
    /// Fails with `IdentityTaken` if a live session already holds the name;
    /// the existing session is left untouched.
    pub async fn register(&self, session: Arc<Session>) -> TalkResult<()> {
        self.insert(session, true).await
    }

    /// Like [`register`](Self::register), but the new session is left out of
    /// its own `user.connect`.
    ///
    /// Unframed streams need this: nothing may be written straight after
    /// `ready`, or the peer reads both as one buffer.
    pub async fn register_unannounced(&self, session: Arc<Session>) -> TalkResult<()> {
        self.insert(session, false).await
    }

    async fn insert(&self, session: Arc<Session>, notify_self: bool) -> TalkResult<()> {
        let mut sessions = self.sessions.write().await;
        let identity = session.identity().to_string();
        if sessions.contains_key(&identity) {
            return Err(TalkError::IdentityTaken(identity));
        }
        let notice = Envelope::new(USER_CONNECT).with(fields::USER, identity.as_str());
        if !notify_self {
            fan_out(&sessions, &notice);
        }
        sessions.insert(identity.clone(), session);
        info!(user = %identity, users = sessions.len(), "joined");
        if notify_self {
            fan_out(&sessions, &notice);
        }
        Ok(())
    }

    /// Remove a session and announce its departure. Returns the removed
    /// session, or `None` if the identity was not registered.
    pub async fn unregister(&self, identity: &str) -> Option<Arc<Session>> {
        let mut sessions = self.sessions.write().await;
        let removed = sessions.remove(identity)?;
        info!(user = %identity, users = sessions.len(), "left");

        let notice = Envelope::new(USER_DISCONNECT).with(fields::USER, identity);
        fan_out(&sessions, &notice);
        Some(removed)
    }

    /// Send `envelope` to every registered session, sealed separately for
    /// each. Returns how many sessions accepted it.
    pub async fn broadcast(&self, envelope: &Envelope) -> usize {
        let sessions = self.sessions.read().await;
        fan_out(&sessions, envelope)
    }

    pub async fn lookup(&self, identity: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(identity).cloned()
    }

    pub async fn contains(&self, identity: &str) -> bool {
        self.sessions.read().await.contains_key(identity)
    }

    /// Registered identities, sorted.
    pub async fn identities(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

fn fan_out(sessions: &HashMap<String, Arc<Session>>, envelope: &Envelope) -> usize {
    let mut delivered = 0;
    for (identity, session) in sessions {
        match session.send(envelope) {
            Ok(()) => delivered += 1,
            Err(e) => warn!(user = %identity, error = %e, "broadcast delivery failed"),
        }
    }
    debug!(
        msg_type = envelope.msg_type().unwrap_or_default(),
        delivered,
        total = sessions.len(),
        "broadcast"
    );
    delivered
}
