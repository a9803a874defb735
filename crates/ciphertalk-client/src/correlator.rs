//! Matching outbound requests to the replies that echo their `SENDER_ID`.
//!
//! Each outstanding call owns one correlation ID and one oneshot resolver.
//! The ID stays reserved until the [`PendingCall`] is dropped, so a reply
//! arriving after the caller gave up can never be mistaken for a newer call.

use ciphertalk_core::{Envelope, TalkError, TalkResult};
use rand::Rng;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, trace};

#[derive(Default)]
struct Outstanding {
    /// `None` once resolved or failed; the ID is still reserved.
    waiters: HashMap<u64, Option<oneshot::Sender<Envelope>>>,
    closed: bool,
}

#[derive(Default)]
pub struct Correlator {
    inner: Mutex<Outstanding>,
}

impl Correlator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Reserve a fresh correlation ID.
    pub fn register(self: &Arc<Self>) -> TalkResult<PendingCall> {
        let mut rng = rand::thread_rng();
        self.register_with(|| u64::from(rng.gen::<u32>()))
    }

    /// Draw IDs from `draw` until one is free.
    fn register_with(self: &Arc<Self>, mut draw: impl FnMut() -> u64) -> TalkResult<PendingCall> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(TalkError::ConnectionClosed);
        }
        let id = loop {
            let candidate = draw();
            if !inner.waiters.contains_key(&candidate) {
                break candidate;
            }
            trace!(id = candidate, "correlation id collision, redrawing");
        };
        let (tx, rx) = oneshot::channel();
        inner.waiters.insert(id, Some(tx));
        Ok(PendingCall {
            id,
            rx,
            owner: Arc::clone(self),
        })
    }

    /// Hand `envelope` to the call whose ID it echoes as `recv.SENDER_ID`.
    /// Returns whether a waiting call took it.
    pub fn resolve(&self, envelope: &Envelope) -> bool {
        let Some(id) = envelope.echoed_correlation_id() else {
            return false;
        };
        let waiter = self.lock().waiters.get_mut(&id).and_then(Option::take);
        match waiter {
            Some(tx) => tx.send(envelope.clone()).is_ok(),
            None => {
                debug!(id, "reply for unknown or settled correlation id");
                false
            }
        }
    }

    /// Fail every outstanding call and refuse new ones.
    pub fn close(&self) {
        let mut inner = self.lock();
        inner.closed = true;
        for waiter in inner.waiters.values_mut() {
            waiter.take();
        }
    }

    pub fn is_outstanding(&self, id: u64) -> bool {
        self.lock().waiters.contains_key(&id)
    }

    pub fn outstanding(&self) -> usize {
        self.lock().waiters.len()
    }

    fn release(&self, id: u64) {
        self.lock().waiters.remove(&id);
    }

    fn lock(&self) -> MutexGuard<'_, Outstanding> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One outstanding request. Dropping it releases the correlation ID.
pub struct PendingCall {
    id: u64,
    rx: oneshot::Receiver<Envelope>,
    owner: Arc<Correlator>,
}

impl PendingCall {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the reply, up to `timeout` when one is given.
    pub async fn wait(mut self, timeout: Option<Duration>) -> TalkResult<Envelope> {
        let reply = match timeout {
            Some(limit) => tokio::time::timeout(limit, &mut self.rx)
                .await
                .map_err(|_| TalkError::Timeout)?,
            None => (&mut self.rx).await,
        };
        reply.map_err(|_| TalkError::ConnectionClosed)
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        self.owner.release(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ciphertalk_core::messages::{fields, GET_USERS};

    fn reply_for(id: u64) -> Envelope {
        let request = Envelope::new(GET_USERS).with(fields::SENDER_ID, id);
        Envelope::reply_to(GET_USERS, &request).with(fields::USERS, vec!["alice", "bob"])
    }

    #[tokio::test]
    async fn reply_resolves_and_releases() {
        let correlator = Correlator::new();
        let call = correlator.register().unwrap();
        let id = call.id();
        assert!(correlator.is_outstanding(id));

        assert!(correlator.resolve(&reply_for(id)));
        let reply = call.wait(None).await.unwrap();
        assert_eq!(reply.echoed_correlation_id(), Some(id));
        assert!(!correlator.is_outstanding(id));
    }

    #[test]
    fn colliding_draws_are_rejected() {
        let correlator = Correlator::new();
        let first = correlator.register_with(|| 7).unwrap();
        let mut draws = [7u64, 7, 9].into_iter();
        let second = correlator.register_with(|| draws.next().unwrap()).unwrap();
        assert_eq!(first.id(), 7);
        assert_eq!(second.id(), 9);
    }

    #[test]
    fn settled_id_stays_reserved_until_dropped() {
        let correlator = Correlator::new();
        let call = correlator.register_with(|| 5).unwrap();
        assert!(correlator.resolve(&reply_for(5)));
        assert!(!correlator.resolve(&reply_for(5)));

        let mut draws = [5u64, 6].into_iter();
        let next = correlator.register_with(|| draws.next().unwrap()).unwrap();
        assert_eq!(next.id(), 6);

        drop(call);
        assert!(!correlator.is_outstanding(5));
        assert_eq!(correlator.outstanding(), 1);
    }

    #[test]
    fn unrelated_envelopes_are_not_claimed() {
        let correlator = Correlator::new();
        let _call = correlator.register_with(|| 1).unwrap();
        assert!(!correlator.resolve(&Envelope::new("user.connect")));
        assert!(!correlator.resolve(&reply_for(2)));
    }

    #[tokio::test]
    async fn timeout_releases_the_id() {
        let correlator = Correlator::new();
        let call = correlator.register().unwrap();
        let id = call.id();

        let result = call.wait(Some(Duration::from_millis(20))).await;
        assert!(matches!(result, Err(TalkError::Timeout)));
        assert!(!correlator.is_outstanding(id));
    }

    #[tokio::test]
    async fn close_fails_pending_and_future_calls() {
        let correlator = Correlator::new();
        let call = correlator.register().unwrap();

        correlator.close();
        assert!(matches!(call.wait(None).await, Err(TalkError::ConnectionClosed)));
        assert!(matches!(correlator.register(), Err(TalkError::ConnectionClosed)));
        assert_eq!(correlator.outstanding(), 0);
    }
}
