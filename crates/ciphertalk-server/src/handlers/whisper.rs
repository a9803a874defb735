use crate::dispatch::RequestHandler;
use crate::registry::Registry;
use crate::session::Session;
use async_trait::async_trait;
use ciphertalk_core::messages::{
    fields, ERROR_INVALID_MESSAGE, ERROR_INVALID_PARAMETERS, ERROR_INVALID_USER, WHISPER,
    WHISPER_OK,
};
use ciphertalk_core::{Envelope, TalkError, TalkResult};
use std::sync::Arc;
use tracing::{debug, warn};

/// `whisper {user, message}`: deliver a message to one named session only.
///
/// Checks run in order: both fields are strings, the target is registered,
/// the message is not blank. A target whose queue is closed or full gets
/// `error.invalidUser`, so the sender is always answered.
pub struct Whisper;

#[async_trait]
impl RequestHandler for Whisper {
    async fn handle(
        &self,
        request: Envelope,
        session: &Arc<Session>,
        registry: &Registry,
    ) -> TalkResult<()> {
        let (target, message) = match (
            request.get_str(fields::USER),
            request.get_str(fields::MESSAGE),
        ) {
            (Some(target), Some(message)) => (target.to_string(), message.trim().to_string()),
            _ => return session.send(&Envelope::reply_to(ERROR_INVALID_PARAMETERS, &request)),
        };

        let Some(recipient) = registry.lookup(&target).await else {
            return session.send(&Envelope::reply_to(ERROR_INVALID_USER, &request));
        };

        if message.is_empty() {
            return session.send(&Envelope::reply_to(ERROR_INVALID_MESSAGE, &request));
        }

        let delivered = recipient.send(
            &Envelope::new(WHISPER)
                .with(fields::FROM, session.identity())
                .with(fields::MESSAGE, message),
        );
        let reply = match delivered {
            Ok(()) => {
                debug!(from = %session.identity(), to = %target, "whisper");
                WHISPER_OK
            }
            // The target is leaving or not keeping up; to the sender it is gone.
            Err(e @ (TalkError::QueueFull(_) | TalkError::ConnectionClosed)) => {
                warn!(from = %session.identity(), to = %target, error = %e, "whisper not delivered");
                ERROR_INVALID_USER
            }
            Err(e) => {
                warn!(from = %session.identity(), to = %target, error = %e, "whisper not delivered");
                ERROR_INVALID_MESSAGE
            }
        };
        session.send(&Envelope::reply_to(reply, &request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::testing::TestPeer;

    async fn trio() -> (Registry, TestPeer, TestPeer, TestPeer) {
        let registry = Registry::new();
        let mut peers = [
            TestPeer::new("alice"),
            TestPeer::new("bob"),
            TestPeer::new("carol"),
        ];
        for peer in &peers {
            registry.register(peer.session.clone()).await.unwrap();
        }
        for peer in &mut peers {
            peer.drain();
        }
        let [a, b, c] = peers;
        (registry, a, b, c)
    }

    #[tokio::test]
    async fn delivered_only_to_target() {
        let (registry, mut alice, mut bob, mut carol) = trio().await;

        let request = Envelope::new(WHISPER)
            .with(fields::USER, "bob")
            .with(fields::MESSAGE, "  psst  ")
            .with(fields::SENDER_ID, 11u64);
        Whisper.handle(request, &alice.session, &registry).await.unwrap();

        let to_bob = bob.drain();
        assert_eq!(to_bob.len(), 1);
        assert_eq!(to_bob[0].msg_type(), Some(WHISPER));
        assert_eq!(to_bob[0].get_str(fields::FROM), Some("alice"));
        assert_eq!(to_bob[0].get_str(fields::MESSAGE), Some("psst"));

        let to_alice = alice.drain();
        assert_eq!(to_alice.len(), 1);
        assert_eq!(to_alice[0].msg_type(), Some(WHISPER_OK));
        assert_eq!(to_alice[0].echoed_correlation_id(), Some(11));

        assert!(carol.drain().is_empty());
    }

    #[tokio::test]
    async fn unknown_target_is_invalid_user() {
        let (registry, mut alice, mut bob, _carol) = trio().await;

        let request = Envelope::new(WHISPER)
            .with(fields::USER, "mallory")
            .with(fields::MESSAGE, "hi");
        Whisper.handle(request, &alice.session, &registry).await.unwrap();

        assert_eq!(alice.drain()[0].msg_type(), Some(ERROR_INVALID_USER));
        assert!(bob.drain().is_empty());
    }

    #[tokio::test]
    async fn blank_message_is_invalid_message() {
        let (registry, mut alice, mut bob, _carol) = trio().await;

        let request = Envelope::new(WHISPER)
            .with(fields::USER, "bob")
            .with(fields::MESSAGE, " \t ");
        Whisper.handle(request, &alice.session, &registry).await.unwrap();

        let got = alice.drain();
        assert_eq!(got[0].msg_type(), Some(ERROR_INVALID_MESSAGE));
        assert_eq!(got[0].get(fields::RECV).and_then(|r| r.get(fields::USER)), Some(&serde_json::Value::from("bob")));
        assert!(bob.drain().is_empty());
    }

    #[tokio::test]
    async fn undeliverable_target_is_invalid_user() {
        let registry = Registry::new();
        let mut alice = TestPeer::new("alice");
        let TestPeer { session: bob, rx, .. } = TestPeer::new("bob");
        registry.register(alice.session.clone()).await.unwrap();
        registry.register(bob).await.unwrap();
        drop(rx);
        alice.drain();

        let request = Envelope::new(WHISPER)
            .with(fields::USER, "bob")
            .with(fields::MESSAGE, "anyone there?")
            .with(fields::SENDER_ID, 7u64);
        Whisper.handle(request, &alice.session, &registry).await.unwrap();

        let got = alice.drain();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].msg_type(), Some(ERROR_INVALID_USER));
        assert_eq!(got[0].echoed_correlation_id(), Some(7));
    }

    #[tokio::test]
    async fn full_target_queue_is_invalid_user() {
        let registry = Registry::new();
        let mut alice = TestPeer::new("alice");
        let bob = TestPeer::with_depth("bob", 1);
        registry.register(alice.session.clone()).await.unwrap();
        // Bob's own join notice fills his queue.
        registry.register(bob.session.clone()).await.unwrap();
        alice.drain();

        let request = Envelope::new(WHISPER)
            .with(fields::USER, "bob")
            .with(fields::MESSAGE, "hello");
        Whisper.handle(request, &alice.session, &registry).await.unwrap();

        assert_eq!(alice.drain()[0].msg_type(), Some(ERROR_INVALID_USER));
    }

    #[tokio::test]
    async fn non_string_fields_are_invalid_parameters() {
        let (registry, mut alice, _bob, _carol) = trio().await;

        let request = Envelope::new(WHISPER).with(fields::USER, "bob");
        Whisper.handle(request, &alice.session, &registry).await.unwrap();
        let request = Envelope::new(WHISPER)
            .with(fields::USER, 5)
            .with(fields::MESSAGE, "hi");
        Whisper.handle(request, &alice.session, &registry).await.unwrap();

        let got = alice.drain();
        assert_eq!(got.len(), 2);
        assert!(got.iter().all(|e| e.msg_type() == Some(ERROR_INVALID_PARAMETERS)));
    }
}
