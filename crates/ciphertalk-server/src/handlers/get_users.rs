use crate::dispatch::RequestHandler;
use crate::registry::Registry;
use crate::session::Session;
use async_trait::async_trait;
use ciphertalk_core::messages::{fields, GET_USERS};
use ciphertalk_core::{Envelope, TalkResult};
use std::sync::Arc;

/// `getUsers`: reply with the registered identities.
pub struct GetUsers;

#[async_trait]
impl RequestHandler for GetUsers {
    async fn handle(
        &self,
        request: Envelope,
        session: &Arc<Session>,
        registry: &Registry,
    ) -> TalkResult<()> {
        let users = registry.identities().await;
        session.send(&Envelope::reply_to(GET_USERS, &request).with(fields::USERS, users))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::testing::TestPeer;
    use serde_json::json;

    #[tokio::test]
    async fn lists_registered_identities() {
        let registry = Registry::new();
        let mut bob = TestPeer::new("bob");
        let alice = TestPeer::new("alice");
        registry.register(bob.session.clone()).await.unwrap();
        registry.register(alice.session.clone()).await.unwrap();
        bob.drain();

        let request = Envelope::new(GET_USERS).with(fields::SENDER_ID, 99u64);
        GetUsers.handle(request, &bob.session, &registry).await.unwrap();

        let got = bob.drain();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].get(fields::USERS), Some(&json!(["alice", "bob"])));
        assert_eq!(got[0].echoed_correlation_id(), Some(99));
    }
}
