use crate::dispatch::RequestHandler;
use crate::registry::Registry;
use crate::session::Session;
use async_trait::async_trait;
use ciphertalk_core::messages::{fields, BROADCAST_MESSAGE, ERROR_INVALID_PARAMETERS};
use ciphertalk_core::{Envelope, TalkResult};
use std::sync::Arc;
use tracing::info;

/// `broadcastMessage {message}`: relay a chat line to every session.
pub struct BroadcastMessage;

#[async_trait]
impl RequestHandler for BroadcastMessage {
    async fn handle(
        &self,
        request: Envelope,
        session: &Arc<Session>,
        registry: &Registry,
    ) -> TalkResult<()> {
        let message = match request.get_str(fields::MESSAGE) {
            Some(message) if !message.trim().is_empty() => message.to_string(),
            _ => return session.send(&Envelope::reply_to(ERROR_INVALID_PARAMETERS, &request)),
        };

        info!(author = %session.identity(), len = message.len(), "message");
        let relay = Envelope::new(BROADCAST_MESSAGE)
            .with(fields::AUTHOR, session.identity())
            .with(fields::MESSAGE, message);
        registry.broadcast(&relay).await;
        Ok(())
    }
}
