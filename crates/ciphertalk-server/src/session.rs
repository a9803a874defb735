//! An established, authenticated connection to one peer.
//!
//! Outbound envelopes are sealed for the peer and queued; the connection's
//! session loop is the only writer to the stream, so writes never interleave.

use ciphertalk_core::{Envelope, KeyPairManager, TalkError, TalkResult};
use std::sync::Arc;
use tokio::sync::mpsc;

pub struct Session {
    identity: String,
    cipher: KeyPairManager,
    outbound: mpsc::Sender<Vec<u8>>,
}

impl Session {
    /// Create a session and the receiving end of its outbound queue.
    pub fn new(
        identity: String,
        cipher: KeyPairManager,
        queue_depth: usize,
    ) -> (Arc<Self>, mpsc::Receiver<Vec<u8>>) {
        let (outbound, rx) = mpsc::channel(queue_depth.max(1));
        let session = Arc::new(Self {
            identity,
            cipher,
            outbound,
        });
        (session, rx)
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Fingerprint of the peer's public key.
    pub fn remote_fingerprint(&self) -> Option<String> {
        self.cipher.remote_public().map(|key| key.fingerprint())
    }

    /// Serialize and encrypt an envelope for this peer.
    pub fn seal(&self, envelope: &Envelope) -> TalkResult<Vec<u8>> {
        self.seal_bytes(&envelope.encode()?)
    }

    pub(crate) fn seal_bytes(&self, plaintext: &[u8]) -> TalkResult<Vec<u8>> {
        self.cipher
            .encrypt_to_remote(plaintext)
            .map_err(|e| match e {
                TalkError::NoRemoteKeyBound => {
                    TalkError::EncryptionFailed("no remote public key bound".into())
                }
                other => other,
            })
    }

    /// Decrypt a buffer received from this peer.
    pub fn open(&self, sealed: &[u8]) -> TalkResult<Vec<u8>> {
        self.cipher.decrypt_from_remote(sealed)
    }

    /// Seal `envelope` and queue it for delivery.
    ///
    /// Never blocks: a full queue fails with `QueueFull`, a finished session
    /// with `ConnectionClosed`.
    pub fn send(&self, envelope: &Envelope) -> TalkResult<()> {
        let sealed = self.seal(envelope)?;
        self.outbound.try_send(sealed).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TalkError::QueueFull(self.identity.clone()),
            mpsc::error::TrySendError::Closed(_) => TalkError::ConnectionClosed,
        })
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("identity", &self.identity)
            .field("cipher", &self.cipher)
            .finish()
    }
}


#[cfg(test)]
mod tests {
    use super::testing::TestPeer;
    use super::*;
    use ciphertalk_core::messages::READY;

    #[test]
    fn send_is_readable_only_by_the_peer() {
        let mut peer = TestPeer::new("alice");
        peer.session.send(&Envelope::new(READY)).unwrap();

        let sealed = peer.rx.try_recv().unwrap();
        let plain = peer.keys.decrypt_from_remote(&sealed).unwrap();
        assert_eq!(Envelope::decode(&plain).unwrap().msg_type(), Some(READY));
    }

    #[test]
    fn full_queue_is_reported() {
        let peer = TestPeer::with_depth("alice", 1);
        peer.session.send(&Envelope::new(READY)).unwrap();
        let err = peer.session.send(&Envelope::new(READY)).unwrap_err();
        assert!(matches!(err, TalkError::QueueFull(ref who) if who == "alice"));
    }

    #[test]
    fn closed_queue_is_reported() {
        let TestPeer { session, rx, .. } = TestPeer::new("alice");
        drop(rx);
        assert!(matches!(
            session.send(&Envelope::new(READY)),
            Err(TalkError::ConnectionClosed)
        ));
    }

    #[test]
    fn unbound_cipher_fails_to_encrypt() {
        let keys = KeyPairManager::generate("server").unwrap();
        let (session, _rx) = Session::new("alice".into(), keys.fork(), 4);
        assert!(matches!(
            session.send(&Envelope::new(READY)),
            Err(TalkError::EncryptionFailed(_))
        ));
        assert!(session.remote_fingerprint().is_none());
    }
}
