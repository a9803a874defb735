//! Client side of the connection handshake.
//!
//! 1. Receive the server public key, answer with our own (`-1` if the
//!    server key is unparseable).
//! 3. Open the sealed verification token and echo it sealed to the server.
//! 5. Answer the sealed `getUserID` request with our identity.
//! 7. Wait for sealed `ready`.
//!
//! A bare integer in place of any step payload, plaintext or sealed, is the
//! server rejecting us; a close before `ready` is `-98` and an envelope of the
//! wrong type at steps 5 or 7 is `-99`.

use ciphertalk_core::messages::{fields, GET_USER_ID, READY};
use ciphertalk_core::{
    parse_reject_code, Envelope, FrameReader, FrameWriter, KeyPairManager, RejectCode,
    RemotePublicKey, TalkError, TalkResult,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant;
use tracing::debug;

/// Outcome of a completed handshake.
#[derive(Debug)]
pub struct Negotiated {
    /// Per-connection context bound to the server key.
    pub cipher: KeyPairManager,
    /// The server's `ready` envelope.
    pub ready: Envelope,
}

pub struct ClientHandshake<'a> {
    keys: &'a KeyPairManager,
    user_id: &'a str,
    deadline: Option<Instant>,
}

impl<'a> ClientHandshake<'a> {
    pub fn new(keys: &'a KeyPairManager, user_id: &'a str) -> Self {
        Self {
            keys,
            user_id,
            deadline: None,
        }
    }

    /// Fail with [`TalkError::Timeout`] if the server is still mid-exchange at `deadline`.
    pub fn with_deadline(mut self, deadline: Option<Instant>) -> Self {
        self.deadline = deadline;
        self
    }

    pub async fn run<R, W>(
        &self,
        reader: &mut FrameReader<R>,
        writer: &mut FrameWriter<W>,
    ) -> TalkResult<Negotiated>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        // Step 1: server key in, own key out.
        let payload = self.recv(reader).await?;
        let remote = match std::str::from_utf8(&payload)
            .ok()
            .and_then(|text| RemotePublicKey::from_encoded(text.trim()).ok())
        {
            Some(remote) => remote,
            None => {
                let _ = writer.write_frame(&RejectCode::InvalidPublicKey.to_wire()).await;
                return abort(writer, RejectCode::InvalidPublicKey).await;
            }
        };
        debug!(server = %short(&remote.fingerprint()), "received server public key");
        let mut cipher = self.keys.fork();
        cipher.set_remote_public(remote)?;
        writer
            .write_frame(self.keys.export_local_public().as_bytes())
            .await?;

        // Step 3: decrypt-then-reencrypt echo of the token.
        let payload = self.recv(reader).await?;
        let token = match cipher.decrypt_from_remote(&payload) {
            Ok(token) => token,
            Err(_) => return abort(writer, RejectCode::VerificationMismatch).await,
        };
        writer.write_frame(&cipher.encrypt_to_remote(&token)?).await?;
        debug!("verification token echoed");

        // Step 5: identity request.
        let request = self.recv_sealed(reader, writer, &cipher).await?;
        if request.msg_type() != Some(GET_USER_ID) {
            return abort(writer, RejectCode::UnexpectedPacket).await;
        }
        let reply = Envelope::reply_to(GET_USER_ID, &request).with(fields::USER_ID, self.user_id);
        writer
            .write_frame(&cipher.encrypt_to_remote(&reply.encode()?)?)
            .await?;

        // Step 7: ready.
        let ready = self.recv_sealed(reader, writer, &cipher).await?;
        if ready.msg_type() != Some(READY) {
            return abort(writer, RejectCode::UnexpectedPacket).await;
        }
        debug!(user = %self.user_id, "handshake complete");

        Ok(Negotiated { cipher, ready })
    }

    async fn recv<R: AsyncRead + Unpin>(&self, reader: &mut FrameReader<R>) -> TalkResult<Vec<u8>> {
        let frame = match self.deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, reader.read_frame())
                .await
                .map_err(|_| TalkError::Timeout)??,
            None => reader.read_frame().await?,
        };
        let payload = frame.ok_or(TalkError::Handshake(RejectCode::PrematureClose))?;
        match parse_reject_code(&payload) {
            Some(code) => Err(TalkError::Handshake(code)),
            None => Ok(payload),
        }
    }

    /// A sealed step payload: either a sealed reject code or an envelope.
    async fn recv_sealed<R, W>(
        &self,
        reader: &mut FrameReader<R>,
        writer: &mut FrameWriter<W>,
        cipher: &KeyPairManager,
    ) -> TalkResult<Envelope>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let payload = self.recv(reader).await?;
        let plain = match cipher.decrypt_from_remote(&payload) {
            Ok(plain) => plain,
            Err(_) => return abort(writer, RejectCode::UnexpectedPacket).await,
        };
        if let Some(code) = parse_reject_code(&plain) {
            let _ = writer.shutdown().await;
            return Err(TalkError::Handshake(code));
        }
        match Envelope::decode(&plain) {
            Ok(envelope) => Ok(envelope),
            Err(_) => abort(writer, RejectCode::UnexpectedPacket).await,
        }
    }
}

/// Close our side and fail with `code`.
async fn abort<W, T>(writer: &mut FrameWriter<W>, code: RejectCode) -> TalkResult<T>
where
    W: AsyncWrite + Unpin,
{
    let _ = writer.shutdown().await;
    Err(TalkError::Handshake(code))
}

fn short(fp: &str) -> &str {
    ciphertalk_core::short_fingerprint(fp, 16)
}
