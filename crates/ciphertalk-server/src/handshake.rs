//! Server side of the connection handshake.
//!
//! 0. Server sends its public key.
//! 1. Client sends its public key (`-1` if unparseable).
//! 2. Server sends a random token sealed to the client key.
//! 3. Client echoes the token sealed to the server key (`-2` on mismatch).
//! 4. Server forks a per-connection cipher and sends sealed `getUserID`.
//! 5. Client answers with its identity (sealed `-3` if undecodable, `-99` if
//!    some other envelope type, `-4` if invalid or taken); the session is
//!    registered and sealed `ready` sent.

use crate::config::ServerConfig;
use crate::registry::Registry;
use crate::session::Session;
use ciphertalk_core::messages::{fields, GET_USER_ID, READY};
use ciphertalk_core::{
    parse_reject_code, Envelope, FrameReader, FrameWriter, Framing, KeyPairManager, RejectCode,
    RemotePublicKey, TalkError, TalkResult,
};
use constant_time_eq::constant_time_eq;
use rand::rngs::OsRng;
use rand::RngCore;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::debug;

/// A registered session and the queue its session loop drains.
pub struct Established {
    pub session: Arc<Session>,
    pub outbound: mpsc::Receiver<Vec<u8>>,
}

pub struct ServerHandshake<'a> {
    keys: &'a KeyPairManager,
    config: &'a ServerConfig,
    registry: &'a Registry,
    deadline: Option<Instant>,
    shutdown: Option<broadcast::Receiver<()>>,
}

impl<'a> ServerHandshake<'a> {
    /// Prepare a handshake; the configured timeout starts counting now.
    pub fn new(keys: &'a KeyPairManager, config: &'a ServerConfig, registry: &'a Registry) -> Self {
        Self {
            keys,
            config,
            registry,
            deadline: config.handshake_timeout.map(|t| Instant::now() + t),
            shutdown: None,
        }
    }

    /// Give up waiting on the peer once `shutdown` fires.
    pub fn with_shutdown(mut self, shutdown: broadcast::Receiver<()>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Drive the exchange to a registered session.
    ///
    /// The deadline and the shutdown signal apply to waiting on the peer
    /// only; once the session is registered nothing can abandon it
    /// half-announced.
    pub async fn run<R, W>(
        &mut self,
        reader: &mut FrameReader<R>,
        writer: &mut FrameWriter<W>,
    ) -> TalkResult<Established>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        // Step 0: own public key, plaintext.
        writer
            .write_frame(self.keys.export_local_public().as_bytes())
            .await?;

        // Step 1: peer public key.
        let payload = self.recv(reader).await?;
        let remote = match std::str::from_utf8(&payload)
            .ok()
            .and_then(|text| RemotePublicKey::from_encoded(text).ok())
        {
            Some(remote) => remote,
            None => return reject(writer, RejectCode::InvalidPublicKey, None).await,
        };
        debug!(peer = %short(&remote.fingerprint()), "received peer public key");

        // Step 2: sealed verification token.
        let mut token = vec![0u8; self.config.verification_len];
        OsRng.fill_bytes(&mut token);
        writer.write_frame(&remote.seal(&token)?).await?;

        // Step 3: the echo must open to the same token.
        let payload = self.recv(reader).await?;
        let verified = self
            .keys
            .decrypt_from_remote(&payload)
            .map(|echo| constant_time_eq(&echo, &token))
            .unwrap_or(false);
        if !verified {
            return reject(writer, RejectCode::VerificationMismatch, None).await;
        }
        debug!(peer = %short(&remote.fingerprint()), "verification passed");

        // Step 4: per-connection context, identity request.
        let mut cipher = self.keys.fork();
        cipher.set_remote_public(remote)?;
        let request = Envelope::new(GET_USER_ID);
        writer
            .write_frame(&cipher.encrypt_to_remote(&request.encode()?)?)
            .await?;

        // Step 5: identity.
        let payload = self.recv(reader).await?;
        let reply = match cipher
            .decrypt_from_remote(&payload)
            .and_then(|plain| Envelope::decode(&plain))
        {
            Ok(reply) if reply.msg_type() == Some(GET_USER_ID) => reply,
            Ok(_) => return reject(writer, RejectCode::UnexpectedPacket, Some(&cipher)).await,
            Err(_) => return reject(writer, RejectCode::InvalidPayload, Some(&cipher)).await,
        };
        let identity = match reply.get_str(fields::USER_ID) {
            Some(identity) if self.config.identity.accepts(identity) => identity.to_string(),
            _ => return reject(writer, RejectCode::InvalidIdentity, Some(&cipher)).await,
        };

        let (session, outbound) =
            Session::new(identity.clone(), cipher, self.config.send_queue_depth);
        // Raw streams have no boundaries, so the joiner's own notice would
        // land in the same read as `ready`.
        let registered = match self.config.framing {
            Framing::LengthPrefixed => self.registry.register(session.clone()).await,
            Framing::Raw => self.registry.register_unannounced(session.clone()).await,
        };
        if let Err(TalkError::IdentityTaken(_)) = registered {
            return reject_session(writer, RejectCode::InvalidIdentity, &session).await;
        }

        let ready = Envelope::new(READY).with(fields::USER_ID, identity.as_str());
        let written = match session.seal(&ready) {
            Ok(sealed) => writer.write_frame(&sealed).await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            self.registry.unregister(&identity).await;
            return Err(e);
        }

        Ok(Established { session, outbound })
    }

    /// Next step payload. A bare integer is the peer giving up with a code;
    /// a closed stream is a premature close.
    async fn recv<R: AsyncRead + Unpin>(
        &mut self,
        reader: &mut FrameReader<R>,
    ) -> TalkResult<Vec<u8>> {
        let deadline = self.deadline;
        let frame = match self.shutdown.as_mut() {
            Some(shutdown) => tokio::select! {
                _ = shutdown.recv() => return Err(TalkError::ConnectionClosed),
                frame = read_before(deadline, reader) => frame?,
            },
            None => read_before(deadline, reader).await?,
        };
        let payload = frame.ok_or(TalkError::Handshake(RejectCode::PrematureClose))?;
        match parse_reject_code(&payload) {
            Some(code) => Err(TalkError::Handshake(code)),
            None => Ok(payload),
        }
    }
}

async fn read_before<R: AsyncRead + Unpin>(
    deadline: Option<Instant>,
    reader: &mut FrameReader<R>,
) -> TalkResult<Option<Vec<u8>>> {
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, reader.read_frame())
            .await
            .map_err(|_| TalkError::Timeout)?,
        None => reader.read_frame().await,
    }
}

/// Send `code` (sealed when a cipher is bound), close, and fail.
async fn reject<W, T>(
    writer: &mut FrameWriter<W>,
    code: RejectCode,
    cipher: Option<&KeyPairManager>,
) -> TalkResult<T>
where
    W: AsyncWrite + Unpin,
{
    let wire = match cipher {
        Some(cipher) => cipher.encrypt_to_remote(&code.to_wire()),
        None => Ok(code.to_wire()),
    };
    if let Ok(wire) = wire {
        let _ = writer.write_frame(&wire).await;
    }
    let _ = writer.shutdown().await;
    Err(TalkError::Handshake(code))
}

async fn reject_session<W, T>(
    writer: &mut FrameWriter<W>,
    code: RejectCode,
    session: &Session,
) -> TalkResult<T>
where
    W: AsyncWrite + Unpin,
{
    if let Ok(wire) = session.seal_bytes(&code.to_wire()) {
        let _ = writer.write_frame(&wire).await;
    }
    let _ = writer.shutdown().await;
    Err(TalkError::Handshake(code))
}

fn short(fp: &str) -> &str {
    ciphertalk_core::short_fingerprint(fp, 16)
}
