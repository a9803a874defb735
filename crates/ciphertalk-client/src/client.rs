//! The ciphertalk client connection.
//!
//! After the handshake a reader task owns the receive half: every sealed
//! buffer is opened, offered to the request correlator, published on the
//! event channel, and finally routed through the [`ClientDispatch`] table.
//! Sends go straight to the write half under a lock.

use crate::correlator::Correlator;
use crate::dispatch::ClientDispatch;
use crate::handshake::{ClientHandshake, Negotiated};
use ciphertalk_core::messages::{fields, BROADCAST_MESSAGE, GET_USERS, WHISPER, WHISPER_OK};
use ciphertalk_core::{
    Envelope, FrameReader, FrameWriter, Framing, KeyPairManager, TalkError, TalkResult,
    DEFAULT_MAX_FRAME_LEN,
};
use rand::Rng;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// Capacity of the event channel handed out by [`ChatClient::subscribe`].
const EVENT_CAPACITY: usize = 256;

/// Configuration for connecting to a ciphertalk server.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    /// Identity to claim during the handshake.
    pub user: String,
    pub framing: Framing,
    pub max_frame_len: usize,
    /// Budget for TCP connect plus handshake (`None` waits forever).
    pub connect_timeout: Option<Duration>,
    /// How long a request waits for its reply (`None` waits forever).
    pub request_timeout: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6978,
            user: random_user(),
            framing: Framing::default(),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            connect_timeout: Some(Duration::from_secs(10)),
            request_timeout: Some(Duration::from_secs(30)),
        }
    }
}

impl ClientConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// A throwaway identity like `user-417`.
pub fn random_user() -> String {
    format!("user-{}", rand::thread_rng().gen_range(0..1000))
}

/// An established, authenticated connection.
pub struct ChatClient {
    identity: String,
    server_fingerprint: String,
    cipher: Arc<KeyPairManager>,
    writer: Mutex<FrameWriter<BoxedWrite>>,
    correlator: Arc<Correlator>,
    events: broadcast::Sender<Envelope>,
    reader_handle: JoinHandle<()>,
    /// Sender side lives in the reader task; it drops when the task ends.
    alive: watch::Receiver<()>,
    request_timeout: Option<Duration>,
}

impl ChatClient {
    /// Connect over TCP and authenticate with `keys`.
    pub async fn connect(config: &ClientConfig, keys: &KeyPairManager) -> TalkResult<Self> {
        Self::connect_with(config, keys, ClientDispatch::new()).await
    }

    /// [`connect`](Self::connect) with handlers for inbound envelope types.
    pub async fn connect_with(
        config: &ClientConfig,
        keys: &KeyPairManager,
        dispatch: ClientDispatch,
    ) -> TalkResult<Self> {
        let deadline = config.connect_timeout.map(|t| Instant::now() + t);
        let addr = config.addr();

        let connecting = TcpStream::connect(&addr);
        let stream = match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, connecting)
                .await
                .map_err(|_| TalkError::Timeout)?,
            None => connecting.await,
        }
        .map_err(|e| TalkError::Transport(format!("cannot connect to {addr}: {e}")))?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "set_nodelay failed");
        }

        Self::establish(stream, config, keys, dispatch, deadline).await
    }

    /// Run the handshake over an already-open stream and start the reader task.
    pub async fn establish<S>(
        stream: S,
        config: &ClientConfig,
        keys: &KeyPairManager,
        dispatch: ClientDispatch,
        deadline: Option<Instant>,
    ) -> TalkResult<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = FrameReader::new(read_half, config.framing, config.max_frame_len);
        let mut writer = FrameWriter::new(
            Box::new(write_half) as BoxedWrite,
            config.framing,
            config.max_frame_len,
        );

        let Negotiated { cipher, ready } = ClientHandshake::new(keys, &config.user)
            .with_deadline(deadline)
            .run(&mut reader, &mut writer)
            .await?;

        let identity = ready
            .get_str(fields::USER_ID)
            .unwrap_or(&config.user)
            .to_string();
        let server_fingerprint = cipher
            .remote_public()
            .map(|key| key.fingerprint())
            .unwrap_or_default();
        info!(
            user = %identity,
            server = %ciphertalk_core::short_fingerprint(&server_fingerprint, 16),
            "connected"
        );

        let cipher = Arc::new(cipher);
        let correlator = Correlator::new();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (alive_tx, alive) = watch::channel(());

        let reader_handle = tokio::spawn(read_loop(
            reader,
            alive_tx,
            Arc::clone(&cipher),
            Arc::clone(&correlator),
            events.clone(),
            dispatch,
        ));

        Ok(Self {
            identity,
            server_fingerprint,
            cipher,
            writer: Mutex::new(writer),
            correlator,
            events,
            reader_handle,
            alive,
            request_timeout: config.request_timeout,
        })
    }

    /// The identity the server acknowledged.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn server_fingerprint(&self) -> &str {
        &self.server_fingerprint
    }

    /// Whether the reader task is still running.
    pub fn is_connected(&self) -> bool {
        self.alive.has_changed().is_ok()
    }

    /// Resolves once the connection has ended, from either side.
    pub async fn closed(&self) {
        let mut alive = self.alive.clone();
        while alive.changed().await.is_ok() {}
    }

    /// Correlation IDs still reserved by in-flight calls.
    pub fn pending_requests(&self) -> usize {
        self.correlator.outstanding()
    }

    /// Every inbound envelope, in arrival order.
    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.events.subscribe()
    }

    /// Seal and write one envelope.
    pub async fn send(&self, envelope: &Envelope) -> TalkResult<()> {
        let sealed = self
            .cipher
            .encrypt_to_remote(&envelope.encode()?)
            .map_err(|e| match e {
                TalkError::NoRemoteKeyBound => TalkError::EncryptionFailed(e.to_string()),
                other => other,
            })?;
        self.writer.lock().await.write_frame(&sealed).await
    }

    /// Send `request` tagged with a fresh `SENDER_ID` and wait for the
    /// envelope that echoes it.
    pub async fn call_and_await(&self, mut request: Envelope) -> TalkResult<Envelope> {
        let call = self.correlator.register()?;
        request.insert(fields::SENDER_ID, call.id());
        self.send(&request).await?;
        call.wait(self.request_timeout).await
    }

    /// Broadcast `text` to every connected user.
    pub async fn broadcast_message(&self, text: &str) -> TalkResult<()> {
        self.send(&Envelope::new(BROADCAST_MESSAGE).with(fields::MESSAGE, text))
            .await
    }

    /// Send `text` to `user` alone.
    pub async fn whisper(&self, user: &str, text: &str) -> TalkResult<()> {
        let request = Envelope::new(WHISPER)
            .with(fields::USER, user)
            .with(fields::MESSAGE, text);
        expect_reply(self.call_and_await(request).await?, WHISPER_OK).map(|_| ())
    }

    /// Identities currently connected, sorted.
    pub async fn get_users(&self) -> TalkResult<Vec<String>> {
        let reply = expect_reply(self.call_and_await(Envelope::new(GET_USERS)).await?, GET_USERS)?;
        let users = reply
            .get(fields::USERS)
            .and_then(Value::as_array)
            .ok_or_else(|| TalkError::Codec("getUsers reply without a users list".into()))?;
        users
            .iter()
            .map(|user| {
                user.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| TalkError::Codec("non-string entry in users".into()))
            })
            .collect()
    }

    /// Close the connection; pending calls fail with `ConnectionClosed`.
    pub async fn close(&self) -> TalkResult<()> {
        self.correlator.close();
        self.reader_handle.abort();
        self.writer.lock().await.shutdown().await
    }
}

impl Drop for ChatClient {
    fn drop(&mut self) {
        self.correlator.close();
        self.reader_handle.abort();
    }
}

/// Map an `error.*` reply to [`TalkError::Remote`] and check the reply type.
fn expect_reply(reply: Envelope, expected: &str) -> TalkResult<Envelope> {
    match reply.msg_type() {
        Some(t) if reply.is_error() => Err(TalkError::Remote(t.to_string())),
        Some(t) if t == expected => Ok(reply),
        other => Err(TalkError::Codec(format!(
            "expected {expected} reply, got {}",
            other.unwrap_or("untyped envelope")
        ))),
    }
}

async fn read_loop<S>(
    mut reader: FrameReader<ReadHalf<S>>,
    _alive: watch::Sender<()>,
    cipher: Arc<KeyPairManager>,
    correlator: Arc<Correlator>,
    events: broadcast::Sender<Envelope>,
    dispatch: ClientDispatch,
) where
    S: AsyncRead,
{
    loop {
        match reader.read_frame().await {
            Ok(Some(sealed)) => {
                let Some(envelope) = open(&cipher, &sealed) else {
                    continue;
                };
                correlator.resolve(&envelope);
                let _ = events.send(envelope.clone());
                dispatch.dispatch(&envelope);
            }
            Ok(None) => {
                info!("server closed the connection");
                break;
            }
            Err(e) => {
                warn!(error = %e, "read failed, closing");
                break;
            }
        }
    }
    correlator.close();
}

/// Decrypt and decode one buffer; failures are logged and dropped.
fn open(cipher: &KeyPairManager, sealed: &[u8]) -> Option<Envelope> {
    let plain = match cipher.decrypt_from_remote(sealed) {
        Ok(plain) => plain,
        Err(e) => {
            warn!(error = %e, len = sealed.len(), "undecryptable buffer dropped");
            return None;
        }
    };
    match Envelope::decode(&plain) {
        Ok(envelope) => Some(envelope),
        Err(e) => {
            warn!(error = %e, "undecodable envelope dropped");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::testing::ScriptedServer;
    use ciphertalk_core::messages::{ERROR_INVALID_USER, USER_CONNECT};

    async fn connected(dispatch: ClientDispatch) -> (ChatClient, ScriptedServer) {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let config = ClientConfig {
            user: "alice".into(),
            request_timeout: Some(Duration::from_secs(5)),
            ..ClientConfig::default()
        };
        let keys = KeyPairManager::generate("client").unwrap();
        let mut server = ScriptedServer::new(server_io);
        let (client, identity) = tokio::join!(
            ChatClient::establish(client_io, &config, &keys, dispatch, None),
            server.accept()
        );
        assert_eq!(identity, "alice");
        (client.unwrap(), server)
    }

    #[tokio::test]
    async fn handshake_yields_identity_and_fingerprint() {
        let (client, server) = connected(ClientDispatch::new()).await;
        assert_eq!(client.identity(), "alice");
        assert_eq!(client.server_fingerprint(), server.keys.fingerprint());
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn get_users_round_trip_through_correlator() {
        let (client, mut server) = connected(ClientDispatch::new()).await;
        let client = Arc::new(client);

        let caller = Arc::clone(&client);
        let call = tokio::spawn(async move { caller.get_users().await });

        let request = server.open_next().await.unwrap();
        assert_eq!(request.msg_type(), Some(GET_USERS));
        let id = request.correlation_id().unwrap();
        assert!(client.correlator.is_outstanding(id));

        server
            .send_sealed(&Envelope::reply_to(GET_USERS, &request).with(fields::USERS, vec!["alice", "bob"]))
            .await;

        assert_eq!(call.await.unwrap().unwrap(), vec!["alice", "bob"]);
        assert!(!client.correlator.is_outstanding(id));
    }

    #[tokio::test]
    async fn error_reply_becomes_remote_error() {
        let (client, mut server) = connected(ClientDispatch::new()).await;
        let client = Arc::new(client);

        let caller = Arc::clone(&client);
        let call = tokio::spawn(async move { caller.whisper("nobody", "hi").await });

        let request = server.open_next().await.unwrap();
        assert_eq!(request.get_str(fields::USER), Some("nobody"));
        server
            .send_sealed(&Envelope::reply_to(ERROR_INVALID_USER, &request))
            .await;

        match call.await.unwrap() {
            Err(TalkError::Remote(t)) => assert_eq!(t, ERROR_INVALID_USER),
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[tokio::test]
    async fn inbound_envelopes_reach_subscribers_and_handlers() {
        let (tx, mut handled) = tokio::sync::mpsc::unbounded_channel();
        let dispatch = ClientDispatch::new().on(USER_CONNECT, move |env| {
            let _ = tx.send(env.get_str(fields::USER).unwrap_or_default().to_string());
        });
        let (client, mut server) = connected(dispatch).await;
        let mut events = client.subscribe();

        server
            .send_sealed(&Envelope::new(USER_CONNECT).with(fields::USER, "bob"))
            .await;

        let event = events.recv().await.unwrap();
        assert_eq!(event.msg_type(), Some(USER_CONNECT));
        assert_eq!(handled.recv().await.unwrap(), "bob");
    }

    #[tokio::test]
    async fn garbage_buffers_do_not_end_the_session() {
        let (client, mut server) = connected(ClientDispatch::new()).await;
        let mut events = client.subscribe();

        server.send(b"not sealed at all").await;
        let sealed = server.keys.encrypt_to_remote(b"[1,2,3]").unwrap();
        server.send(&sealed).await;
        server.send_sealed(&Envelope::new(USER_CONNECT)).await;

        let event = events.recv().await.unwrap();
        assert_eq!(event.msg_type(), Some(USER_CONNECT));
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn server_close_fails_pending_calls() {
        let (client, mut server) = connected(ClientDispatch::new()).await;
        let client = Arc::new(client);

        let caller = Arc::clone(&client);
        let call = tokio::spawn(async move { caller.get_users().await });
        server.open_next().await.unwrap();
        drop(server);

        assert!(matches!(call.await.unwrap(), Err(TalkError::ConnectionClosed)));
        tokio::time::timeout(Duration::from_secs(5), client.closed())
            .await
            .unwrap();
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn unanswered_call_times_out() {
        let (mut client, mut server) = connected(ClientDispatch::new()).await;
        client.request_timeout = Some(Duration::from_millis(50));

        let result = client.get_users().await;
        assert!(matches!(result, Err(TalkError::Timeout)));
        assert_eq!(client.correlator.outstanding(), 0);
        assert!(server.open_next().await.is_some());
    }

    #[tokio::test]
    async fn broadcast_is_fire_and_forget() {
        let (client, mut server) = connected(ClientDispatch::new()).await;
        client.broadcast_message("hello all").await.unwrap();

        let sent = server.open_next().await.unwrap();
        assert_eq!(sent.msg_type(), Some(BROADCAST_MESSAGE));
        assert_eq!(sent.get_str(fields::MESSAGE), Some("hello all"));
        assert!(sent.correlation_id().is_none());
    }
}
