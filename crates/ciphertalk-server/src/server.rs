//! Core server: accepts connections, runs the handshake, drives sessions.

use crate::config::ServerConfig;
use crate::dispatch::DispatchTable;
use crate::handshake::{Established, ServerHandshake};
use crate::registry::Registry;
use crate::session::Session;
use ciphertalk_core::{
    split_stream, FrameReader, FrameWriter, KeyPairManager, TalkError, TalkResult,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// How long `serve` waits for open sessions to wind down after shutdown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// The ciphertalk server instance.
pub struct ChatServer {
    config: ServerConfig,
    /// Long-lived identity key; each connection works on a fork.
    keys: KeyPairManager,
    registry: Registry,
    dispatch: DispatchTable,
    /// Broadcast sender for server shutdown notification.
    shutdown_tx: broadcast::Sender<()>,
}

impl ChatServer {
    /// A server with the built-in request handlers.
    pub fn new(config: ServerConfig, keys: KeyPairManager) -> Self {
        Self::with_dispatch(config, keys, DispatchTable::with_builtin_handlers())
    }

    pub fn with_dispatch(config: ServerConfig, keys: KeyPairManager, dispatch: DispatchTable) -> Self {
        Self {
            config,
            keys,
            registry: Registry::new(),
            dispatch,
            shutdown_tx: broadcast::channel(1).0,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn fingerprint(&self) -> String {
        self.keys.fingerprint()
    }

    /// Stop accepting and close every session loop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn run(self: Arc<Self>) -> TalkResult<()> {
        let addr = self.config.bind_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| TalkError::Transport(format!("cannot bind {addr}: {e}")))?;
        self.serve(listener).await
    }

    /// Accept connections on `listener` until [`shutdown`](Self::shutdown).
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> TalkResult<()> {
        let local = listener.local_addr()?;
        info!(
            addr = %local,
            framing = %self.config.framing,
            fingerprint = %ciphertalk_core::short_fingerprint(&self.keys.fingerprint(), 16),
            "ciphertalk-server ready"
        );

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("shutting down, closing sessions");
                    break;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, remote)) => {
                            if let Err(e) = stream.set_nodelay(true) {
                                debug!(remote = %remote, error = %e, "set_nodelay failed");
                            }
                            let srv = self.clone();
                            connections.spawn(async move {
                                srv.handle_connection(stream, remote).await;
                            });
                        }
                        Err(e) => warn!(error = %e, "accept failed"),
                    }
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        drop(listener);
        let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(remaining = connections.len(), "sessions still open after drain timeout, aborting");
            connections.shutdown().await;
        }
        info!("ciphertalk-server stopped");
        Ok(())
    }

    /// Run one connection from handshake to teardown.
    ///
    /// Handshake failures end the connection quietly; an established session
    /// is always unregistered (and its departure announced) on the way out.
    pub async fn handle_connection<S>(&self, stream: S, remote: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Send,
    {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let (mut reader, mut writer) =
            split_stream(stream, self.config.framing, self.config.max_frame_len);

        debug!(remote = %remote, "handshake started");
        let mut handshake = ServerHandshake::new(&self.keys, &self.config, &self.registry)
            .with_shutdown(self.shutdown_tx.subscribe());
        let Established { session, outbound } = match handshake.run(&mut reader, &mut writer).await {
            Ok(established) => established,
            Err(TalkError::Handshake(code)) => {
                info!(remote = %remote, code = %code, "handshake rejected");
                return;
            }
            Err(TalkError::Timeout) => {
                info!(remote = %remote, "handshake timed out");
                return;
            }
            Err(TalkError::ConnectionClosed) if shutdown_rx.try_recv().is_ok() => {
                debug!(remote = %remote, "handshake abandoned for shutdown");
                return;
            }
            Err(e) => {
                debug!(remote = %remote, error = %e, "handshake aborted");
                return;
            }
        };

        let peer_fp = session.remote_fingerprint().unwrap_or_default();
        info!(
            remote = %remote,
            user = %session.identity(),
            peer = %ciphertalk_core::short_fingerprint(&peer_fp, 16),
            "session established"
        );

        self.session_loop(&session, &mut reader, &mut writer, outbound, &mut shutdown_rx)
            .await;

        self.registry.unregister(session.identity()).await;
        let _ = writer.shutdown().await;
        debug!(remote = %remote, user = %session.identity(), "session closed");
    }

    async fn session_loop<R, W>(
        &self,
        session: &Arc<Session>,
        reader: &mut FrameReader<R>,
        writer: &mut FrameWriter<W>,
        mut outbound: mpsc::Receiver<Vec<u8>>,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    debug!(user = %session.identity(), "shutdown signal received");
                    break;
                }

                // Queued envelopes (replies, broadcasts, whispers), in order.
                Some(sealed) = outbound.recv() => {
                    if let Err(e) = writer.write_frame(&sealed).await {
                        debug!(user = %session.identity(), error = %e, "write failed");
                        break;
                    }
                }

                frame = reader.read_frame() => {
                    match frame {
                        Ok(Some(buffer)) => {
                            if let Err(e) = self.dispatch.dispatch_buffer(&buffer, session, &self.registry).await {
                                warn!(user = %session.identity(), error = %e, "request handling failed");
                            }
                        }
                        Ok(None) => {
                            debug!(user = %session.identity(), "peer closed");
                            break;
                        }
                        Err(e) => {
                            debug!(user = %session.identity(), error = %e, "read failed");
                            break;
                        }
                    }
                }
            }
        }
    }
}
