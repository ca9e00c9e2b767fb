//! TCP channel: one long-lived session per accepted connection, exchanging
//! length-prefixed JSON frames.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use outpost_core::config::TcpConfig;
use outpost_core::protocol::{decode_inbound, Inbound, Message};
use outpost_core::{ConnectionHandle, FrameCodec, OutpostError, SessionManager};
use tokio::io::AsyncWrite;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::dispatcher::CommandDispatcher;

/// Why a connection's loop ended without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Teardown {
    PeerClosed,
    Exit,
    Closed,
}

impl fmt::Display for Teardown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Teardown::PeerClosed => f.write_str("peer closed connection"),
            Teardown::Exit => f.write_str("session exited"),
            Teardown::Closed => f.write_str("closed by server"),
        }
    }
}

#[derive(Clone)]
pub struct TcpChannel {
    config: TcpConfig,
    sessions: Arc<SessionManager>,
    dispatcher: Arc<dyn CommandDispatcher>,
}

impl TcpChannel {
    pub fn new(
        config: TcpConfig,
        sessions: Arc<SessionManager>,
        dispatcher: Arc<dyn CommandDispatcher>,
    ) -> Self {
        Self {
            config,
            sessions,
            dispatcher,
        }
    }

    pub async fn bind(&self) -> io::Result<TcpListener> {
        TcpListener::bind(self.config.addr()).await
    }

    /// Accept connections until `shutdown` fires or a non-transient accept
    /// error occurs. Open connections are closed when this returns.
    pub async fn serve(
        self,
        listener: TcpListener,
        mut shutdown: broadcast::Receiver<()>,
    ) -> anyhow::Result<()> {
        let local_addr = listener.local_addr()?;
        tracing::info!("TCP listener '{}' started on {}", self.config.name, local_addr);

        let channel = Arc::new(self);
        let connections = CancellationToken::new();

        let result = loop {
            tokio::select! {
                res = listener.accept() => match res {
                    Ok((stream, peer)) => {
                        let channel = Arc::clone(&channel);
                        let handle = ConnectionHandle::child_of(&connections);
                        tokio::spawn(async move {
                            channel.handle_connection(stream, peer, handle).await;
                        });
                    }
                    Err(e) if is_transient_accept_error(&e) => {
                        tracing::warn!("TCP accept error (retrying): {}", e);
                    }
                    Err(e) => {
                        tracing::error!("TCP accept failed, stopping listener: {}", e);
                        break Err(e.into());
                    }
                },
                _ = shutdown.recv() => {
                    tracing::info!("Shutting down TCP listener '{}'...", channel.config.name);
                    break Ok(());
                }
            }
        };

        connections.cancel();
        result
    }

    async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr, handle: ConnectionHandle) {
        let session = self.sessions.create_tcp_session(peer, handle.clone());
        let id = session.id.to_string();
        tracing::info!("New TCP connection from {} - Session {}", peer, id);

        match self.drive(stream, &id, &handle).await {
            Ok(reason) => tracing::info!("TCP session {} ({}) disconnected: {}", id, peer, reason),
            Err(e) => tracing::warn!("TCP session {} ({}) terminated: {}", id, peer, e),
        }

        self.sessions.remove_session(&id);
        handle.close();
    }

    async fn drive(
        &self,
        stream: TcpStream,
        id: &str,
        handle: &ConnectionHandle,
    ) -> Result<Teardown, OutpostError> {
        let (read, write) = stream.into_split();
        let mut reader = FramedRead::new(read, FrameCodec::with_max_length(self.config.max_frame_length));
        let mut writer = FramedWrite::new(write, FrameCodec::with_max_length(self.config.max_frame_length));

        send(&mut writer, &Message::welcome(self.config.welcome_message.as_str())).await?;

        let recv_timeout = Duration::from_secs(self.config.recv_timeout_seconds.max(1));

        loop {
            let next = tokio::select! {
                _ = handle.closed() => return Ok(Teardown::Closed),
                res = tokio::time::timeout(recv_timeout, reader.next()) => res,
            };

            let frame = match next {
                Err(_) => {
                    tracing::trace!("TCP session {} receive timed out", id);
                    continue;
                }
                Ok(None) => return Ok(Teardown::PeerClosed),
                Ok(Some(frame)) => frame?,
            };

            self.sessions.touch(id);
            let inbound = decode_inbound(&frame)?;
            if inbound.is_exit() {
                return Ok(Teardown::Exit);
            }

            match inbound {
                Inbound::Message(Message::SystemInfo { data }) => {
                    self.sessions.update_info(id, data);
                    if let Some(session) = self.sessions.get_session(id) {
                        tracing::info!("Session {} - {}", id, session.describe());
                    }
                }
                other => {
                    let Some(session) = self.sessions.get_session(id) else {
                        return Ok(Teardown::Closed);
                    };
                    let reply = self.dispatcher.dispatch(&session, other).await;
                    let exit = reply.is_exit();
                    send(&mut writer, &reply).await?;
                    if exit {
                        return Ok(Teardown::Exit);
                    }
                }
            }
        }
    }
}

async fn send<W>(writer: &mut FramedWrite<W, FrameCodec>, message: &Message) -> Result<(), OutpostError>
where
    W: AsyncWrite + Unpin,
{
    writer.send(message.to_bytes()?).await?;
    Ok(())
}

fn is_transient_accept_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::TimedOut
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::Interrupted
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
    )
}
