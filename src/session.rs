//! A session owns one full-duplex TCP connection to a peer.
//!
//! The write half lives behind an async mutex so concurrent senders are
//! serialized and every frame (length prefix plus body) hits the wire as one
//! unit. The read half is returned to the transport, which drives the read
//! loop and routes decoded messages. All i/o errors are terminal for the
//! session; reconnecting is not a session concern.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Mutex;

use futures::SinkExt;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio_util::codec::FramedRead;
use tokio_util::codec::FramedWrite;
use tracing::debug;

use crate::codec::CodecError;
use crate::codec::MessageCodec;
use crate::models::message::Message;
use crate::models::peer::ConnectionStatus;
use crate::models::peer::PeerId;
use crate::models::peer::PeerInfo;

#[derive(Debug, thiserror::Error)]
pub(crate) enum SessionError {
    #[error("session is closed")]
    Closed,
    #[error("write failed: {0}")]
    Write(#[from] CodecError),
}

pub(crate) struct Session {
    peer_id: PeerId,
    info: Mutex<PeerInfo>,
    connected: AtomicBool,
    writer: tokio::sync::Mutex<FramedWrite<OwnedWriteHalf, MessageCodec>>,
    closed: Notify,
}

impl Session {
    /// Wrap an established TCP stream. Returns the session handle and the
    /// framed read half for the caller's read loop.
    pub(crate) fn establish(
        peer_id: PeerId,
        stream: TcpStream,
    ) -> std::io::Result<(std::sync::Arc<Self>, FramedRead<OwnedReadHalf, MessageCodec>)> {
        let remote_addr = stream.peer_addr()?;
        let (read_half, write_half) = stream.into_split();

        let info = PeerInfo {
            id: peer_id,
            name: "unknown".to_string(),
            ip_address: remote_addr.ip().to_string(),
            port: remote_addr.port(),
            status: ConnectionStatus::Connected,
        };

        let session = std::sync::Arc::new(Self {
            peer_id,
            info: Mutex::new(info),
            connected: AtomicBool::new(true),
            writer: tokio::sync::Mutex::new(FramedWrite::new(write_half, MessageCodec)),
            closed: Notify::new(),
        });
        let reader = FramedRead::new(read_half, MessageCodec);
        Ok((session, reader))
    }

    pub(crate) fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub(crate) fn peer_info(&self) -> PeerInfo {
        self.info.lock().unwrap().clone()
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Record what the remote side announced about itself. Ids stay
    /// link-local; the declared id only fills the display name so peer
    /// listings have something stable to show.
    pub(crate) fn note_remote_identity(&self, declared_id: PeerId, status: ConnectionStatus) {
        let mut info = self.info.lock().unwrap();
        if info.name == "unknown" {
            info.name = declared_id.to_string();
        }
        info.status = status;
        debug!(
            "peer {} declared itself as {} ({})",
            self.peer_id, declared_id, status
        );
    }

    /// Serialize and write one message. Atomic per message: the frame is
    /// encoded and flushed while the per-session write lock is held.
    pub(crate) async fn send(&self, message: Message) -> Result<(), SessionError> {
        if !self.is_connected() {
            return Err(SessionError::Closed);
        }
        let mut writer = self.writer.lock().await;
        if !self.is_connected() {
            return Err(SessionError::Closed);
        }
        match writer.send(message).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.close();
                Err(SessionError::Write(e))
            }
        }
    }

    /// Idempotent. Flips the connected flag and wakes the read loop; the
    /// socket halves are shut down by whoever owns them once the loop exits.
    pub(crate) fn close(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.closed.notify_one();
        }
    }

    /// Resolves when [`close`](Self::close) has been called.
    pub(crate) async fn closed(&self) {
        if !self.is_connected() {
            return;
        }
        self.closed.notified().await;
    }

    /// Best-effort FIN on the write half after the read loop has exited.
    pub(crate) async fn shutdown_writer(&self) {
        let mut writer = self.writer.lock().await;
        let _ = writer.get_mut().shutdown().await;
    }

    pub(crate) fn set_status(&self, status: ConnectionStatus) {
        self.info.lock().unwrap().status = status;
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;
    use tokio::net::TcpListener;

    use super::*;
    use crate::models::message::MessageBody;

    async fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, (server, _)) =
            tokio::join!(async { TcpStream::connect(addr).await.unwrap() }, async {
                listener.accept().await.unwrap()
            });
        (client, server)
    }

    fn chat(content: &str) -> Message {
        Message::new(
            PeerId::generate(),
            MessageBody::Chat {
                content: content.to_string(),
            },
        )
    }

    #[tokio::test]
    async fn send_produces_decodable_frames() {
        let (local, remote) = tcp_pair().await;
        let (session, _reader) = Session::establish(PeerId::generate(), local).unwrap();
        let mut remote_reader = FramedRead::new(remote, MessageCodec);

        let message = chat("over the wire");
        session.send(message.clone()).await.unwrap();

        let received = remote_reader.next().await.unwrap().unwrap();
        assert_eq!(received, message);
    }

    #[tokio::test]
    async fn concurrent_sends_never_interleave() {
        let (local, remote) = tcp_pair().await;
        let (session, _reader) = Session::establish(PeerId::generate(), local).unwrap();
        let mut remote_reader = FramedRead::new(remote, MessageCodec);

        const TASKS: usize = 8;
        const PER_TASK: usize = 50;

        let mut senders = Vec::new();
        for task in 0..TASKS {
            let session = session.clone();
            senders.push(tokio::spawn(async move {
                for i in 0..PER_TASK {
                    // Vary payload sizes so torn writes would corrupt framing.
                    let content = "x".repeat(task * 97 + i * 13 + 1);
                    session.send(chat(&content)).await.unwrap();
                }
            }));
        }

        let mut received = 0;
        while received < TASKS * PER_TASK {
            let message = remote_reader.next().await.unwrap().unwrap();
            assert!(matches!(message.body, MessageBody::Chat { .. }));
            received += 1;
        }
        for handle in senders {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn close_is_idempotent_and_rejects_sends() {
        let (local, _remote) = tcp_pair().await;
        let (session, _reader) = Session::establish(PeerId::generate(), local).unwrap();

        assert!(session.is_connected());
        session.close();
        session.close();
        assert!(!session.is_connected());
        assert!(matches!(
            session.send(chat("too late")).await,
            Err(SessionError::Closed)
        ));
    }

    #[tokio::test]
    async fn closed_signal_fires_even_if_close_came_first() {
        let (local, _remote) = tcp_pair().await;
        let (session, _reader) = Session::establish(PeerId::generate(), local).unwrap();

        session.close();
        // Must not hang although nobody was awaiting when close() ran.
        tokio::time::timeout(std::time::Duration::from_secs(1), session.closed())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn peer_info_reflects_remote_address() {
        let (local, remote) = tcp_pair().await;
        let remote_addr = remote.local_addr().unwrap();
        let peer_id = PeerId::generate();
        let (session, _reader) = Session::establish(peer_id, local).unwrap();

        let info = session.peer_info();
        assert_eq!(info.id, peer_id);
        assert_eq!(info.ip_address, remote_addr.ip().to_string());
        assert_eq!(info.port, remote_addr.port());
        assert_eq!(info.status, ConnectionStatus::Connected);
    }
}
