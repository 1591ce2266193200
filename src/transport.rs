//! TCP transport: accepts and dials connections, routes messages.
//!
//! The transport owns the session registry and is the only component that
//! touches sockets directly. It is a cheap-to-clone handle; chat and file
//! transfer each hold a clone plus their own inbound subscription, so no
//! subsystem can clobber another's message delivery.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;

use futures::StreamExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpListener;
use tokio::net::TcpSocket;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::codec::MessageCodec;
use crate::models::message::Message;
use crate::models::message::MessageBody;
use crate::models::peer::ConnectionStatus;
use crate::models::peer::PeerId;
use crate::models::peer::PeerInfo;
use crate::session::Session;
use crate::session::SessionError;

const LISTEN_BACKLOG: u32 = 1024;

/// One decoded message together with the link-local id of the session it
/// arrived on. `message.sender` is whatever the remote stamped on the
/// message; `peer_id` is the id this transport routes the peer under, and is
/// the one to use for replies.
#[derive(Clone, Debug)]
pub struct InboundMessage {
    pub peer_id: PeerId,
    pub message: Message,
}

/// Observer for connection lifecycle events. Setting a new callback replaces
/// the previous one.
pub type ConnectionCallback = Arc<dyn Fn(PeerId, ConnectionStatus) + Send + Sync>;

/// Observer for transport-level errors that have no other reporting path.
pub type ErrorCallback = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to bind listener on port {port}: {source}")]
    Bind {
        port: u16,
        source: std::io::Error,
    },
    #[error("transport is already running")]
    AlreadyRunning,
    #[error("transport is not running")]
    NotRunning,
    #[error("failed to connect to {address}: {source}")]
    Connect {
        address: String,
        source: std::io::Error,
    },
    #[error("no session for peer {0}")]
    UnknownPeer(PeerId),
    #[error("session to peer {0} is closed")]
    SessionClosed(PeerId),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

struct TransportInner {
    self_id: PeerId,
    running: AtomicBool,
    sessions: Mutex<HashMap<PeerId, Arc<Session>>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<InboundMessage>>>,
    connection_callback: Mutex<Option<ConnectionCallback>>,
    error_callback: Mutex<Option<ErrorCallback>>,
    local_addr: Mutex<Option<SocketAddr>>,
    accept_shutdown: Notify,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

/// Cloneable handle to the shared transport state.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<TransportInner>,
}

impl Default for Transport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport {
    /// Create a stopped transport with a fresh node id.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TransportInner {
                self_id: PeerId::generate(),
                running: AtomicBool::new(false),
                sessions: Mutex::new(HashMap::new()),
                subscribers: Mutex::new(Vec::new()),
                connection_callback: Mutex::new(None),
                error_callback: Mutex::new(None),
                local_addr: Mutex::new(None),
                accept_shutdown: Notify::new(),
                accept_task: Mutex::new(None),
            }),
        }
    }

    /// The id this node declares about itself in connection notifications.
    pub fn self_id(&self) -> PeerId {
        self.inner.self_id
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Address of the bound listener while running. A port of 0 in
    /// [`start`](Self::start) resolves to an OS-assigned port here.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock().unwrap()
    }

    /// Bind the listener and start accepting connections.
    pub async fn start(&self, port: u16) -> Result<(), TransportError> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Err(TransportError::AlreadyRunning);
        }

        let listener = match Self::bind_listener(port) {
            Ok(listener) => listener,
            Err(source) => {
                self.inner.running.store(false, Ordering::SeqCst);
                return Err(TransportError::Bind { port, source });
            }
        };
        let local_addr = listener.local_addr()?;
        *self.inner.local_addr.lock().unwrap() = Some(local_addr);
        info!("transport listening on {local_addr}");

        let transport = self.clone();
        let handle = tokio::spawn(async move {
            transport.run_accept_loop(listener).await;
        });
        *self.inner.accept_task.lock().unwrap() = Some(handle);
        Ok(())
    }

    fn bind_listener(port: u16) -> std::io::Result<TcpListener> {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let socket = TcpSocket::new_v4()?;
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        socket.listen(LISTEN_BACKLOG)
    }

    /// Stop accepting, close every session, clear the registry. Idempotent.
    pub async fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }

        self.inner.accept_shutdown.notify_one();
        let accept_task = self.inner.accept_task.lock().unwrap().take();
        if let Some(handle) = accept_task {
            let _ = handle.await;
        }

        let drained: Vec<Arc<Session>> = {
            let mut sessions = self.inner.sessions.lock().unwrap();
            sessions.drain().map(|(_, session)| session).collect()
        };
        for session in drained {
            session.close();
        }
        *self.inner.local_addr.lock().unwrap() = None;
        info!("transport stopped");
    }

    /// Dial a peer. On success the new session is registered under a freshly
    /// generated peer id, our connection notification is sent, and the
    /// connection callback fires with `Connected`.
    pub async fn connect(&self, address: &str, port: u16) -> Result<PeerId, TransportError> {
        if !self.is_running() {
            return Err(TransportError::NotRunning);
        }

        match TcpStream::connect((address, port)).await {
            Ok(stream) => {
                info!("connected to peer at {address}:{port}");
                self.register_session(stream).await
            }
            Err(source) => {
                let address = format!("{address}:{port}");
                self.notify_error(&format!("failed to connect to {address}: {source}"));
                Err(TransportError::Connect { address, source })
            }
        }
    }

    /// Close the session to `peer_id` and emit a `Disconnected` event.
    pub fn disconnect(&self, peer_id: PeerId) {
        match self.remove_session(peer_id) {
            Some(session) => {
                session.close();
                session.set_status(ConnectionStatus::Disconnected);
                info!("disconnected from peer {peer_id}");
                self.notify_connection(peer_id, ConnectionStatus::Disconnected);
            }
            None => debug!("disconnect: no session for peer {peer_id}"),
        }
    }

    /// Route one message to a connected peer.
    pub async fn send(&self, peer_id: PeerId, message: Message) -> Result<(), TransportError> {
        let session = {
            let sessions = self.inner.sessions.lock().unwrap();
            sessions.get(&peer_id).cloned()
        }
        .ok_or(TransportError::UnknownPeer(peer_id))?;

        session.send(message).await.map_err(|e| {
            if let SessionError::Write(write_error) = &e {
                warn!("send to peer {peer_id} failed: {write_error}");
            }
            TransportError::SessionClosed(peer_id)
        })
    }

    /// Send one message to every open session. The registry lock is held
    /// only while snapshotting the session list, never during i/o.
    pub async fn broadcast(&self, message: Message) {
        let targets: Vec<Arc<Session>> = {
            let sessions = self.inner.sessions.lock().unwrap();
            sessions
                .values()
                .filter(|session| session.is_connected())
                .cloned()
                .collect()
        };

        for session in targets {
            if let Err(e) = session.send(message.clone()).await {
                debug!("broadcast to peer {} failed: {e}", session.peer_id());
            }
        }
    }

    /// Snapshot of every open session's peer info.
    pub fn connected_peers(&self) -> Vec<PeerInfo> {
        let sessions = self.inner.sessions.lock().unwrap();
        sessions
            .values()
            .filter(|session| session.is_connected())
            .map(|session| session.peer_info())
            .collect()
    }

    /// Register an inbound-message subscriber. Every decoded message is
    /// delivered to every live subscriber; a dropped receiver is pruned on
    /// the next dispatch.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<InboundMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.subscribers.lock().unwrap().push(tx);
        rx
    }

    pub fn set_connection_callback(&self, callback: ConnectionCallback) {
        *self.inner.connection_callback.lock().unwrap() = Some(callback);
    }

    pub fn set_error_callback(&self, callback: ErrorCallback) {
        *self.inner.error_callback.lock().unwrap() = Some(callback);
    }

    async fn run_accept_loop(self, listener: TcpListener) {
        loop {
            tokio::select! {
                _ = self.inner.accept_shutdown.notified() => break,
                result = listener.accept() => match result {
                    Ok((stream, remote_addr)) => {
                        debug!("accepted connection from {remote_addr}");
                        if let Err(e) = self.register_session(stream).await {
                            warn!("failed to establish incoming session: {e}");
                        }
                    }
                    Err(e) => {
                        if !self.is_running() {
                            break;
                        }
                        error!("error accepting connection: {e}");
                    }
                },
            }
            if !self.is_running() {
                break;
            }
        }
        debug!("accept loop terminated");
    }

    /// Common path for accepted and dialed connections: assign a link-local
    /// peer id, register the session, announce ourselves, notify, and spawn
    /// the read loop. The connection callback always fires before the first
    /// inbound message is dispatched.
    async fn register_session(&self, stream: TcpStream) -> Result<PeerId, TransportError> {
        let peer_id = PeerId::generate();
        let (session, reader) = Session::establish(peer_id, stream)?;

        {
            let mut sessions = self.inner.sessions.lock().unwrap();
            sessions.insert(peer_id, session.clone());
        }

        let notification = Message::new(
            self.self_id(),
            MessageBody::ConnectionNotification {
                peer_id: self.self_id(),
                status: ConnectionStatus::Connected,
            },
        );
        if session.send(notification).await.is_err() {
            self.remove_session(peer_id);
            return Err(TransportError::SessionClosed(peer_id));
        }

        self.notify_connection(peer_id, ConnectionStatus::Connected);

        let transport = self.clone();
        tokio::spawn(async move {
            transport.run_read_loop(session, reader).await;
        });
        Ok(peer_id)
    }

    async fn run_read_loop(
        self,
        session: Arc<Session>,
        mut reader: FramedRead<OwnedReadHalf, MessageCodec>,
    ) {
        let peer_id = session.peer_id();
        loop {
            tokio::select! {
                _ = session.closed() => break,
                frame = reader.next() => match frame {
                    None => {
                        debug!("peer {peer_id} closed the connection");
                        break;
                    }
                    Some(Ok(message)) => self.dispatch_inbound(&session, message),
                    Some(Err(e)) if e.is_fatal() => {
                        warn!("read error on session {peer_id}: {e}");
                        break;
                    }
                    Some(Err(e)) => {
                        // Recoverable decode error: discard the frame, keep
                        // the session.
                        warn!("discarding frame from peer {peer_id}: {e}");
                    }
                },
            }
            if !session.is_connected() {
                break;
            }
        }

        session.close();
        session.shutdown_writer().await;
        if self.remove_session(peer_id).is_some() {
            session.set_status(ConnectionStatus::Disconnected);
            self.notify_connection(peer_id, ConnectionStatus::Disconnected);
        }
    }

    fn dispatch_inbound(&self, session: &Arc<Session>, message: Message) {
        if let MessageBody::ConnectionNotification { peer_id, status } = &message.body {
            session.note_remote_identity(*peer_id, *status);
        }

        let inbound = InboundMessage {
            peer_id: session.peer_id(),
            message,
        };
        let mut subscribers = self.inner.subscribers.lock().unwrap();
        subscribers.retain(|tx| tx.send(inbound.clone()).is_ok());
    }

    fn remove_session(&self, peer_id: PeerId) -> Option<Arc<Session>> {
        self.inner.sessions.lock().unwrap().remove(&peer_id)
    }

    fn notify_connection(&self, peer_id: PeerId, status: ConnectionStatus) {
        let callback = self.inner.connection_callback.lock().unwrap().clone();
        if let Some(callback) = callback {
            callback(peer_id, status);
        }
    }

    fn notify_error(&self, description: &str) {
        error!("{description}");
        let callback = self.inner.error_callback.lock().unwrap().clone();
        if let Some(callback) = callback {
            callback(description);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::SinkExt;
    use tokio::io::AsyncWriteExt;
    use tokio::time::timeout;
    use tokio_util::codec::Framed;
    use tracing_test::traced_test;

    use super::*;
    use crate::codec::encode_message;

    const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

    async fn started_transport() -> Transport {
        let transport = Transport::new();
        transport.start(0).await.unwrap();
        transport
    }

    fn connection_events(
        transport: &Transport,
    ) -> mpsc::UnboundedReceiver<(PeerId, ConnectionStatus)> {
        let (tx, rx) = mpsc::unbounded_channel();
        transport.set_connection_callback(Arc::new(move |peer, status| {
            let _ = tx.send((peer, status));
        }));
        rx
    }

    async fn next_event(
        rx: &mut mpsc::UnboundedReceiver<(PeerId, ConnectionStatus)>,
    ) -> (PeerId, ConnectionStatus) {
        timeout(EVENT_TIMEOUT, rx.recv()).await.unwrap().unwrap()
    }

    fn chat(sender: PeerId, content: &str) -> Message {
        Message::new(
            sender,
            MessageBody::Chat {
                content: content.to_string(),
            },
        )
    }

    #[tokio::test]
    async fn start_fails_when_port_is_taken() {
        let first = started_transport().await;
        let port = first.local_addr().unwrap().port();

        let second = Transport::new();
        assert!(matches!(
            second.start(port).await,
            Err(TransportError::Bind { .. })
        ));
        assert!(!second.is_running());
        first.stop().await;
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let transport = started_transport().await;
        transport.stop().await;
        transport.stop().await;
        assert!(!transport.is_running());
    }

    #[tokio::test]
    async fn connect_registers_session_and_fires_connected() {
        let server = started_transport().await;
        let mut server_events = connection_events(&server);
        let client = started_transport().await;
        let mut client_events = connection_events(&client);

        let server_port = server.local_addr().unwrap().port();
        let peer_id = client.connect("127.0.0.1", server_port).await.unwrap();

        let (event_peer, status) = next_event(&mut client_events).await;
        assert_eq!(event_peer, peer_id);
        assert_eq!(status, ConnectionStatus::Connected);

        let (_, status) = next_event(&mut server_events).await;
        assert_eq!(status, ConnectionStatus::Connected);

        assert_eq!(client.connected_peers().len(), 1);
        assert_eq!(client.connected_peers()[0].id, peer_id);
        assert_eq!(server.connected_peers().len(), 1);

        client.stop().await;
        server.stop().await;
    }

    #[tokio::test]
    async fn connect_to_dead_port_reports_error() {
        let transport = started_transport().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        transport.set_error_callback(Arc::new(move |description| {
            let _ = tx.send(description.to_string());
        }));

        // A listener bound and dropped leaves a port nobody answers on.
        let dead_port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let result = transport.connect("127.0.0.1", dead_port).await;
        assert!(matches!(result, Err(TransportError::Connect { .. })));
        let description = timeout(EVENT_TIMEOUT, rx.recv()).await.unwrap().unwrap();
        assert!(description.contains("failed to connect"));
        transport.stop().await;
    }

    #[tokio::test]
    async fn chat_message_round_trips_between_instances() {
        let receiver = started_transport().await;
        let mut inbound = receiver.subscribe();
        let sender = started_transport().await;

        let port = receiver.local_addr().unwrap().port();
        let peer_id = sender.connect("127.0.0.1", port).await.unwrap();
        sender
            .send(peer_id, chat(sender.self_id(), "hi"))
            .await
            .unwrap();

        // First the sender's connection notification, then the chat.
        loop {
            let inbound_message = timeout(EVENT_TIMEOUT, inbound.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(inbound_message.peer_id, receiver.connected_peers()[0].id);
            match inbound_message.message.body {
                MessageBody::ConnectionNotification { peer_id, .. } => {
                    assert_eq!(peer_id, sender.self_id());
                }
                MessageBody::Chat { ref content } => {
                    assert_eq!(content, "hi");
                    assert_eq!(inbound_message.message.sender, sender.self_id());
                    break;
                }
                ref other => panic!("unexpected message {other:?}"),
            }
        }

        sender.stop().await;
        receiver.stop().await;
    }

    #[tokio::test]
    async fn broadcast_reaches_every_connected_peer() {
        let hub = started_transport().await;
        let hub_port = hub.local_addr().unwrap().port();

        let mut spokes = Vec::new();
        for _ in 0..3 {
            let spoke = started_transport().await;
            let inbound = spoke.subscribe();
            spoke.connect("127.0.0.1", hub_port).await.unwrap();
            spokes.push((spoke, inbound));
        }

        // Wait until the hub has registered all three sessions.
        timeout(EVENT_TIMEOUT, async {
            while hub.connected_peers().len() < 3 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        hub.broadcast(chat(hub.self_id(), "everyone")).await;

        for (spoke, mut inbound) in spokes {
            let content = timeout(EVENT_TIMEOUT, async {
                loop {
                    let inbound_message = inbound.recv().await.unwrap();
                    if let MessageBody::Chat { content } = inbound_message.message.body {
                        break content;
                    }
                }
            })
            .await
            .unwrap();
            assert_eq!(content, "everyone");
            spoke.stop().await;
        }
        hub.stop().await;
    }

    #[tokio::test]
    async fn disconnect_fires_exactly_one_disconnected_event() {
        let server = started_transport().await;
        let client = started_transport().await;
        let mut client_events = connection_events(&client);

        let port = server.local_addr().unwrap().port();
        let peer_id = client.connect("127.0.0.1", port).await.unwrap();
        let (_, status) = next_event(&mut client_events).await;
        assert_eq!(status, ConnectionStatus::Connected);

        client.disconnect(peer_id);
        let (event_peer, status) = next_event(&mut client_events).await;
        assert_eq!(event_peer, peer_id);
        assert_eq!(status, ConnectionStatus::Disconnected);

        assert!(client.connected_peers().is_empty());
        assert!(matches!(
            client.send(peer_id, chat(client.self_id(), "gone")).await,
            Err(TransportError::UnknownPeer(_))
        ));

        // The read loop racing the explicit disconnect must not produce a
        // second event.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(client_events.try_recv().is_err());

        client.stop().await;
        server.stop().await;
    }

    #[tokio::test]
    async fn remote_shutdown_emits_disconnected() {
        let server = started_transport().await;
        let client = started_transport().await;
        let mut server_events = connection_events(&server);

        let port = server.local_addr().unwrap().port();
        client.connect("127.0.0.1", port).await.unwrap();
        let (server_side_peer, status) = next_event(&mut server_events).await;
        assert_eq!(status, ConnectionStatus::Connected);

        client.stop().await;

        let (event_peer, status) = next_event(&mut server_events).await;
        assert_eq!(event_peer, server_side_peer);
        assert_eq!(status, ConnectionStatus::Disconnected);
        assert!(server.connected_peers().is_empty());

        server.stop().await;
    }

    #[tokio::test]
    async fn send_to_unknown_peer_is_an_error() {
        let transport = started_transport().await;
        let result = transport
            .send(PeerId::generate(), chat(transport.self_id(), "nobody"))
            .await;
        assert!(matches!(result, Err(TransportError::UnknownPeer(_))));
        transport.stop().await;
    }

    #[tokio::test]
    async fn connect_while_stopped_is_rejected() {
        let transport = Transport::new();
        assert!(matches!(
            transport.connect("127.0.0.1", 1).await,
            Err(TransportError::NotRunning)
        ));
    }

    #[traced_test]
    #[tokio::test]
    async fn undecodable_frame_does_not_kill_the_session() {
        let transport = started_transport().await;
        let mut inbound = transport.subscribe();
        let port = transport.local_addr().unwrap().port();

        // Raw client speaking the wire format directly.
        let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let mut framed = Framed::new(stream, MessageCodec);

        // Swallow the transport's connection notification.
        let _ = timeout(EVENT_TIMEOUT, framed.next()).await.unwrap();

        // A frame with a reserved tag, then a valid chat message.
        let raw_sender = PeerId::generate();
        let mut bad_body = encode_message(&Message::new(raw_sender, MessageBody::Ping));
        bad_body[0] = 5;
        let stream = framed.get_mut();
        stream
            .write_all(&(bad_body.len() as u32).to_be_bytes())
            .await
            .unwrap();
        stream.write_all(&bad_body).await.unwrap();
        framed.send(chat(raw_sender, "survived")).await.unwrap();

        let content = timeout(EVENT_TIMEOUT, async {
            loop {
                let inbound_message = inbound.recv().await.unwrap();
                if let MessageBody::Chat { content } = inbound_message.message.body {
                    break content;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(content, "survived");
        assert_eq!(transport.connected_peers().len(), 1);
        assert!(logs_contain("discarding frame"));

        transport.stop().await;
    }

    #[tokio::test]
    async fn every_subscriber_receives_every_message() {
        let receiver = started_transport().await;
        let mut first = receiver.subscribe();
        let mut second = receiver.subscribe();
        let sender = started_transport().await;

        let port = receiver.local_addr().unwrap().port();
        let peer_id = sender.connect("127.0.0.1", port).await.unwrap();
        sender
            .send(peer_id, chat(sender.self_id(), "fan out"))
            .await
            .unwrap();

        for subscription in [&mut first, &mut second] {
            let content = timeout(EVENT_TIMEOUT, async {
                loop {
                    let inbound_message = subscription.recv().await.unwrap();
                    if let MessageBody::Chat { content } = inbound_message.message.body {
                        break content;
                    }
                }
            })
            .await
            .unwrap();
            assert_eq!(content, "fan out");
        }

        sender.stop().await;
        receiver.stop().await;
    }

    #[tokio::test]
    async fn setting_a_callback_replaces_the_previous_one() {
        let server = started_transport().await;
        let client = started_transport().await;

        let (old_tx, mut old_rx) = mpsc::unbounded_channel();
        client.set_connection_callback(Arc::new(move |peer, status| {
            let _ = old_tx.send((peer, status));
        }));
        let mut new_rx = connection_events(&client);

        let port = server.local_addr().unwrap().port();
        client.connect("127.0.0.1", port).await.unwrap();

        let (_, status) = next_event(&mut new_rx).await;
        assert_eq!(status, ConnectionStatus::Connected);
        assert!(old_rx.try_recv().is_err());

        client.stop().await;
        server.stop().await;
    }
}
