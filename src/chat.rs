//! Chat on top of the transport: send, broadcast, in-memory history.
//!
//! History is keyed by the link-local peer id of the session a message was
//! exchanged on, which is the same id callers see in
//! [`Transport::connected_peers`]. Nothing here is persisted.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

use tracing::debug;

use crate::models::message::Message;
use crate::models::message::MessageBody;
use crate::models::peer::PeerId;
use crate::transport::InboundMessage;
use crate::transport::Transport;
use crate::transport::TransportError;

/// Default window for per-peer history queries.
pub const DEFAULT_HISTORY_PER_PEER: usize = 50;

/// Default window for merged history queries.
pub const DEFAULT_HISTORY_OVERALL: usize = 100;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChatEntry {
    pub sender_id: PeerId,
    pub sender_name: String,
    pub content: String,
    pub timestamp: u64,
}

/// Invoked for every inbound chat message.
pub type ChatMessageCallback = Arc<dyn Fn(&ChatEntry) + Send + Sync>;

struct ChatInner {
    transport: Transport,
    local_name: Mutex<String>,
    history: Mutex<HashMap<PeerId, Vec<ChatEntry>>>,
    message_callback: Mutex<Option<ChatMessageCallback>>,
}

#[derive(Clone)]
pub struct ChatManager {
    inner: Arc<ChatInner>,
}

impl ChatManager {
    /// Must be called from within a tokio runtime: the inbound handler task
    /// is spawned here.
    pub fn new(transport: Transport, local_name: impl Into<String>) -> Self {
        let mut inbound = transport.subscribe();
        let manager = Self {
            inner: Arc::new(ChatInner {
                transport,
                local_name: Mutex::new(local_name.into()),
                history: Mutex::new(HashMap::new()),
                message_callback: Mutex::new(None),
            }),
        };

        let handler = manager.clone();
        tokio::spawn(async move {
            while let Some(message) = inbound.recv().await {
                handler.handle_inbound(message);
            }
        });
        manager
    }

    pub fn local_name(&self) -> String {
        self.inner.local_name.lock().unwrap().clone()
    }

    pub fn set_local_name(&self, name: impl Into<String>) {
        *self.inner.local_name.lock().unwrap() = name.into();
    }

    pub fn set_message_callback(&self, callback: ChatMessageCallback) {
        *self.inner.message_callback.lock().unwrap() = Some(callback);
    }

    /// Send a chat message to one peer and record it in that peer's history.
    pub async fn send(&self, peer_id: PeerId, content: &str) -> Result<(), TransportError> {
        let message = Message::new(
            self.inner.transport.self_id(),
            MessageBody::Chat {
                content: content.to_string(),
            },
        );
        let timestamp = message.timestamp;
        self.inner.transport.send(peer_id, message).await?;

        self.record(
            peer_id,
            ChatEntry {
                sender_id: self.inner.transport.self_id(),
                sender_name: self.local_name(),
                content: content.to_string(),
                timestamp,
            },
        );
        Ok(())
    }

    /// Send a chat message to every connected peer and record one history
    /// entry per peer.
    pub async fn broadcast(&self, content: &str) {
        let message = Message::new(
            self.inner.transport.self_id(),
            MessageBody::Chat {
                content: content.to_string(),
            },
        );
        let timestamp = message.timestamp;
        self.inner.transport.broadcast(message).await;

        let entry = ChatEntry {
            sender_id: self.inner.transport.self_id(),
            sender_name: self.local_name(),
            content: content.to_string(),
            timestamp,
        };
        for peer in self.inner.transport.connected_peers() {
            self.record(peer.id, entry.clone());
        }
    }

    /// The most recent `max` messages exchanged with one peer, oldest first.
    pub fn history(&self, peer_id: PeerId, max: usize) -> Vec<ChatEntry> {
        let history = self.inner.history.lock().unwrap();
        match history.get(&peer_id) {
            None => Vec::new(),
            Some(entries) => {
                let skip = entries.len().saturating_sub(max);
                entries[skip..].to_vec()
            }
        }
    }

    /// The most recent `max` messages across all peers, ordered by timestamp.
    pub fn all_history(&self, max: usize) -> Vec<ChatEntry> {
        let mut merged: Vec<ChatEntry> = {
            let history = self.inner.history.lock().unwrap();
            history.values().flatten().cloned().collect()
        };
        merged.sort_by_key(|entry| entry.timestamp);
        let skip = merged.len().saturating_sub(max);
        merged.split_off(skip)
    }

    fn handle_inbound(&self, inbound: InboundMessage) {
        let MessageBody::Chat { content } = inbound.message.body else {
            return;
        };

        debug!(
            "chat message from peer {} ({} bytes)",
            inbound.peer_id,
            content.len()
        );
        let entry = ChatEntry {
            sender_id: inbound.message.sender,
            // Names are not negotiated on the wire.
            sender_name: "unknown".to_string(),
            content,
            timestamp: inbound.message.timestamp,
        };
        self.record(inbound.peer_id, entry.clone());

        let callback = self.inner.message_callback.lock().unwrap().clone();
        if let Some(callback) = callback {
            callback(&entry);
        }
    }

    fn record(&self, peer_id: PeerId, entry: ChatEntry) {
        let mut history = self.inner.history.lock().unwrap();
        history.entry(peer_id).or_default().push(entry);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;
    use tokio::time::timeout;

    use super::*;
    use crate::models::peer::MessageId;

    fn inbound_chat(peer_id: PeerId, sender: PeerId, content: &str, timestamp: u64) -> InboundMessage {
        InboundMessage {
            peer_id,
            message: Message {
                sender,
                id: MessageId::generate(),
                timestamp,
                body: MessageBody::Chat {
                    content: content.to_string(),
                },
            },
        }
    }

    #[tokio::test]
    async fn inbound_chat_is_recorded_and_reported() {
        let manager = ChatManager::new(Transport::new(), "tester");
        let (tx, mut rx) = mpsc::unbounded_channel();
        manager.set_message_callback(Arc::new(move |entry| {
            let _ = tx.send(entry.clone());
        }));

        let peer = PeerId::generate();
        let sender = PeerId::generate();
        manager.handle_inbound(inbound_chat(peer, sender, "hello", 1111));

        let entry = rx.recv().await.unwrap();
        assert_eq!(entry.sender_id, sender);
        assert_eq!(entry.content, "hello");
        assert_eq!(entry.timestamp, 1111);

        let history = manager.history(peer, DEFAULT_HISTORY_PER_PEER);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].content, "hello");
    }

    #[tokio::test]
    async fn non_chat_messages_are_ignored() {
        let manager = ChatManager::new(Transport::new(), "tester");
        let peer = PeerId::generate();
        manager.handle_inbound(InboundMessage {
            peer_id: peer,
            message: Message::new(PeerId::generate(), MessageBody::Ping),
        });
        assert!(manager.history(peer, DEFAULT_HISTORY_PER_PEER).is_empty());
    }

    #[tokio::test]
    async fn history_keeps_the_most_recent_entries() {
        let manager = ChatManager::new(Transport::new(), "tester");
        let peer = PeerId::generate();
        let sender = PeerId::generate();
        for i in 0..60 {
            manager.handle_inbound(inbound_chat(peer, sender, &format!("m{i}"), i));
        }

        let history = manager.history(peer, 50);
        assert_eq!(history.len(), 50);
        assert_eq!(history.first().unwrap().content, "m10");
        assert_eq!(history.last().unwrap().content, "m59");

        assert!(manager.history(PeerId::generate(), 50).is_empty());
    }

    #[tokio::test]
    async fn all_history_is_merged_and_ordered_by_timestamp() {
        let manager = ChatManager::new(Transport::new(), "tester");
        let peer_a = PeerId::generate();
        let peer_b = PeerId::generate();
        let sender = PeerId::generate();

        manager.handle_inbound(inbound_chat(peer_a, sender, "third", 30));
        manager.handle_inbound(inbound_chat(peer_b, sender, "first", 10));
        manager.handle_inbound(inbound_chat(peer_a, sender, "second", 20));

        let merged = manager.all_history(DEFAULT_HISTORY_OVERALL);
        let contents: Vec<&str> = merged.iter().map(|e| e.content.as_str()).collect();
        assert_eq!(contents, vec!["first", "second", "third"]);

        let limited = manager.all_history(2);
        let contents: Vec<&str> = limited.iter().map(|e| e.content.as_str()).collect();
        assert_eq!(contents, vec!["second", "third"]);
    }

    #[tokio::test]
    async fn chat_round_trips_between_two_nodes() {
        let a = Transport::new();
        a.start(0).await.unwrap();
        let b = Transport::new();
        b.start(0).await.unwrap();

        let a_chat = ChatManager::new(a.clone(), "alice");
        let b_chat = ChatManager::new(b.clone(), "bob");
        let (tx, mut rx) = mpsc::unbounded_channel();
        b_chat.set_message_callback(Arc::new(move |entry| {
            let _ = tx.send(entry.clone());
        }));

        let b_port = b.local_addr().unwrap().port();
        let peer = a.connect("127.0.0.1", b_port).await.unwrap();
        a_chat.send(peer, "hi").await.unwrap();

        let entry = timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.content, "hi");
        assert_eq!(entry.sender_id, a.self_id());

        // The sender's own copy lands in its history for that peer.
        let sent = a_chat.history(peer, DEFAULT_HISTORY_PER_PEER);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].sender_id, a.self_id());
        assert_eq!(sent[0].sender_name, "alice");

        a.stop().await;
        b.stop().await;
    }

    #[tokio::test]
    async fn broadcast_records_one_entry_per_connected_peer() {
        let hub = Transport::new();
        hub.start(0).await.unwrap();
        let spoke_a = Transport::new();
        spoke_a.start(0).await.unwrap();
        let spoke_b = Transport::new();
        spoke_b.start(0).await.unwrap();

        let hub_chat = ChatManager::new(hub.clone(), "hub");
        let peer_a = hub
            .connect("127.0.0.1", spoke_a.local_addr().unwrap().port())
            .await
            .unwrap();
        let peer_b = hub
            .connect("127.0.0.1", spoke_b.local_addr().unwrap().port())
            .await
            .unwrap();

        hub_chat.broadcast("to everyone").await;

        for peer in [peer_a, peer_b] {
            let history = hub_chat.history(peer, DEFAULT_HISTORY_PER_PEER);
            assert_eq!(history.len(), 1);
            assert_eq!(history[0].content, "to everyone");
        }

        hub.stop().await;
        spoke_a.stop().await;
        spoke_b.stop().await;
    }
}
