//! Typed wire messages.
//!
//! Every message shares a fixed envelope (sender, message id, timestamp); the
//! payload is a sum type with one variant per wire tag, so handlers match on
//! the variant instead of downcasting.

use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use super::peer::ConnectionStatus;
use super::peer::MessageId;
use super::peer::PeerId;

/// Wire type tags. The numbering is part of the protocol; tags 2 and 5 are
/// reserved and never produced.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Chat = 0,
    FileRequest = 1,
    FileChunk = 3,
    FileComplete = 4,
    Ping = 6,
    Pong = 7,
    ConnectionNotification = 8,
}

impl MessageType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(MessageType::Chat),
            1 => Some(MessageType::FileRequest),
            3 => Some(MessageType::FileChunk),
            4 => Some(MessageType::FileComplete),
            6 => Some(MessageType::Ping),
            7 => Some(MessageType::Pong),
            8 => Some(MessageType::ConnectionNotification),
            _ => None,
        }
    }
}

/// Type-specific payload of a [`Message`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MessageBody {
    Chat {
        content: String,
    },
    FileRequest {
        filename: String,
        file_size: u64,
    },
    FileChunk {
        file_id: String,
        chunk_index: u32,
        data: Vec<u8>,
    },
    FileComplete {
        file_id: String,
        success: bool,
        error: String,
    },
    Ping,
    Pong,
    /// A peer announcing its own node id and status on a fresh connection.
    ConnectionNotification {
        peer_id: PeerId,
        status: ConnectionStatus,
    },
}

impl MessageBody {
    pub fn message_type(&self) -> MessageType {
        match self {
            MessageBody::Chat { .. } => MessageType::Chat,
            MessageBody::FileRequest { .. } => MessageType::FileRequest,
            MessageBody::FileChunk { .. } => MessageType::FileChunk,
            MessageBody::FileComplete { .. } => MessageType::FileComplete,
            MessageBody::Ping => MessageType::Ping,
            MessageBody::Pong => MessageType::Pong,
            MessageBody::ConnectionNotification { .. } => MessageType::ConnectionNotification,
        }
    }
}

/// One framed message: envelope plus payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub sender: PeerId,
    pub id: MessageId,
    pub timestamp: u64,
    pub body: MessageBody,
}

impl Message {
    /// Build a new message with a fresh id and the current time.
    pub fn new(sender: PeerId, body: MessageBody) -> Self {
        Self {
            sender,
            id: MessageId::generate(),
            timestamp: unix_timestamp_now(),
            body,
        }
    }
}

/// Seconds since the Unix epoch.
pub fn unix_timestamp_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
