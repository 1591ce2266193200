//! Identity and status types shared across the networking layers.

use std::fmt;
use std::fmt::Display;

use rand::rngs::OsRng;
use rand::RngCore;

/// Length in bytes of a [`PeerId`].
pub const PEER_ID_LENGTH: usize = 32;

/// Length in bytes of a [`MessageId`].
pub const MESSAGE_ID_LENGTH: usize = 16;

/// Opaque 32-byte peer identifier.
///
/// Generated from the OS RNG at session establishment (and once per node for
/// the node's own identity). Ids are link-local labels: each side of a
/// connection assigns its own id to the link, and ids are never persisted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub [u8; PEER_ID_LENGTH]);

impl PeerId {
    /// Generate a fresh random peer id.
    pub fn generate() -> Self {
        let mut bytes = [0u8; PEER_ID_LENGTH];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; PEER_ID_LENGTH] {
        &self.0
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Log lines only need enough hex to tell peers apart.
        for byte in self.0.iter().take(8) {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl From<[u8; PEER_ID_LENGTH]> for PeerId {
    fn from(bytes: [u8; PEER_ID_LENGTH]) -> Self {
        Self(bytes)
    }
}

/// Random 16-byte message identifier.
///
/// Informational: carried on every wire message for logging and future
/// deduplication, not required for protocol correctness.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MessageId(pub [u8; MESSAGE_ID_LENGTH]);

impl MessageId {
    pub fn generate() -> Self {
        let mut bytes = [0u8; MESSAGE_ID_LENGTH];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; MESSAGE_ID_LENGTH] {
        &self.0
    }
}

impl Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0.iter() {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Connection state of a peer as seen by the local transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConnectionStatus {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Error = 3,
}

impl ConnectionStatus {
    /// Decode a wire status byte. Out-of-range values map to `Error` rather
    /// than failing the whole message.
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionStatus::Disconnected,
            1 => ConnectionStatus::Connecting,
            2 => ConnectionStatus::Connected,
            _ => ConnectionStatus::Error,
        }
    }
}

impl Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// Lifecycle state of a single file transfer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FileTransferStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Rejected,
}

impl Display for FileTransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FileTransferStatus::Pending => "pending",
            FileTransferStatus::InProgress => "in progress",
            FileTransferStatus::Completed => "completed",
            FileTransferStatus::Failed => "failed",
            FileTransferStatus::Rejected => "rejected",
        };
        write!(f, "{s}")
    }
}

/// Snapshot of what the transport knows about a connected peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerInfo {
    pub id: PeerId,
    pub name: String,
    pub ip_address: String,
    pub port: u16,
    pub status: ConnectionStatus,
}
