//! Wire protocol for the mesh.
//!
//! Defines the frame layout exchanged over the link layer, the typed payloads
//! carried inside frames, and the identifiers (peer ids, message ids) the
//! router keys on.

mod frame;
mod payload;

pub use frame::{Frame, FrameType};
pub use payload::{Announcement, AnnouncementEntry, DataPayload, HandshakePayload, AckPayload};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Protocol version for compatibility checking
pub const PROTOCOL_VERSION: u8 = 1;

/// Maximum Time-To-Live for message routing
pub const MAX_TTL: u8 = 7;

/// Length of a peer identity (X25519 public key) in bytes
pub const PEER_ID_LEN: usize = 32;

/// Length of a message identifier (SHA-256) in bytes
pub const MESSAGE_ID_LEN: usize = 32;

/// Length of the authentication tag in bytes
pub const TAG_LEN: usize = 16;

/// A peer identity: the raw X25519 public key, doubling as routing address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub [u8; PEER_ID_LEN]);

impl PeerId {
    pub fn as_bytes(&self) -> &[u8; PEER_ID_LEN] {
        &self.0
    }

    /// Short hex form for logs
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl From<[u8; PEER_ID_LEN]> for PeerId {
    fn from(bytes: [u8; PEER_ID_LEN]) -> Self {
        Self(bytes)
    }
}

/// Unique message identifier used for deduplication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub [u8; MESSAGE_ID_LEN]);

impl MessageId {
    /// Derive the id of a data message: hash of sender, send counter, and
    /// ciphertext. Identical content re-sent under a new counter gets a new id.
    pub fn for_data(sender: &PeerId, counter: u64, ciphertext: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(sender.as_bytes());
        hasher.update(counter.to_be_bytes());
        hasher.update(ciphertext);
        Self(hasher.finalize().into())
    }

    /// Derive the id of an acknowledgment for a given message.
    pub fn for_ack(sender: &PeerId, acked: &MessageId) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"ack");
        hasher.update(sender.as_bytes());
        hasher.update(acked.0);
        Self(hasher.finalize().into())
    }

    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// A routed message as the router and store-and-forward queue see it.
///
/// Immutable once created; the TTL stamped here is the remaining hop budget
/// at this node. The payload bytes are the encoded [`DataPayload`] or
/// [`AckPayload`] (ciphertext included), never plaintext.
#[derive(Debug, Clone)]
pub struct MeshMessage {
    pub id: MessageId,
    pub frame_type: FrameType,
    pub sender: PeerId,
    pub destination: PeerId,
    pub ttl: u8,
    pub payload: Vec<u8>,
    pub tag: [u8; TAG_LEN],
    pub created_at: DateTime<Utc>,
}

impl MeshMessage {
    /// Approximate buffered size, used for queue byte accounting.
    pub fn size_bytes(&self) -> usize {
        self.payload.len() + PEER_ID_LEN + MESSAGE_ID_LEN + TAG_LEN + 3
    }

    /// Re-encode as a frame with the given remaining TTL.
    pub fn to_frame(&self, ttl: u8) -> Frame {
        Frame {
            version: PROTOCOL_VERSION,
            frame_type: self.frame_type,
            sender: self.sender,
            message_id: self.id,
            ttl,
            payload: self.payload.clone(),
            tag: self.tag,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_ids_are_stable_and_distinct() {
        let sender = PeerId([1u8; 32]);
        let a = MessageId::for_data(&sender, 1, b"hello");
        let b = MessageId::for_data(&sender, 1, b"hello");
        let c = MessageId::for_data(&sender, 2, b"hello");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn ack_id_differs_from_data_id() {
        let sender = PeerId([2u8; 32]);
        let data = MessageId::for_data(&sender, 1, b"payload");
        let ack = MessageId::for_ack(&sender, &data);
        assert_ne!(data, ack);
    }
}
