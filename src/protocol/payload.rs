//! Typed payloads carried inside frames.
//!
//! The frame header is readable by every relay (needed for forwarding
//! decisions); these payloads hold the parts specific to each frame type.
//! Data payloads keep the destination and session material in the clear and
//! the user content encrypted.

use crate::error::{MeshError, Result};

use super::frame::{read_varint, write_varint};
use super::{MessageId, PeerId, MESSAGE_ID_LEN, PEER_ID_LEN, TAG_LEN};

/// Payload of a DATA frame.
///
/// The sender's session ephemeral (`epoch_pub`) rides in every data frame so
/// the receiver can derive the session key without prior interaction, which
/// is what makes store-and-forward to a previously unseen peer possible.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPayload {
    pub destination: PeerId,
    pub epoch_pub: [u8; 32],
    pub counter: u64,
    pub ciphertext: Vec<u8>,
}

impl DataPayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(PEER_ID_LEN + 32 + 8 + self.ciphertext.len());
        buffer.extend_from_slice(self.destination.as_bytes());
        buffer.extend_from_slice(&self.epoch_pub);
        buffer.extend_from_slice(&self.counter.to_be_bytes());
        buffer.extend_from_slice(&self.ciphertext);
        buffer
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        const FIXED: usize = PEER_ID_LEN + 32 + 8;
        if data.len() < FIXED {
            return Err(MeshError::MalformedFrame("data payload too short".into()));
        }

        let mut destination = [0u8; PEER_ID_LEN];
        destination.copy_from_slice(&data[..PEER_ID_LEN]);

        let mut epoch_pub = [0u8; 32];
        epoch_pub.copy_from_slice(&data[PEER_ID_LEN..PEER_ID_LEN + 32]);

        let mut counter_bytes = [0u8; 8];
        counter_bytes.copy_from_slice(&data[PEER_ID_LEN + 32..FIXED]);

        Ok(Self {
            destination: PeerId(destination),
            epoch_pub,
            counter: u64::from_be_bytes(counter_bytes),
            ciphertext: data[FIXED..].to_vec(),
        })
    }
}

/// Payload of a HANDSHAKE frame (station-to-station flavor).
///
/// The confirmation tag is an AEAD tag over the handshake transcript keyed
/// from the static-static shared secret; verifying it proves the sender holds
/// the private key behind its claimed identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakePayload {
    pub version: u8,
    /// bit 0: this is a response to a received init
    pub flags: u8,
    pub epoch_pub: [u8; 32],
    pub confirmation: [u8; TAG_LEN],
}

impl HandshakePayload {
    pub const FLAG_RESPONSE: u8 = 0x01;

    pub fn is_response(&self) -> bool {
        self.flags & Self::FLAG_RESPONSE != 0
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(2 + 32 + TAG_LEN);
        buffer.push(self.version);
        buffer.push(self.flags);
        buffer.extend_from_slice(&self.epoch_pub);
        buffer.extend_from_slice(&self.confirmation);
        buffer
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() != 2 + 32 + TAG_LEN {
            return Err(MeshError::MalformedFrame(format!(
                "handshake payload wrong size: {} bytes",
                data.len()
            )));
        }

        let mut epoch_pub = [0u8; 32];
        epoch_pub.copy_from_slice(&data[2..34]);

        let mut confirmation = [0u8; TAG_LEN];
        confirmation.copy_from_slice(&data[34..]);

        Ok(Self {
            version: data[0],
            flags: data[1],
            epoch_pub,
            confirmation,
        })
    }
}

/// One reachable destination in a topology announcement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnnouncementEntry {
    pub destination: PeerId,
    pub hop_count: u8,
}

/// Payload of a TOPOLOGY frame: the origin's current view, distance-vector
/// style. Receivers add one hop and gate on the per-origin sequence number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announcement {
    pub sequence: u64,
    pub entries: Vec<AnnouncementEntry>,
}

impl Announcement {
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(16 + self.entries.len() * (PEER_ID_LEN + 1));
        write_varint(&mut buffer, self.sequence);
        write_varint(&mut buffer, self.entries.len() as u64);
        for entry in &self.entries {
            buffer.extend_from_slice(entry.destination.as_bytes());
            buffer.push(entry.hop_count);
        }
        buffer
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let (sequence, used) = read_varint(data)?;
        let mut offset = used;

        let (count, used) = read_varint(&data[offset..])?;
        offset += used;

        if count > data.len() as u64 {
            return Err(MeshError::MalformedFrame(format!(
                "announcement declares {count} entries in {} bytes",
                data.len()
            )));
        }
        let count = count as usize;
        if data.len() != offset + count * (PEER_ID_LEN + 1) {
            return Err(MeshError::MalformedFrame(format!(
                "announcement entry count mismatch: declared {count}"
            )));
        }

        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let mut destination = [0u8; PEER_ID_LEN];
            destination.copy_from_slice(&data[offset..offset + PEER_ID_LEN]);
            offset += PEER_ID_LEN;
            let hop_count = data[offset];
            offset += 1;
            entries.push(AnnouncementEntry {
                destination: PeerId(destination),
                hop_count,
            });
        }

        Ok(Self { sequence, entries })
    }
}

/// Payload of an ACK frame: routed back to the original sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckPayload {
    pub destination: PeerId,
    pub acked: MessageId,
}

impl AckPayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(PEER_ID_LEN + MESSAGE_ID_LEN);
        buffer.extend_from_slice(self.destination.as_bytes());
        buffer.extend_from_slice(&self.acked.0);
        buffer
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() != PEER_ID_LEN + MESSAGE_ID_LEN {
            return Err(MeshError::MalformedFrame(format!(
                "ack payload wrong size: {} bytes",
                data.len()
            )));
        }

        let mut destination = [0u8; PEER_ID_LEN];
        destination.copy_from_slice(&data[..PEER_ID_LEN]);

        let mut acked = [0u8; MESSAGE_ID_LEN];
        acked.copy_from_slice(&data[PEER_ID_LEN..]);

        Ok(Self {
            destination: PeerId(destination),
            acked: MessageId(acked),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_payload_round_trip() {
        let payload = DataPayload {
            destination: PeerId([3u8; 32]),
            epoch_pub: [4u8; 32],
            counter: 42,
            ciphertext: vec![9, 8, 7],
        };
        let back = DataPayload::decode(&payload.encode()).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn data_payload_rejects_short_input() {
        assert!(DataPayload::decode(&[0u8; 10]).is_err());
    }

    #[test]
    fn handshake_payload_round_trip() {
        let payload = HandshakePayload {
            version: 1,
            flags: HandshakePayload::FLAG_RESPONSE,
            epoch_pub: [5u8; 32],
            confirmation: [6u8; TAG_LEN],
        };
        let back = HandshakePayload::decode(&payload.encode()).unwrap();
        assert_eq!(back, payload);
        assert!(back.is_response());
    }

    #[test]
    fn announcement_round_trip() {
        let announcement = Announcement {
            sequence: 1000,
            entries: vec![
                AnnouncementEntry {
                    destination: PeerId([1u8; 32]),
                    hop_count: 1,
                },
                AnnouncementEntry {
                    destination: PeerId([2u8; 32]),
                    hop_count: 3,
                },
            ],
        };
        let back = Announcement::decode(&announcement.encode()).unwrap();
        assert_eq!(back, announcement);
    }

    #[test]
    fn empty_announcement_round_trip() {
        let announcement = Announcement {
            sequence: 0,
            entries: vec![],
        };
        let back = Announcement::decode(&announcement.encode()).unwrap();
        assert_eq!(back, announcement);
    }

    #[test]
    fn announcement_rejects_count_mismatch() {
        let mut bytes = Announcement {
            sequence: 7,
            entries: vec![AnnouncementEntry {
                destination: PeerId([1u8; 32]),
                hop_count: 1,
            }],
        }
        .encode();
        bytes.truncate(bytes.len() - 1);
        assert!(Announcement::decode(&bytes).is_err());
    }

    #[test]
    fn ack_payload_round_trip() {
        let payload = AckPayload {
            destination: PeerId([8u8; 32]),
            acked: MessageId([9u8; 32]),
        };
        let back = AckPayload::decode(&payload.encode()).unwrap();
        assert_eq!(back, payload);
    }
}
