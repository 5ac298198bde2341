//! Binary frame codec.
//!
//! Every link-layer transmission is one frame:
//!
//! ```text
//! version (1) | type (1) | sender (32) | message id (32) | ttl (1)
//!   | payload length (varint) | payload | tag (16)
//! ```
//!
//! Control frames (handshake, topology, ack) carry an all-zero tag; data
//! frames carry the AEAD tag over the ciphertext.

use crate::error::{MeshError, Result};

use super::{MessageId, PeerId, MESSAGE_ID_LEN, PEER_ID_LEN, PROTOCOL_VERSION, TAG_LEN};

/// Fixed header size before the varint length
const HEADER_LEN: usize = 1 + 1 + PEER_ID_LEN + MESSAGE_ID_LEN + 1;

/// Frame type discriminant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Handshake = 0x01,
    Data = 0x02,
    Topology = 0x03,
    Ack = 0x04,
}

impl TryFrom<u8> for FrameType {
    type Error = MeshError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(FrameType::Handshake),
            0x02 => Ok(FrameType::Data),
            0x03 => Ok(FrameType::Topology),
            0x04 => Ok(FrameType::Ack),
            other => Err(MeshError::MalformedFrame(format!(
                "unknown frame type 0x{other:02x}"
            ))),
        }
    }
}

/// A decoded link-layer frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub version: u8,
    pub frame_type: FrameType,
    pub sender: PeerId,
    pub message_id: MessageId,
    pub ttl: u8,
    pub payload: Vec<u8>,
    pub tag: [u8; TAG_LEN],
}

impl Frame {
    /// Build a control frame (zero tag).
    pub fn control(frame_type: FrameType, sender: PeerId, message_id: MessageId, ttl: u8, payload: Vec<u8>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            frame_type,
            sender,
            message_id,
            ttl,
            payload,
            tag: [0u8; TAG_LEN],
        }
    }

    /// Encode the frame to wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(HEADER_LEN + 5 + self.payload.len() + TAG_LEN);
        buffer.push(self.version);
        buffer.push(self.frame_type as u8);
        buffer.extend_from_slice(self.sender.as_bytes());
        buffer.extend_from_slice(&self.message_id.0);
        buffer.push(self.ttl);
        write_varint(&mut buffer, self.payload.len() as u64);
        buffer.extend_from_slice(&self.payload);
        buffer.extend_from_slice(&self.tag);
        buffer
    }

    /// Decode a frame from wire bytes, validating the protocol version and
    /// all length fields.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LEN + 1 + TAG_LEN {
            return Err(MeshError::MalformedFrame(format!(
                "frame too short: {} bytes",
                data.len()
            )));
        }

        let mut offset = 0;

        let version = data[offset];
        offset += 1;
        if version != PROTOCOL_VERSION {
            return Err(MeshError::ProtocolMismatch {
                local: PROTOCOL_VERSION,
                remote: version,
            });
        }

        let frame_type = FrameType::try_from(data[offset])?;
        offset += 1;

        let mut sender = [0u8; PEER_ID_LEN];
        sender.copy_from_slice(&data[offset..offset + PEER_ID_LEN]);
        offset += PEER_ID_LEN;

        let mut message_id = [0u8; MESSAGE_ID_LEN];
        message_id.copy_from_slice(&data[offset..offset + MESSAGE_ID_LEN]);
        offset += MESSAGE_ID_LEN;

        let ttl = data[offset];
        offset += 1;

        let (payload_len, varint_len) = read_varint(&data[offset..])?;
        offset += varint_len;

        if payload_len > data.len() as u64 {
            return Err(MeshError::MalformedFrame(format!(
                "declared payload length {payload_len} exceeds frame size"
            )));
        }
        let payload_len = payload_len as usize;
        if offset + payload_len + TAG_LEN != data.len() {
            return Err(MeshError::MalformedFrame(format!(
                "payload length mismatch: declared {payload_len} in a {} byte frame",
                data.len()
            )));
        }

        let payload = data[offset..offset + payload_len].to_vec();
        offset += payload_len;

        let mut tag = [0u8; TAG_LEN];
        tag.copy_from_slice(&data[offset..offset + TAG_LEN]);

        Ok(Self {
            version,
            frame_type,
            sender: PeerId(sender),
            message_id: MessageId(message_id),
            ttl,
            payload,
            tag,
        })
    }
}

/// Append an unsigned LEB128 varint.
pub fn write_varint(buffer: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buffer.push(byte);
            return;
        }
        buffer.push(byte | 0x80);
    }
}

/// Read an unsigned LEB128 varint, returning (value, bytes consumed).
pub fn read_varint(data: &[u8]) -> Result<(u64, usize)> {
    let mut value = 0u64;
    let mut shift = 0u32;
    for (i, &byte) in data.iter().enumerate() {
        if shift >= 64 {
            return Err(MeshError::MalformedFrame("varint overflow".into()));
        }
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
        shift += 7;
    }
    Err(MeshError::MalformedFrame("truncated varint".into()))
}
