//! Fixed-size packet framing.
//!
//! Every message travels as a run of 1056-byte frames:
//!
//! ```text
//! +-------------+------------+---------------+----------------+
//! | messageID   | total      | sequence      | payload        |
//! | 16 bytes    | 8 bytes LE | 8 bytes LE    | 1024 bytes     |
//! +-------------+------------+---------------+----------------+
//! ```
//!
//! `total` is the number of packets the message spans; `sequence` is the
//! 0-based index of this packet. The last packet is zero-padded, and the
//! padding is trimmed again on reassembly.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use uuid::Uuid;

use crate::constants::{PACKET_ADDR_SIZE, PACKET_DATA_SIZE, PACKET_ID_SIZE, PACKET_TOTAL_SIZE};
use crate::error::{Error, Result};

/// Random 128-bit identifier shared by all packets of one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId([u8; PACKET_ID_SIZE]);

impl MessageId {
    pub fn random() -> Self {
        Self(Uuid::new_v4().into_bytes())
    }

    pub fn from_bytes(bytes: [u8; PACKET_ID_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; PACKET_ID_SIZE] {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// One fixed-size frame of a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    message_id: MessageId,
    total: i64,
    sequence: i64,
    payload: [u8; PACKET_DATA_SIZE],
}

impl Packet {
    pub fn message_id(&self) -> MessageId {
        self.message_id
    }

    /// Total number of packets in the message this frame belongs to.
    pub fn total(&self) -> i64 {
        self.total
    }

    /// 0-based index of this frame within its message.
    pub fn sequence(&self) -> i64 {
        self.sequence
    }

    pub fn payload(&self) -> &[u8; PACKET_DATA_SIZE] {
        &self.payload
    }

    /// Encode the frame into its 1056-byte wire form.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(PACKET_TOTAL_SIZE);
        buf.put_slice(self.message_id.as_bytes());
        buf.put_i64_le(self.total);
        buf.put_i64_le(self.sequence);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Decode a frame from exactly [`PACKET_TOTAL_SIZE`] bytes.
    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        if raw.len() != PACKET_TOTAL_SIZE {
            return Err(Error::protocol(format!(
                "packet frame must be {PACKET_TOTAL_SIZE} bytes, got {}",
                raw.len()
            )));
        }

        let mut offset = 0;
        let mut id = [0u8; PACKET_ID_SIZE];
        id.copy_from_slice(&raw[offset..offset + PACKET_ID_SIZE]);
        offset += PACKET_ID_SIZE;

        let mut addr = [0u8; PACKET_ADDR_SIZE];
        addr.copy_from_slice(&raw[offset..offset + PACKET_ADDR_SIZE]);
        let total = i64::from_le_bytes(addr);
        offset += PACKET_ADDR_SIZE;

        addr.copy_from_slice(&raw[offset..offset + PACKET_ADDR_SIZE]);
        let sequence = i64::from_le_bytes(addr);
        offset += PACKET_ADDR_SIZE;

        if total <= 0 || sequence < 0 || sequence >= total {
            return Err(Error::protocol(format!(
                "packet addressing out of range: sequence {sequence} of {total}"
            )));
        }

        let mut payload = [0u8; PACKET_DATA_SIZE];
        payload.copy_from_slice(&raw[offset..PACKET_TOTAL_SIZE]);

        Ok(Self {
            message_id: MessageId::from_bytes(id),
            total,
            sequence,
            payload,
        })
    }
}

/// Split a message body into packets sharing one fresh message id.
///
/// An empty body still produces one packet (sequence 0, total 1).
pub fn serialize(data: &[u8]) -> Result<Vec<Packet>> {
    let total = data.len().div_ceil(PACKET_DATA_SIZE).max(1);
    if total as u128 > i64::MAX as u128 {
        return Err(Error::ExceedsAddrLength);
    }

    let message_id = MessageId::random();
    let mut packets = Vec::with_capacity(total);
    for sequence in 0..total {
        let start = sequence * PACKET_DATA_SIZE;
        let end = data.len().min(start + PACKET_DATA_SIZE);
        let mut payload = [0u8; PACKET_DATA_SIZE];
        if start < data.len() {
            payload[..end - start].copy_from_slice(&data[start..end]);
        }
        packets.push(Packet {
            message_id,
            total: total as i64,
            sequence: sequence as i64,
            payload,
        });
    }
    Ok(packets)
}

/// Reassemble a message body from its packets, given in sequence order.
///
/// Trailing zero padding from the last packet is trimmed. Message bodies
/// always end with the 0x04 delimiter, so the trim never eats content.
pub fn deserialize(packets: &[Packet]) -> Vec<u8> {
    let mut data = Vec::with_capacity(packets.len() * PACKET_DATA_SIZE);
    for packet in packets {
        data.extend_from_slice(&packet.payload);
    }
    while data.last() == Some(&0) {
        data.pop();
    }
    data
}
