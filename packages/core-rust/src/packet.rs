//! Packets exchanged with the networking layer.
//!
//! A packet is an opaque payload behind a small fixed-width header. The header
//! exposes just enough for routing: whether the payload is an operation or a
//! response, whether it is urgent, the target partition, and the call id.
//! Everything else stays serialized until a runner decodes it.
//!
//! # Frame layout (big endian)
//!
//! ```text
//! +---------+-------+--------------+---------+---------+
//! | version | flags | partition_id | call_id | payload |
//! |   u8    |  u8   |     i32      |   u64   |  bytes  |
//! +---------+-------+--------------+---------+---------+
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::partition::{from_wire, to_wire};

/// Current frame version.
pub const PACKET_VERSION: u8 = 1;

/// Size of the fixed header in bytes.
pub const HEADER_LEN: usize = 14;

/// Flag bit: payload is a response (clear means operation).
pub const FLAG_RESPONSE: u8 = 1 << 0;

/// Flag bit: packet belongs on the urgent lane.
pub const FLAG_URGENT: u8 = 1 << 1;

const KNOWN_FLAGS: u8 = FLAG_RESPONSE | FLAG_URGENT;

/// Errors from decoding a packet frame header.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PacketError {
    #[error("frame too short: {len} bytes, header needs {HEADER_LEN}")]
    Truncated { len: usize },
    #[error("unsupported packet version {0}")]
    UnsupportedVersion(u8),
    #[error("unknown packet flags {0:#04x}")]
    UnknownFlags(u8),
}

/// What a packet payload contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Operation,
    Response,
}

/// A serialized operation or response plus routing header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    flags: u8,
    partition_id: i32,
    call_id: u64,
    payload: Bytes,
    /// Node the packet came from (inbound) or goes to (outbound). Set by the
    /// networking layer; not part of the frame.
    origin: Option<String>,
}

impl Packet {
    /// Creates an operation packet. `call_id` 0 means no reply is expected.
    #[must_use]
    pub fn operation(partition_id: Option<u32>, call_id: u64, payload: Bytes) -> Self {
        Self {
            flags: 0,
            partition_id: to_wire(partition_id),
            call_id,
            payload,
            origin: None,
        }
    }

    /// Creates a response packet for `call_id`.
    #[must_use]
    pub fn response(call_id: u64, payload: Bytes) -> Self {
        Self {
            flags: FLAG_RESPONSE,
            partition_id: to_wire(None),
            call_id,
            payload,
            origin: None,
        }
    }

    /// Marks the packet urgent.
    #[must_use]
    pub fn with_urgent(mut self, urgent: bool) -> Self {
        if urgent {
            self.flags |= FLAG_URGENT;
        } else {
            self.flags &= !FLAG_URGENT;
        }
        self
    }

    /// Attaches the remote node id.
    #[must_use]
    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    #[must_use]
    pub fn kind(&self) -> PacketKind {
        if self.flags & FLAG_RESPONSE == 0 {
            PacketKind::Operation
        } else {
            PacketKind::Response
        }
    }

    #[must_use]
    pub fn is_urgent(&self) -> bool {
        self.flags & FLAG_URGENT != 0
    }

    /// Target partition, `None` for generic packets.
    #[must_use]
    pub fn partition_id(&self) -> Option<u32> {
        from_wire(self.partition_id)
    }

    #[must_use]
    pub fn call_id(&self) -> u64 {
        self.call_id
    }

    #[must_use]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    #[must_use]
    pub fn origin(&self) -> Option<&str> {
        self.origin.as_deref()
    }

    /// Serializes header and payload into one frame.
    #[must_use]
    pub fn to_frame(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        buf.put_u8(PACKET_VERSION);
        buf.put_u8(self.flags);
        buf.put_i32(self.partition_id);
        buf.put_u64(self.call_id);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Parses a frame. The payload is sliced, not copied.
    ///
    /// # Errors
    ///
    /// Returns `PacketError` if the header is short, of an unknown version, or
    /// carries unknown flag bits.
    pub fn from_frame(mut frame: Bytes) -> Result<Self, PacketError> {
        check_header(&frame)?;
        frame.advance(1);
        let flags = frame.get_u8();
        let partition_id = frame.get_i32();
        let call_id = frame.get_u64();
        Ok(Self {
            flags,
            partition_id,
            call_id,
            payload: frame,
            origin: None,
        })
    }

    /// Reads the routing partition straight from a frame header without
    /// touching the payload.
    ///
    /// # Errors
    ///
    /// Same header checks as [`from_frame`](Self::from_frame).
    pub fn peek_partition_id(frame: &[u8]) -> Result<Option<u32>, PacketError> {
        check_header(frame)?;
        let raw = i32::from_be_bytes([frame[2], frame[3], frame[4], frame[5]]);
        Ok(from_wire(raw))
    }
}

fn check_header(frame: &[u8]) -> Result<(), PacketError> {
    if frame.len() < HEADER_LEN {
        return Err(PacketError::Truncated { len: frame.len() });
    }
    if frame[0] != PACKET_VERSION {
        return Err(PacketError::UnsupportedVersion(frame[0]));
    }
    if frame[1] & !KNOWN_FLAGS != 0 {
        return Err(PacketError::UnknownFlags(frame[1]));
    }
    Ok(())
}
