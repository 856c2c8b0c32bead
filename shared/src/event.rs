//! Event envelope and wire header codec
//!
//! An event is the unit of exchange between clients and the relay. On the wire
//! every event is a fixed 12-byte header followed by its payload:
//!
//! ```text
//! offset 0   : type      (u32, big-endian)
//! offset 4   : size      (u32, big-endian, payload length 0..=1012)
//! offset 8   : checksum  (u32, big-endian, Adler-32 of the payload only)
//! offset 12  : payload   (size bytes)
//! ```
//!
//! An [`Event`] owns an inline, fixed-capacity payload buffer and is never
//! resized. It is either freshly built (the stored checksum is stale) or
//! sealed (checksum recomputed and stored). Senders seal right before
//! transmission; receivers recompute and compare before trusting anything.

use crate::checksum::checksum;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Largest complete frame, header included
pub const MAX_EVENT_SIZE: usize = 1024;
/// Encoded header length
pub const HEADER_SIZE: usize = 12;
/// Largest payload an event can carry
pub const MAX_PAYLOAD_SIZE: usize = MAX_EVENT_SIZE - HEADER_SIZE;

/// Raw type value reserved for "not a valid event". Never transmitted.
pub const INVALID_EVENT_TYPE: u32 = u32::MAX;

/// Event types understood by the relay and client
///
/// Values are fixed for wire compatibility. Applications may transmit other
/// raw type values; the relay forwards them untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum EventType {
    /// Emitted periodically by the relay to keep clients in lockstep
    Tick = 0,
    /// Client asks the relay for its uuid; the relay answers with the same type
    UuidRequest = 1,
    PlayerJoin = 2,
    /// Player is leaving; the relay drops the sender after forwarding it
    PlayerLeave = 3,
    PlayerReady = 4,
}

impl EventType {
    /// Maps a wire type value to a known event type
    ///
    /// Returns `None` for application-defined values and for the reserved
    /// [`INVALID_EVENT_TYPE`].
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(EventType::Tick),
            1 => Some(EventType::UuidRequest),
            2 => Some(EventType::PlayerJoin),
            3 => Some(EventType::PlayerLeave),
            4 => Some(EventType::PlayerReady),
            _ => None,
        }
    }

    /// Wire value of this type
    pub fn raw(self) -> u32 {
        self as u32
    }
}

/// Errors raised while building, encoding or decoding events
#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("payload of {size} bytes exceeds maximum of {max}")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("frame of {len} bytes is shorter than the 12-byte header")]
    ShortHeader { len: usize },

    #[error("header declares {declared} payload bytes but only {available} arrived")]
    Truncated { declared: usize, available: usize },

    #[error("checksum mismatch: header carries {stored:#010x}, payload digests to {computed:#010x}")]
    ChecksumMismatch { stored: u32, computed: u32 },

    #[error("event type {0:#x} is reserved as invalid")]
    InvalidType(u32),

    #[error("payload serialization failed: {0}")]
    Payload(#[from] bincode::Error),
}

/// Fixed-size event header
///
/// Carried in front of every payload as three big-endian `u32` fields. The
/// checksum covers the payload only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventHeader {
    /// Raw event type
    pub kind: u32,
    /// Payload length in bytes
    pub size: u32,
    /// Adler-32 of the payload, valid once sealed
    pub checksum: u32,
}

impl EventHeader {
    /// Encodes the header in network byte order
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[0..4].copy_from_slice(&self.kind.to_be_bytes());
        bytes[4..8].copy_from_slice(&self.size.to_be_bytes());
        bytes[8..12].copy_from_slice(&self.checksum.to_be_bytes());
        bytes
    }

    /// Decodes a header from the first [`HEADER_SIZE`] bytes of `bytes`
    pub fn decode(bytes: &[u8]) -> Result<Self, EventError> {
        if bytes.len() < HEADER_SIZE {
            return Err(EventError::ShortHeader { len: bytes.len() });
        }

        let field = |offset: usize| {
            u32::from_be_bytes([
                bytes[offset],
                bytes[offset + 1],
                bytes[offset + 2],
                bytes[offset + 3],
            ])
        };

        Ok(Self {
            kind: field(0),
            size: field(4),
            checksum: field(8),
        })
    }

    /// Payload length as declared by the header
    pub fn payload_len(&self) -> usize {
        self.size as usize
    }
}

/// One framed protocol message with an inline payload buffer
#[derive(Clone)]
pub struct Event {
    header: EventHeader,
    payload: [u8; MAX_PAYLOAD_SIZE],
}

impl Event {
    /// Creates an event with a zeroed header (type tick, empty payload)
    pub fn new() -> Self {
        Self {
            header: EventHeader::default(),
            payload: [0u8; MAX_PAYLOAD_SIZE],
        }
    }

    /// Creates an empty event of the given type
    pub fn with_type(kind: EventType) -> Self {
        let mut event = Self::new();
        event.header.kind = kind.raw();
        event
    }

    /// Creates an event of the given type carrying a copy of `payload`
    pub fn with_payload(kind: EventType, payload: &[u8]) -> Result<Self, EventError> {
        let mut event = Self::with_type(kind);
        event.set_payload(payload)?;
        Ok(event)
    }

    /// Creates an event whose payload is `value` serialized with bincode
    pub fn encode_payload<T: Serialize>(kind: EventType, value: &T) -> Result<Self, EventError> {
        let bytes = bincode::serialize(value)?;
        Self::with_payload(kind, &bytes)
    }

    /// Deserializes the payload with bincode
    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T, EventError> {
        Ok(bincode::deserialize(self.payload())?)
    }

    /// Raw type value as carried on the wire
    pub fn raw_type(&self) -> u32 {
        self.header.kind
    }

    /// Known event type, if the raw value is one
    pub fn event_type(&self) -> Option<EventType> {
        EventType::from_raw(self.header.kind)
    }

    /// Changes the event type, keeping the payload
    ///
    /// The checksum does not cover the type, so a sealed event stays valid.
    pub fn set_type(&mut self, kind: EventType) {
        self.header.kind = kind.raw();
    }

    /// Sets an application-defined raw type value
    pub fn set_raw_type(&mut self, raw: u32) {
        self.header.kind = raw;
    }

    /// False only for the reserved [`INVALID_EVENT_TYPE`], which
    /// [`seal_frame`](Self::seal_frame) refuses to encode
    pub fn is_valid_type(&self) -> bool {
        self.header.kind != INVALID_EVENT_TYPE
    }

    /// Payload length in bytes
    pub fn size(&self) -> usize {
        self.header.payload_len()
    }

    /// Checksum currently stored in the header
    pub fn stored_checksum(&self) -> u32 {
        self.header.checksum
    }

    /// The first `size` bytes of the payload buffer
    ///
    /// Clamped to the buffer capacity, so a header declaring too much never
    /// reads past the end.
    pub fn payload(&self) -> &[u8] {
        &self.payload[..self.size().min(MAX_PAYLOAD_SIZE)]
    }

    /// Replaces the payload. Rejects anything larger than [`MAX_PAYLOAD_SIZE`]
    /// and leaves the event untouched in that case.
    pub fn set_payload(&mut self, bytes: &[u8]) -> Result<(), EventError> {
        if bytes.len() > MAX_PAYLOAD_SIZE {
            return Err(EventError::PayloadTooLarge {
                size: bytes.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }

        self.payload[..bytes.len()].copy_from_slice(bytes);
        self.header.size = bytes.len() as u32;
        Ok(())
    }

    /// Digest of the first `size` payload bytes
    pub fn compute_checksum(&self) -> u32 {
        checksum(self.payload())
    }

    /// Stores a fresh checksum in the header
    pub fn seal(&mut self) {
        self.header.checksum = self.compute_checksum();
    }

    /// True if the stored checksum matches the payload. Fails closed when the
    /// declared size exceeds the buffer.
    pub fn verify(&self) -> bool {
        if self.size() > MAX_PAYLOAD_SIZE {
            return false;
        }
        self.header.checksum == self.compute_checksum()
    }

    /// Length of the encoded frame, header included
    pub fn frame_len(&self) -> usize {
        HEADER_SIZE + self.size()
    }

    /// Encodes header and payload. Does not seal.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.frame_len());
        bytes.extend_from_slice(&self.header.encode());
        bytes.extend_from_slice(self.payload());
        bytes
    }

    /// Seals the event and encodes it for transmission. Refuses the reserved
    /// invalid type.
    pub fn seal_frame(&mut self) -> Result<Vec<u8>, EventError> {
        if !self.is_valid_type() {
            return Err(EventError::InvalidType(self.header.kind));
        }
        self.seal();
        Ok(self.to_bytes())
    }

    /// Decodes one complete frame and checks its integrity
    ///
    /// Rejects frames whose declared size is larger than the payload capacity
    /// or than the bytes actually present, and frames whose checksum does not
    /// match. Bytes past the declared payload are ignored.
    pub fn from_frame(frame: &[u8]) -> Result<Self, EventError> {
        let header = EventHeader::decode(frame)?;
        let declared = header.payload_len();

        if declared > MAX_PAYLOAD_SIZE {
            return Err(EventError::PayloadTooLarge {
                size: declared,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        let available = frame.len() - HEADER_SIZE;
        if declared > available {
            return Err(EventError::Truncated {
                declared,
                available,
            });
        }

        let mut event = Self::new();
        event.header = header;
        event.payload[..declared].copy_from_slice(&frame[HEADER_SIZE..HEADER_SIZE + declared]);

        let computed = event.compute_checksum();
        if computed != header.checksum {
            return Err(EventError::ChecksumMismatch {
                stored: header.checksum,
                computed,
            });
        }

        Ok(event)
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("kind", &self.header.kind)
            .field("size", &self.header.size)
            .field("checksum", &format_args!("{:#010x}", self.header.checksum))
            .finish()
    }
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.header == other.header && self.payload() == other.payload()
    }
}

impl Eq for Event {}
