//! Stream frame re-assembly
//!
//! TCP delivers a byte stream, not messages: one read may return half a frame,
//! or the tail of one frame followed by the head of the next. A
//! [`FrameAssembler`] buffers whatever a connection delivered and hands out
//! complete frames only. It reads the header first, bounds the declared
//! payload size, and then waits for exactly that many payload bytes.
//!
//! Integrity checking is left to [`Event::from_frame`](crate::Event::from_frame):
//! the assembler only cares about lengths.

use crate::event::{EventHeader, HEADER_SIZE, MAX_PAYLOAD_SIZE};

/// Errors that leave a stream impossible to resynchronise
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameError {
    /// The header declares a payload larger than any legal event.
    #[error("declared payload size {declared} exceeds maximum {max}")]
    Oversized { declared: usize, max: usize },
}

/// Per-connection buffer turning a byte stream into complete frames
#[derive(Debug, Default)]
pub struct FrameAssembler {
    buffer: Vec<u8>,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// Appends bytes received from the stream
    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Bytes buffered but not yet handed out as a frame
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Removes and returns the next complete frame, header included
    ///
    /// Returns `Ok(None)` while the header or payload is still incomplete. An
    /// oversized declaration is an error; the caller should drop the
    /// connection since no later byte can be trusted as a frame boundary.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        if self.buffer.len() < HEADER_SIZE {
            return Ok(None);
        }

        let declared = match EventHeader::decode(&self.buffer) {
            Ok(header) => header.payload_len(),
            Err(_) => return Ok(None),
        };

        if declared > MAX_PAYLOAD_SIZE {
            return Err(FrameError::Oversized {
                declared,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        let frame_len = HEADER_SIZE + declared;
        if self.buffer.len() < frame_len {
            return Ok(None);
        }

        Ok(Some(self.buffer.drain(..frame_len).collect()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Event, EventType};

    fn sealed_frame(kind: EventType, payload: &[u8]) -> Vec<u8> {
        let mut event = Event::with_payload(kind, payload).unwrap();
        event.seal_frame().unwrap()
    }

    #[test]
    fn test_empty_assembler_has_no_frame() {
        let mut assembler = FrameAssembler::new();
        assert_eq!(assembler.next_frame(), Ok(None));
    }

    #[test]
    fn test_single_complete_frame() {
        let frame = sealed_frame(EventType::PlayerJoin, b"abc");
        let mut assembler = FrameAssembler::new();
        assembler.push(&frame);

        assert_eq!(assembler.next_frame(), Ok(Some(frame)));
        assert_eq!(assembler.buffered(), 0);
    }

    #[test]
    fn test_split_header_waits() {
        let frame = sealed_frame(EventType::PlayerReady, b"payload");
        let mut assembler = FrameAssembler::new();

        assembler.push(&frame[..5]);
        assert_eq!(assembler.next_frame(), Ok(None));

        assembler.push(&frame[5..]);
        assert_eq!(assembler.next_frame(), Ok(Some(frame)));
    }

    #[test]
    fn test_split_payload_waits() {
        let frame = sealed_frame(EventType::PlayerReady, &[3u8; 200]);
        let mut assembler = FrameAssembler::new();

        assembler.push(&frame[..HEADER_SIZE + 50]);
        assert_eq!(assembler.next_frame(), Ok(None));
        assert_eq!(assembler.buffered(), HEADER_SIZE + 50);

        assembler.push(&frame[HEADER_SIZE + 50..]);
        assert_eq!(assembler.next_frame(), Ok(Some(frame)));
    }

    #[test]
    fn test_byte_at_a_time() {
        let frame = sealed_frame(EventType::PlayerJoin, b"trickle");
        let mut assembler = FrameAssembler::new();

        for (index, byte) in frame.iter().enumerate() {
            assembler.push(&[*byte]);
            let result = assembler.next_frame().unwrap();
            if index + 1 < frame.len() {
                assert!(result.is_none());
            } else {
                assert_eq!(result, Some(frame.clone()));
            }
        }
    }

    #[test]
    fn test_coalesced_frames_split_apart() {
        let first = sealed_frame(EventType::Tick, &[]);
        let second = sealed_frame(EventType::PlayerJoin, b"second");
        let third = sealed_frame(EventType::PlayerLeave, b"3");

        let mut stream = Vec::new();
        stream.extend_from_slice(&first);
        stream.extend_from_slice(&second);
        stream.extend_from_slice(&third[..4]);

        let mut assembler = FrameAssembler::new();
        assembler.push(&stream);

        assert_eq!(assembler.next_frame(), Ok(Some(first)));
        assert_eq!(assembler.next_frame(), Ok(Some(second)));
        assert_eq!(assembler.next_frame(), Ok(None));

        assembler.push(&third[4..]);
        assert_eq!(assembler.next_frame(), Ok(Some(third)));
    }

    #[test]
    fn test_truncated_frame_never_surfaces() {
        // Declares a full payload but delivers only ten bytes of it
        let header = EventHeader {
            kind: EventType::PlayerJoin.raw(),
            size: MAX_PAYLOAD_SIZE as u32,
            checksum: 0,
        };
        let mut assembler = FrameAssembler::new();
        assembler.push(&header.encode());
        assembler.push(&[0u8; 10]);

        assert_eq!(assembler.next_frame(), Ok(None));
    }

    #[test]
    fn test_oversized_declaration_is_an_error() {
        let header = EventHeader {
            kind: 0,
            size: 5000,
            checksum: 0,
        };
        let mut assembler = FrameAssembler::new();
        assembler.push(&header.encode());

        assert_eq!(
            assembler.next_frame(),
            Err(FrameError::Oversized {
                declared: 5000,
                max: MAX_PAYLOAD_SIZE
            })
        );
    }

    #[test]
    fn test_clear_discards_partial_frame() {
        let frame = sealed_frame(EventType::PlayerJoin, b"partial");
        let mut assembler = FrameAssembler::new();
        assembler.push(&frame[..8]);
        assembler.clear();
        assert_eq!(assembler.buffered(), 0);
    }
}
