//! # Shared Protocol Library
//!
//! Everything the relay and its clients must agree on lives here: the event
//! wire format, the payload checksum, stream re-assembly, and the
//! handle-based socket layer both sides run their I/O through.
//!
//! ## Module Organization
//!
//! ### Checksum (`checksum`)
//! Adler-32 digest over event payloads. Detects corruption and truncation;
//! it is not a security mechanism.
//!
//! ### Event (`event`)
//! The framed message: a 12-byte big-endian header (type, size, checksum)
//! followed by at most 1012 payload bytes held in a fixed inline buffer.
//!
//! ### Framing (`framing`)
//! Per-connection buffer that turns an arbitrary split or coalesced byte
//! stream back into complete frames.
//!
//! ### Socket (`socket`)
//! Registry of live connections addressed by opaque handles, with
//! non-blocking open/listen/accept/send/recv/select/close.

pub mod checksum;
pub mod event;
pub mod framing;
pub mod socket;

pub use checksum::checksum;
pub use event::{
    Event, EventError, EventHeader, EventType, HEADER_SIZE, INVALID_EVENT_TYPE, MAX_EVENT_SIZE,
    MAX_PAYLOAD_SIZE,
};
pub use framing::{FrameAssembler, FrameError};
pub use socket::{Handle, RecvStatus, SocketError, SocketRegistry};

use std::time::Duration;

/// Port the relay binary listens on unless told otherwise
pub const DEFAULT_RELAY_PORT: u16 = 12345;
/// Tick frequency assumed until the relay is configured or observed
pub const DEFAULT_TICK_RATE: u32 = 20;
/// Fastest tick rate whose interval is still a whole millisecond
pub const MAX_TICK_RATE: u32 = 1000;

/// Converts a tick frequency to the interval between ticks
///
/// Intervals are whole milliseconds (`1000 / hz`). Returns `None` for zero
/// or for rates above [`MAX_TICK_RATE`].
pub fn tick_interval(hz: u32) -> Option<Duration> {
    if hz == 0 || hz > MAX_TICK_RATE {
        return None;
    }
    Some(Duration::from_millis(u64::from(1000 / hz)))
}
