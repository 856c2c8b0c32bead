//! # Relay Client Library
//!
//! Connects to a tick relay, exchanges framed events with the other clients
//! through it, and tracks the relay's ticks so a renderer can interpolate
//! between them.
//!
//! ## Module Organization
//!
//! ### Network Module (`network`)
//! The [`Client`]: connect and disconnect, non-blocking send and receive of
//! sealed events, uuid requests. Incoming bytes are re-assembled into frames
//! and checked before they are handed to the caller.
//!
//! ### Interpolation Module (`interpolation`)
//! [`TickTracker`] keeps the time of the last tick and the gap before it, and
//! reports the fractional progress toward the next tick.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::Client;
//! use shared::{Event, EventType, DEFAULT_RELAY_PORT};
//! use std::net::Ipv4Addr;
//!
//! let mut client = Client::new();
//! if client.connect(Ipv4Addr::LOCALHOST, DEFAULT_RELAY_PORT) {
//!     client.send(&mut Event::with_type(EventType::PlayerJoin));
//!
//!     // Once per rendered frame
//!     while let Some(event) = client.recv() {
//!         println!("{:?}", event.event_type());
//!     }
//!     let alpha = client.tween().clamp(0.0, 1.0);
//!     println!("{alpha}");
//! }
//! ```

pub mod interpolation;
pub mod network;

pub use interpolation::TickTracker;
pub use network::Client;
