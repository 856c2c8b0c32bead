//! # Tick Relay Library
//!
//! A relay accepts TCP connections from clients, rebroadcasts every verified
//! event one client sends to all the others, and emits tick events at a fixed
//! rate so that clients can pace their simulation and interpolate rendering
//! between ticks.
//!
//! ## Core Responsibilities
//!
//! ### Connection Lifecycle
//! New connections are accepted while the relay is in the accepting state and
//! receive a uuid that is never reused. Clients that leave explicitly, close
//! their socket, fail a write, or desynchronise their stream are removed, and
//! the remaining clients are told with a `player_leave` event.
//!
//! ### Fan-out
//! Frames are re-assembled per connection and checked against their payload
//! checksum before they are forwarded. Corrupt frames are dropped. Broadcast
//! order follows arrival order as seen by the worker, visiting clients in
//! accept order.
//!
//! ### Ticks
//! Tick boundaries advance by whole intervals, so a delayed worker pass emits
//! the ticks it missed instead of drifting.
//!
//! ## Architecture Design
//!
//! The relay runs on one dedicated worker thread per instance. That thread is
//! the only one touching the client roster and the sockets it accepted. The
//! owning [`Relay`] talks to it through atomics only: running and accepting
//! flags, the tick interval, and counters for introspection.
//!
//! ## Module Organization
//!
//! ### Client Manager Module (`client_manager`)
//! Roster of connected clients, uuid assignment and capacity limits.
//!
//! ### Network Module (`network`)
//! The worker loop: accept, poll, verify, broadcast, tick, flush, reap.
//!
//! ### Relay Module (`relay`)
//! The control surface: activate, deactivate, tick rate, accept gating.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use relay::{Relay, RelayConfig};
//!
//! let mut relay = Relay::with_config(RelayConfig {
//!     tick_rate: 30,
//!     ..RelayConfig::default()
//! });
//!
//! if relay.activate(12345) {
//!     // Relay is now accepting and ticking on its own thread
//!     relay.set_accepting(false);
//!     relay.deactivate();
//! }
//! ```

pub mod client_manager;
mod network;
pub mod relay;

pub use relay::{Relay, RelayConfig, RelayState};
