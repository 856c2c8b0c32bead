//! Relay control surface
//!
//! A [`Relay`] is inert until [`Relay::activate`] binds a port and starts the
//! worker thread. From then on every interaction goes through shared atomics:
//! the worker alone owns the client roster and the sockets it accepted.

use crate::network::{RelayControl, RelayWorker};
use log::{error, info, warn};
use shared::{tick_interval, Handle, SocketRegistry, DEFAULT_TICK_RATE};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Tunables fixed at construction
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Tick events per second
    pub tick_rate: u32,
    /// Connections beyond this are closed as soon as they are accepted
    pub max_clients: usize,
    /// Whether a client's own frames are sent back to it
    pub echo_to_sender: bool,
    /// How long the worker sleeps after a pass with nothing to do
    pub idle_sleep: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            tick_rate: DEFAULT_TICK_RATE,
            max_clients: 64,
            echo_to_sender: false,
            idle_sleep: Duration::from_millis(1),
        }
    }
}

/// Lifecycle of a relay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Inactive,
    /// Bound and relaying for existing clients, but not admitting new ones
    Listening,
    Accepting,
}

/// In-process relay: one listener, one worker thread, many clients
///
/// Dropping a `Relay` deactivates it.
pub struct Relay {
    registry: Arc<SocketRegistry>,
    config: RelayConfig,
    control: Arc<RelayControl>,
    listener: Option<Handle>,
    port: Option<u16>,
    worker: Option<JoinHandle<()>>,
}

impl Relay {
    /// Creates an inactive relay with default settings on the process-wide
    /// socket registry
    pub fn new() -> Self {
        Self::with_config(RelayConfig::default())
    }

    /// Creates an inactive relay on the process-wide socket registry
    pub fn with_config(config: RelayConfig) -> Self {
        Self::with_registry(SocketRegistry::global(), config)
    }

    /// Builds a relay whose sockets live in `registry` instead of the
    /// process-wide one
    ///
    /// A tick rate outside 1..=1000 Hz is replaced by the default with a
    /// warning.
    pub fn with_registry(registry: Arc<SocketRegistry>, mut config: RelayConfig) -> Self {
        let interval = match tick_interval(config.tick_rate) {
            Some(interval) => interval,
            None => {
                warn!(
                    "Tick rate {} out of range, using {}",
                    config.tick_rate, DEFAULT_TICK_RATE
                );
                config.tick_rate = DEFAULT_TICK_RATE;
                Duration::from_millis(u64::from(1000 / DEFAULT_TICK_RATE))
            }
        };

        Self {
            registry,
            config,
            control: Arc::new(RelayControl::new(interval)),
            listener: None,
            port: None,
            worker: None,
        }
    }

    /// Binds `port` (0 picks a free one) and starts relaying
    ///
    /// Returns false if the relay is already active or the port cannot be
    /// bound, in which case the relay stays inactive.
    pub fn activate(&mut self, port: u16) -> bool {
        if self.worker.is_some() {
            warn!("Relay already active on port {:?}", self.port);
            return false;
        }

        let Some(listener) = self.registry.listen(port) else {
            error!("Relay failed to listen on port {}", port);
            return false;
        };
        let bound = self.registry.local_port(listener);

        self.control.running.store(true, Ordering::Release);
        self.control.accepting.store(true, Ordering::Release);
        self.control.client_count.store(0, Ordering::Release);
        self.control.ticks_sent.store(0, Ordering::Release);

        let worker = RelayWorker::new(
            Arc::clone(&self.registry),
            listener,
            Arc::clone(&self.control),
            &self.config,
            Instant::now(),
        );

        match thread::Builder::new()
            .name("relay-worker".to_string())
            .spawn(move || worker.run())
        {
            Ok(handle) => {
                info!(
                    "Relay listening on port {} at {} Hz",
                    bound.unwrap_or(port),
                    self.config.tick_rate
                );
                self.worker = Some(handle);
                self.listener = Some(listener);
                self.port = bound;
                true
            }
            Err(e) => {
                error!("Failed to start relay worker: {}", e);
                self.control.running.store(false, Ordering::Release);
                self.control.accepting.store(false, Ordering::Release);
                self.registry.close(listener);
                false
            }
        }
    }

    /// Changes the tick frequency, effective from the next tick decision
    ///
    /// Returns false for 0 Hz or rates above 1000 Hz.
    pub fn set_tick_rate(&mut self, hz: u32) -> bool {
        let Some(interval) = tick_interval(hz) else {
            warn!("Rejected tick rate {} Hz", hz);
            return false;
        };

        self.config.tick_rate = hz;
        self.control.set_tick_interval(interval);
        info!("Tick rate set to {} Hz", hz);
        true
    }

    /// Stops the worker and closes every socket it owned
    ///
    /// Blocks until the worker has finished its current pass. Returns false
    /// if the relay was not active.
    pub fn deactivate(&mut self) -> bool {
        let Some(worker) = self.worker.take() else {
            return false;
        };

        self.control.running.store(false, Ordering::Release);
        self.control.accepting.store(false, Ordering::Release);

        if worker.join().is_err() {
            error!("Relay worker panicked");
            if let Some(listener) = self.listener {
                self.registry.close(listener);
            }
        }

        self.listener = None;
        self.port = None;
        self.control.client_count.store(0, Ordering::Release);
        info!("Relay deactivated");
        true
    }

    /// Opens or closes the door to new connections without affecting
    /// clients already connected
    pub fn set_accepting(&self, accepting: bool) {
        self.control.accepting.store(accepting, Ordering::Release);
    }

    /// Current lifecycle state
    ///
    /// `Listening` and `Accepting` both mean the worker is running; they
    /// differ only in whether new connections are admitted.
    pub fn state(&self) -> RelayState {
        if self.worker.is_none() {
            RelayState::Inactive
        } else if self.control.accepting.load(Ordering::Acquire) {
            RelayState::Accepting
        } else {
            RelayState::Listening
        }
    }

    /// True between a successful `activate` and the matching `deactivate`
    pub fn is_active(&self) -> bool {
        self.worker.is_some()
    }

    /// Port actually bound, which differs from the requested one for port 0
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// Tick frequency in Hz, as last configured
    pub fn tick_rate(&self) -> u32 {
        self.config.tick_rate
    }

    /// Clients on the roster at the end of the worker's latest pass
    ///
    /// Always 0 while inactive.
    pub fn client_count(&self) -> usize {
        self.control.client_count.load(Ordering::Acquire)
    }

    /// Ticks emitted since the last activation
    pub fn ticks_sent(&self) -> u64 {
        self.control.ticks_sent.load(Ordering::Acquire)
    }
}

impl Default for Relay {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Relay {
    fn drop(&mut self) {
        self.deactivate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn isolated() -> (Arc<SocketRegistry>, Relay) {
        let registry = Arc::new(SocketRegistry::new());
        let relay = Relay::with_registry(Arc::clone(&registry), RelayConfig::default());
        (registry, relay)
    }

    fn wait_for(mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        done()
    }

    #[test]
    fn test_default_config() {
        let config = RelayConfig::default();
        assert_eq!(config.tick_rate, 20);
        assert_eq!(config.max_clients, 64);
        assert!(!config.echo_to_sender);
        assert_eq!(config.idle_sleep, Duration::from_millis(1));
    }

    #[test]
    fn test_lifecycle_states() {
        let (_registry, mut relay) = isolated();
        assert_eq!(relay.state(), RelayState::Inactive);
        assert_eq!(relay.port(), None);

        assert!(relay.activate(0));
        assert_eq!(relay.state(), RelayState::Accepting);
        assert!(relay.port().unwrap() > 0);

        relay.set_accepting(false);
        assert_eq!(relay.state(), RelayState::Listening);

        assert!(relay.deactivate());
        assert_eq!(relay.state(), RelayState::Inactive);
        assert!(!relay.deactivate(), "second deactivate is a no-op");
    }

    #[test]
    fn test_activate_twice_fails() {
        let (_registry, mut relay) = isolated();
        assert!(relay.activate(0));
        assert!(!relay.activate(0));
        assert!(relay.is_active());
    }

    #[test]
    fn test_activate_on_taken_port_fails() {
        let registry = Arc::new(SocketRegistry::new());
        let blocker = std::net::TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0)).unwrap();
        let taken = blocker.local_addr().unwrap().port();

        let mut relay = Relay::with_registry(Arc::clone(&registry), RelayConfig::default());
        assert!(!relay.activate(taken));
        assert_eq!(relay.state(), RelayState::Inactive);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_set_tick_rate_bounds() {
        let (_registry, mut relay) = isolated();
        assert!(!relay.set_tick_rate(0));
        assert!(!relay.set_tick_rate(1001));
        assert_eq!(relay.tick_rate(), 20);

        assert!(relay.set_tick_rate(1000));
        assert!(relay.set_tick_rate(60));
        assert_eq!(relay.tick_rate(), 60);
    }

    #[test]
    fn test_invalid_configured_rate_falls_back() {
        let registry = Arc::new(SocketRegistry::new());
        let relay = Relay::with_registry(
            registry,
            RelayConfig {
                tick_rate: 0,
                ..RelayConfig::default()
            },
        );
        assert_eq!(relay.tick_rate(), DEFAULT_TICK_RATE);
    }

    #[test]
    fn test_ticks_flow_while_active() {
        let (_registry, mut relay) = isolated();
        assert!(relay.set_tick_rate(100));
        assert!(relay.activate(0));

        assert!(wait_for(|| relay.ticks_sent() >= 3));
    }

    #[test]
    fn test_accepts_and_counts_clients() {
        let (registry, mut relay) = isolated();
        assert!(relay.activate(0));
        let port = relay.port().unwrap();

        let a = registry.open(Ipv4Addr::LOCALHOST, port).unwrap();
        let _b = registry.open(Ipv4Addr::LOCALHOST, port).unwrap();
        assert!(wait_for(|| relay.client_count() == 2));

        registry.close(a);
        assert!(wait_for(|| relay.client_count() == 1));
    }

    #[test]
    fn test_gated_relay_does_not_admit() {
        let (registry, mut relay) = isolated();
        assert!(relay.activate(0));
        relay.set_accepting(false);
        let port = relay.port().unwrap();

        registry.open(Ipv4Addr::LOCALHOST, port).unwrap();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(relay.client_count(), 0);

        relay.set_accepting(true);
        assert!(wait_for(|| relay.client_count() == 1));
    }

    #[test]
    fn test_deactivate_closes_relay_sockets() {
        let (registry, mut relay) = isolated();
        assert!(relay.activate(0));
        let port = relay.port().unwrap();
        let client = registry.open(Ipv4Addr::LOCALHOST, port).unwrap();
        assert!(wait_for(|| relay.client_count() == 1));

        assert!(relay.deactivate());

        // Only the client's own handle remains in the registry
        assert_eq!(registry.len(), 1);
        assert!(registry.active(client));
        assert_eq!(relay.client_count(), 0);
    }

    #[test]
    fn test_reactivate_after_deactivate() {
        let (_registry, mut relay) = isolated();
        assert!(relay.activate(0));
        assert!(relay.deactivate());
        assert!(relay.activate(0));
        assert_eq!(relay.state(), RelayState::Accepting);
    }
}
