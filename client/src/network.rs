use crate::interpolation::TickTracker;
use log::{debug, info, warn};
use shared::{
    Event, EventType, FrameAssembler, Handle, RecvStatus, SocketRegistry, MAX_EVENT_SIZE,
};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// State that only exists while connected
struct Connection {
    socket: Handle,
    assembler: FrameAssembler,
    ticks: TickTracker,
    uuid: Option<u32>,
}

impl Connection {
    fn new(socket: Handle, now: Instant) -> Self {
        Self {
            socket,
            assembler: FrameAssembler::new(),
            ticks: TickTracker::new(now),
            uuid: None,
        }
    }

    /// Updates connection state from an event on its way to the caller
    fn observe(&mut self, event: &Event, now: Instant) {
        match event.event_type() {
            Some(EventType::Tick) => self.ticks.on_tick(now),
            Some(EventType::UuidRequest) => match event.decode_payload::<u32>() {
                Ok(uuid) => {
                    info!("Relay assigned uuid {}", uuid);
                    self.uuid = Some(uuid);
                }
                Err(e) => debug!("Uuid event without a uuid: {}", e),
            },
            _ => {}
        }
    }
}

/// Connection to a relay, driven synchronously from the caller's own loop
///
/// Nothing here blocks except [`Client::connect`]. Call [`Client::recv`] until
/// it returns `None` once per frame, then use [`Client::tween`] to place
/// rendering between the last two ticks.
pub struct Client {
    registry: Arc<SocketRegistry>,
    connection: Option<Connection>,
    scratch: [u8; MAX_EVENT_SIZE],
}

impl Client {
    pub fn new() -> Self {
        Self::with_registry(SocketRegistry::global())
    }

    pub fn with_registry(registry: Arc<SocketRegistry>) -> Self {
        Self {
            registry,
            connection: None,
            scratch: [0u8; MAX_EVENT_SIZE],
        }
    }

    /// Connects to a relay at `ip:port`
    ///
    /// Fails if a live connection already exists. A previous connection the
    /// relay has since dropped is discarded first.
    pub fn connect(&mut self, ip: Ipv4Addr, port: u16) -> bool {
        if self.connected() {
            warn!("Already connected");
            return false;
        }
        if let Some(stale) = self.connection.take() {
            debug!("Discarding stale connection {}", stale.socket);
            self.registry.close(stale.socket);
        }

        let Some(socket) = self.registry.open(ip, port) else {
            warn!("Failed to connect to relay at {}:{}", ip, port);
            return false;
        };

        info!("Connected to relay at {}:{}", ip, port);
        self.connection = Some(Connection::new(socket, Instant::now()));
        true
    }

    /// Drops the connection. Returns false if there was none.
    pub fn disconnect(&mut self) -> bool {
        let Some(connection) = self.connection.take() else {
            return false;
        };

        self.registry.close(connection.socket);
        info!("Disconnected from relay");
        true
    }

    pub fn connected(&self) -> bool {
        self.connection
            .as_ref()
            .map_or(false, |connection| self.registry.active(connection.socket))
    }

    /// Seals `event` and sends it to the relay
    pub fn send(&mut self, event: &mut Event) -> bool {
        let Some(connection) = self.connection.as_ref() else {
            return false;
        };

        let frame = match event.seal_frame() {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Refusing to send event: {}", e);
                return false;
            }
        };

        match self.registry.send(connection.socket, &frame) {
            Ok(_) => true,
            Err(e) => {
                warn!("Send to relay failed: {}", e);
                false
            }
        }
    }

    /// Pushes out bytes still queued behind a partial write
    ///
    /// [`recv`](Self::recv) does this on every call, so a caller polling once
    /// per frame never leaves half an event stuck in the backlog. Returns
    /// false if there is no connection or it failed while flushing.
    pub fn flush(&mut self) -> bool {
        let Some(connection) = self.connection.as_ref() else {
            return false;
        };

        match self.registry.flush(connection.socket) {
            Ok(_) => true,
            Err(e) => {
                warn!("Flush to relay failed: {}", e);
                false
            }
        }
    }

    /// Asks the relay for this client's uuid; the answer arrives through
    /// [`recv`](Self::recv)
    pub fn request_uuid(&mut self) -> bool {
        self.send(&mut Event::with_type(EventType::UuidRequest))
    }

    /// Returns the next verified event, if one is complete
    ///
    /// Flushes pending outbound bytes first. Partial frames stay buffered
    /// until the rest arrives. A frame that fails verification is discarded
    /// and reported as no event. Ticks update the interpolation state before
    /// they are returned.
    pub fn recv(&mut self) -> Option<Event> {
        let connection = self.connection.as_mut()?;
        if self.registry.active(connection.socket) {
            if let Err(e) = self.registry.flush(connection.socket) {
                warn!("Flush to relay failed: {}", e);
            }
        } else if connection.assembler.buffered() == 0 {
            return None;
        }

        loop {
            match connection.assembler.next_frame() {
                Ok(Some(frame)) => {
                    return match Event::from_frame(&frame) {
                        Ok(event) => {
                            connection.observe(&event, Instant::now());
                            Some(event)
                        }
                        Err(e) => {
                            warn!("Discarding frame from relay: {}", e);
                            None
                        }
                    };
                }
                Ok(None) => {}
                Err(e) => {
                    warn!("Relay stream unreadable, disconnecting: {}", e);
                    connection.assembler.clear();
                    self.registry.close(connection.socket);
                    return None;
                }
            }

            match self.registry.recv(connection.socket, &mut self.scratch) {
                RecvStatus::Received(count) => connection.assembler.push(&self.scratch[..count]),
                RecvStatus::Pending => return None,
                RecvStatus::Closed | RecvStatus::Failed => {
                    if connection.assembler.buffered() > 0 {
                        debug!(
                            "Relay went away with {} bytes of a partial frame",
                            connection.assembler.buffered()
                        );
                        connection.assembler.clear();
                    }
                    info!("Relay connection lost");
                    return None;
                }
            }
        }
    }

    /// Interpolation fraction between the last tick and the next expected one
    ///
    /// 0.0 while disconnected.
    pub fn tween(&self) -> f32 {
        self.connection
            .as_ref()
            .map_or(0.0, |connection| connection.ticks.tween(Instant::now()))
    }

    /// Uuid the relay assigned, once a `uuid_request` has been answered
    pub fn uuid(&self) -> Option<u32> {
        self.connection.as_ref().and_then(|connection| connection.uuid)
    }

    pub fn last_tick_interval(&self) -> Option<Duration> {
        self.connection
            .as_ref()
            .map(|connection| connection.ticks.last_interval())
    }

    pub fn ticks_received(&self) -> u64 {
        self.connection
            .as_ref()
            .map_or(0, |connection| connection.ticks.ticks_observed())
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.disconnect();
    }
}
