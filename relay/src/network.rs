//! Relay worker loop: accept, poll, fan out, tick
//!
//! The worker owns the listening handle and the client roster and is the only
//! thread that mutates either. Each pass of the loop:
//! 1. accepts every pending connection (while accepting is enabled)
//! 2. drains readable bytes from every client, re-assembles frames, verifies
//!    them and fans them out to the other clients
//! 3. emits any tick events that have come due
//! 4. flushes partial writes and drops clients that left or failed
//!
//! All socket calls are non-blocking, so one idle or slow client never holds
//! up the others.

use crate::client_manager::ClientManager;
use crate::relay::RelayConfig;
use log::{debug, info, warn};
use shared::{Event, EventType, FrameError, Handle, RecvStatus, SocketRegistry, MAX_EVENT_SIZE};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Reads per client per pass, so one chatty client cannot starve the rest
const MAX_READS_PER_POLL: usize = 8;

/// State shared between the worker thread and the controlling `Relay`
pub(crate) struct RelayControl {
    pub running: AtomicBool,
    pub accepting: AtomicBool,
    tick_interval_ms: AtomicU64,
    pub client_count: AtomicUsize,
    pub ticks_sent: AtomicU64,
}

impl RelayControl {
    pub fn new(tick_interval: Duration) -> Self {
        Self {
            running: AtomicBool::new(false),
            accepting: AtomicBool::new(false),
            tick_interval_ms: AtomicU64::new(tick_interval.as_millis() as u64),
            client_count: AtomicUsize::new(0),
            ticks_sent: AtomicU64::new(0),
        }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.load(Ordering::Acquire))
    }

    pub fn set_tick_interval(&self, interval: Duration) {
        self.tick_interval_ms
            .store(interval.as_millis() as u64, Ordering::Release);
    }
}

/// Why a client is leaving the roster
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Departure {
    /// Sent an explicit player_leave, which was already forwarded
    Left,
    /// Connection closed, failed or desynchronised
    Lost,
}

pub(crate) struct RelayWorker {
    registry: Arc<SocketRegistry>,
    listener: Handle,
    clients: ClientManager,
    control: Arc<RelayControl>,
    echo_to_sender: bool,
    idle_sleep: Duration,
    /// Boundary of the most recent tick; advances by whole intervals
    last_tick: Instant,
    tick_frame: Vec<u8>,
    scratch: [u8; MAX_EVENT_SIZE],
    departures: Vec<(u32, Departure)>,
}

impl RelayWorker {
    pub fn new(
        registry: Arc<SocketRegistry>,
        listener: Handle,
        control: Arc<RelayControl>,
        config: &RelayConfig,
        started: Instant,
    ) -> Self {
        let mut tick = Event::with_type(EventType::Tick);
        tick.seal();

        Self {
            registry,
            listener,
            clients: ClientManager::new(config.max_clients),
            control,
            echo_to_sender: config.echo_to_sender,
            idle_sleep: config.idle_sleep,
            last_tick: started,
            tick_frame: tick.to_bytes(),
            scratch: [0u8; MAX_EVENT_SIZE],
            departures: Vec::new(),
        }
    }

    /// Runs until the control flag is cleared, then releases every socket
    pub fn run(mut self) {
        info!("Relay worker started");

        while self.control.running.load(Ordering::Acquire) {
            if self.step(Instant::now()) {
                thread::yield_now();
            } else {
                thread::sleep(self.idle_sleep);
            }
        }

        self.shutdown();
    }

    /// One pass of the loop. Returns true if anything happened.
    pub fn step(&mut self, now: Instant) -> bool {
        let mut busy = false;

        if self.control.accepting.load(Ordering::Acquire) {
            busy |= self.accept_clients() > 0;
        }
        busy |= self.poll_clients() > 0;
        busy |= self.emit_ticks(now) > 0;

        self.flush_clients();
        self.reap_departures();

        self.control
            .client_count
            .store(self.clients.len(), Ordering::Release);
        busy
    }

    fn accept_clients(&mut self) -> usize {
        let mut accepted = 0;

        while self.registry.select(&[self.listener]) > 0 {
            let Some(socket) = self.registry.accept(self.listener) else {
                break;
            };

            match self.clients.add_client(socket) {
                Some(uuid) => {
                    accepted += 1;
                    if let Some(addr) = self.registry.peer_addr(socket) {
                        debug!("Client {} is {}", uuid, addr);
                    }
                }
                None => {
                    warn!("Relay full, refusing connection on {}", socket);
                    self.registry.close(socket);
                }
            }
        }

        accepted
    }

    /// Reads from every client and relays complete frames. Returns the number
    /// of reads that delivered data.
    fn poll_clients(&mut self) -> usize {
        let registry = &self.registry;
        let scratch = &mut self.scratch;
        let departures = &mut self.departures;
        let mut reads = 0;
        let mut inbound: Vec<(u32, Vec<u8>)> = Vec::new();

        for client in self.clients.iter_mut() {
            for _ in 0..MAX_READS_PER_POLL {
                match registry.recv(client.socket, &mut scratch[..]) {
                    RecvStatus::Received(count) => {
                        reads += 1;
                        client.assembler.push(&scratch[..count]);
                    }
                    RecvStatus::Pending => break,
                    RecvStatus::Closed | RecvStatus::Failed => {
                        departures.push((client.uuid, Departure::Lost));
                        break;
                    }
                }
            }

            loop {
                match client.assembler.next_frame() {
                    Ok(Some(frame)) => {
                        client.frames_relayed += 1;
                        inbound.push((client.uuid, frame));
                    }
                    Ok(None) => break,
                    Err(FrameError::Oversized { declared, .. }) => {
                        warn!(
                            "Client {} declared a {}-byte payload, dropping connection",
                            client.uuid, declared
                        );
                        client.assembler.clear();
                        departures.push((client.uuid, Departure::Lost));
                        break;
                    }
                }
            }
        }

        for (origin, frame) in inbound {
            self.relay_frame(origin, &frame);
        }

        reads
    }

    fn relay_frame(&mut self, origin: u32, frame: &[u8]) {
        if self
            .departures
            .iter()
            .any(|(uuid, departure)| *uuid == origin && *departure == Departure::Left)
        {
            debug!("Ignoring frame sent by client {} after it left", origin);
            return;
        }

        let event = match Event::from_frame(frame) {
            Ok(event) => event,
            Err(e) => {
                warn!("Dropping frame from client {}: {}", origin, e);
                return;
            }
        };

        match event.event_type() {
            Some(EventType::UuidRequest) => self.answer_uuid_request(origin),
            Some(EventType::PlayerLeave) => {
                self.broadcast(frame, Some(origin));
                self.departures.push((origin, Departure::Left));
            }
            _ => {
                self.broadcast(frame, Some(origin));
            }
        }
    }

    fn answer_uuid_request(&mut self, origin: u32) {
        let Some(socket) = self.clients.get(origin).map(|client| client.socket) else {
            return;
        };

        let frame = match Event::encode_payload(EventType::UuidRequest, &origin)
            .and_then(|mut reply| reply.seal_frame())
        {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Failed to build uuid reply for client {}: {}", origin, e);
                return;
            }
        };

        if let Err(e) = self.registry.send(socket, &frame) {
            warn!("Uuid reply to client {} failed: {}", origin, e);
            self.departures.push((origin, Departure::Lost));
        }
    }

    /// Sends `frame` to every live client, skipping `origin` unless echoing is
    /// enabled. Returns how many clients it was queued for.
    fn broadcast(&mut self, frame: &[u8], origin: Option<u32>) -> usize {
        let mut delivered = 0;

        for client in self.clients.iter() {
            if !self.echo_to_sender && origin == Some(client.uuid) {
                continue;
            }
            if self
                .departures
                .iter()
                .any(|(uuid, departure)| *uuid == client.uuid && *departure == Departure::Lost)
            {
                continue;
            }

            match self.registry.send(client.socket, frame) {
                Ok(_) => delivered += 1,
                Err(e) => {
                    warn!("Broadcast to client {} failed: {}", client.uuid, e);
                    self.departures.push((client.uuid, Departure::Lost));
                }
            }
        }

        delivered
    }

    /// Emits every tick that has come due by `now`
    ///
    /// The boundary advances by whole intervals rather than snapping to `now`,
    /// so a delayed pass fires the missed ticks back to back.
    fn emit_ticks(&mut self, now: Instant) -> u64 {
        let interval = self.control.tick_interval();
        let frame = self.tick_frame.clone();
        let mut emitted = 0;

        while now.saturating_duration_since(self.last_tick) >= interval {
            self.last_tick += interval;
            self.broadcast(&frame, None);
            emitted += 1;
        }

        if emitted > 0 {
            self.control.ticks_sent.fetch_add(emitted, Ordering::AcqRel);
        }
        emitted
    }

    fn flush_clients(&mut self) {
        for client in self.clients.iter() {
            if let Err(e) = self.registry.flush(client.socket) {
                debug!("Flush to client {} failed: {}", client.uuid, e);
                self.departures.push((client.uuid, Departure::Lost));
            }
        }
    }

    /// Removes departed clients and closes their sockets. Clients that vanished
    /// without a player_leave get one announced on their behalf.
    fn reap_departures(&mut self) {
        if self.departures.is_empty() {
            return;
        }

        let departures = std::mem::take(&mut self.departures);
        let mut lost = Vec::new();

        for (uuid, _) in &departures {
            let Some(client) = self.clients.remove_client(*uuid) else {
                continue;
            };
            self.registry.close(client.socket);

            let left = departures
                .iter()
                .any(|(other, departure)| other == uuid && *departure == Departure::Left);
            if !left {
                lost.push(*uuid);
            }
        }

        for uuid in lost {
            match Event::encode_payload(EventType::PlayerLeave, &uuid)
                .and_then(|mut leave| leave.seal_frame())
            {
                Ok(frame) => {
                    self.broadcast(&frame, None);
                }
                Err(e) => warn!("Failed to announce departure of client {}: {}", uuid, e),
            }
        }
    }

    fn shutdown(&mut self) {
        for client in self.clients.drain() {
            self.registry.close(client.socket);
        }
        self.registry.close(self.listener);
        self.control.client_count.store(0, Ordering::Release);
        info!("Relay worker stopped");
    }
}
