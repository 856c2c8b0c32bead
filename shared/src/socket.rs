//! Handle-based non-blocking socket layer
//!
//! Every live OS connection is owned by a [`SocketRegistry`] and named by a
//! small opaque [`Handle`]. Callers never see a `TcpStream`; they pass
//! handles to `send`, `recv`, `select` and friends, none of which block.
//!
//! A handle is active exactly while it is present in the registry. Closing a
//! handle, or the registry noticing that the peer went away, removes the entry
//! and drops the native socket. Handles come from a monotonic counter, so a
//! stale handle can never alias a newer connection.
//!
//! Writes that the kernel only partially accepts keep their unwritten tail in a
//! per-handle backlog that is flushed ahead of any later write. This keeps the
//! byte stream intact without ever blocking. A peer that lets the backlog grow
//! past [`MAX_OUTBOUND_BACKLOG`] is disconnected.

use log::{debug, warn};
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io::{self, ErrorKind, Read, Write};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpListener, TcpStream};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

/// Upper bound on outbound connection setup
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Pending-connection queue length for listeners
pub const LISTEN_BACKLOG: i32 = 8;
/// Unsent bytes tolerated per handle before the peer is considered too slow
pub const MAX_OUTBOUND_BACKLOG: usize = 64 * 1024;

const SELECT_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Opaque name for one live connection in a [`SocketRegistry`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(u32);

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Outcome of a non-blocking receive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvStatus {
    /// This many bytes were copied into the buffer
    Received(usize),
    /// Nothing to read right now
    Pending,
    /// The peer shut the connection down; the handle has been closed
    Closed,
    /// The read failed or the handle is not an active stream
    Failed,
}

/// Why a send or flush did not go through
///
/// Every variant except `Inactive` and `NotAStream` means the handle has just
/// been closed.
#[derive(Debug, thiserror::Error)]
pub enum SocketError {
    #[error("handle {0} is not active")]
    Inactive(Handle),

    #[error("handle {0} is a listener, not a stream")]
    NotAStream(Handle),

    /// The peer is not reading fast enough
    #[error("outbound backlog on handle {handle} exceeded {limit} bytes")]
    BacklogFull { handle: Handle, limit: usize },

    #[error("I/O error on handle {handle}: {source}")]
    Io {
        handle: Handle,
        #[source]
        source: io::Error,
    },
}

struct StreamEntry {
    stream: TcpStream,
    outbound: Vec<u8>,
}

impl StreamEntry {
    fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            outbound: Vec::new(),
        }
    }

    /// Writes as much of the backlog as the socket accepts right now
    fn flush_backlog(&mut self) -> io::Result<()> {
        while !self.outbound.is_empty() {
            match self.stream.write(&self.outbound) {
                Ok(0) => return Err(ErrorKind::WriteZero.into()),
                Ok(written) => {
                    self.outbound.drain(..written);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Writes `bytes` behind any existing backlog, queueing what does not fit
    fn write_or_queue(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.flush_backlog()?;

        if !self.outbound.is_empty() {
            self.outbound.extend_from_slice(bytes);
            return Ok(());
        }

        let mut written = 0;
        while written < bytes.len() {
            match self.stream.write(&bytes[written..]) {
                Ok(0) => return Err(ErrorKind::WriteZero.into()),
                Ok(count) => written += count,
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        self.outbound.extend_from_slice(&bytes[written..]);
        Ok(())
    }

    /// Readable means data is waiting, or a read would report EOF or an error
    fn is_readable(&self) -> bool {
        let mut peek_buf = [0u8; 1];
        match self.stream.peek(&mut peek_buf) {
            Ok(_) => true,
            Err(e) if e.kind() == ErrorKind::WouldBlock => false,
            Err(e) if e.kind() == ErrorKind::Interrupted => false,
            Err(_) => true,
        }
    }
}

struct ListenerEntry {
    listener: TcpListener,
    // Connections taken off the OS queue by a readiness poll, not yet handed out
    pending: VecDeque<TcpStream>,
}

impl ListenerEntry {
    fn new(listener: TcpListener) -> Self {
        Self {
            listener,
            pending: VecDeque::new(),
        }
    }

    fn poll_pending(&mut self) -> bool {
        if !self.pending.is_empty() {
            return true;
        }

        match self.listener.accept() {
            Ok((stream, addr)) => {
                debug!("Incoming connection from {}", addr);
                self.pending.push_back(stream);
                true
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => false,
            Err(e) => {
                debug!("Accept failed: {}", e);
                false
            }
        }
    }

    fn take_pending(&mut self) -> Option<TcpStream> {
        if self.pending.is_empty() {
            self.poll_pending();
        }
        self.pending.pop_front()
    }
}

enum Entry {
    Listener(ListenerEntry),
    Stream(StreamEntry),
}

impl Entry {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        match self {
            Entry::Listener(listener) => listener.listener.local_addr(),
            Entry::Stream(stream) => stream.stream.local_addr(),
        }
    }
}

/// Owner of every native connection, addressed by [`Handle`]
///
/// All methods take `&self`; the entry map sits behind a mutex so independent
/// relays and clients may share one registry. Tests usually create their own
/// with [`SocketRegistry::new`] rather than using [`SocketRegistry::global`].
pub struct SocketRegistry {
    entries: Mutex<HashMap<Handle, Entry>>,
    next_handle: AtomicU32,
}

impl SocketRegistry {
    /// Creates an empty registry whose first handle will be `#1`
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            next_handle: AtomicU32::new(1),
        }
    }

    /// Process-wide registry shared by default-constructed relays and clients
    pub fn global() -> Arc<SocketRegistry> {
        static GLOBAL: OnceLock<Arc<SocketRegistry>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(SocketRegistry::new())))
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<Handle, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn allocate_handle(&self) -> Handle {
        Handle(self.next_handle.fetch_add(1, Ordering::Relaxed))
    }

    /// Opens an outbound connection to `ip:port`
    ///
    /// Connection setup blocks for at most [`CONNECT_TIMEOUT`]; the resulting
    /// handle is non-blocking. Any failure yields `None`.
    pub fn open(&self, ip: Ipv4Addr, port: u16) -> Option<Handle> {
        let addr = SocketAddr::V4(SocketAddrV4::new(ip, port));

        let stream = match TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT) {
            Ok(stream) => stream,
            Err(e) => {
                debug!("Connect to {} failed: {}", addr, e);
                return None;
            }
        };

        if let Err(e) = configure_stream(&stream) {
            warn!("Failed to configure connection to {}: {}", addr, e);
            return None;
        }

        let handle = self.allocate_handle();
        self.entries()
            .insert(handle, Entry::Stream(StreamEntry::new(stream)));
        debug!("Opened {} to {}", handle, addr);
        Some(handle)
    }

    /// Binds a non-blocking listener on all interfaces. Port 0 picks a free port.
    pub fn listen(&self, port: u16) -> Option<Handle> {
        let listener = match create_listener(port) {
            Ok(listener) => listener,
            Err(e) => {
                debug!("Listen on port {} failed: {}", port, e);
                return None;
            }
        };

        let handle = self.allocate_handle();
        self.entries()
            .insert(handle, Entry::Listener(ListenerEntry::new(listener)));
        debug!("Listening on port {} as {}", port, handle);
        Some(handle)
    }

    /// Accepts one pending connection without blocking
    ///
    /// `None` when nothing is pending or `listener` is not a listening handle.
    pub fn accept(&self, listener: Handle) -> Option<Handle> {
        let mut entries = self.entries();

        let stream = match entries.get_mut(&listener) {
            Some(Entry::Listener(entry)) => entry.take_pending()?,
            _ => return None,
        };

        if let Err(e) = configure_stream(&stream) {
            warn!("Failed to configure accepted connection: {}", e);
            return None;
        }

        let handle = self.allocate_handle();
        entries.insert(handle, Entry::Stream(StreamEntry::new(stream)));
        Some(handle)
    }

    /// Queues `bytes` for the peer without blocking
    ///
    /// Returns the number of bytes accepted, which is always all of them:
    /// whatever the kernel does not take immediately joins the handle's
    /// backlog. Any OS failure or backlog overflow closes the handle.
    pub fn send(&self, handle: Handle, bytes: &[u8]) -> Result<usize, SocketError> {
        let mut entries = self.entries();

        let outcome = match entries.get_mut(&handle) {
            Some(Entry::Stream(entry)) => entry
                .write_or_queue(bytes)
                .map(|()| entry.outbound.len()),
            Some(Entry::Listener(_)) => return Err(SocketError::NotAStream(handle)),
            None => return Err(SocketError::Inactive(handle)),
        };

        match outcome {
            Ok(backlog) if backlog > MAX_OUTBOUND_BACKLOG => {
                entries.remove(&handle);
                warn!("Closing {}: {} bytes of unsent backlog", handle, backlog);
                Err(SocketError::BacklogFull {
                    handle,
                    limit: MAX_OUTBOUND_BACKLOG,
                })
            }
            Ok(_) => Ok(bytes.len()),
            Err(source) => {
                entries.remove(&handle);
                debug!("Send on {} failed: {}", handle, source);
                Err(SocketError::Io { handle, source })
            }
        }
    }

    /// Pushes any backlog out. Returns the bytes still queued.
    pub fn flush(&self, handle: Handle) -> Result<usize, SocketError> {
        let mut entries = self.entries();

        let outcome = match entries.get_mut(&handle) {
            Some(Entry::Stream(entry)) => entry.flush_backlog().map(|()| entry.outbound.len()),
            Some(Entry::Listener(_)) => return Err(SocketError::NotAStream(handle)),
            None => return Err(SocketError::Inactive(handle)),
        };

        outcome.map_err(|source| {
            entries.remove(&handle);
            debug!("Flush on {} failed: {}", handle, source);
            SocketError::Io { handle, source }
        })
    }

    /// Reads whatever is available into `buffer` without blocking
    ///
    /// Peer shutdown and read failures close the handle.
    pub fn recv(&self, handle: Handle, buffer: &mut [u8]) -> RecvStatus {
        let mut entries = self.entries();

        let outcome = match entries.get_mut(&handle) {
            Some(Entry::Stream(entry)) => {
                if buffer.is_empty() {
                    return RecvStatus::Pending;
                }
                entry.stream.read(buffer)
            }
            _ => return RecvStatus::Failed,
        };

        match outcome {
            Ok(0) => {
                entries.remove(&handle);
                debug!("{} closed by peer", handle);
                RecvStatus::Closed
            }
            Ok(count) => RecvStatus::Received(count),
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::Interrupted => {
                RecvStatus::Pending
            }
            Err(e) => {
                entries.remove(&handle);
                debug!("Receive on {} failed: {}", handle, e);
                RecvStatus::Failed
            }
        }
    }

    /// Counts how many of `handles` are ready, without waiting
    ///
    /// A listener is ready when a connection can be accepted; a stream is
    /// ready when a receive would not report [`RecvStatus::Pending`]. Unknown
    /// handles are never ready.
    pub fn select(&self, handles: &[Handle]) -> usize {
        let mut entries = self.entries();

        handles
            .iter()
            .filter(|handle| match entries.get_mut(*handle) {
                Some(Entry::Listener(entry)) => entry.poll_pending(),
                Some(Entry::Stream(entry)) => entry.is_readable(),
                None => false,
            })
            .count()
    }

    /// Like [`select`](Self::select) but waits up to `timeout` for any handle
    /// to become ready
    pub fn select_timeout(&self, handles: &[Handle], timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        loop {
            let ready = self.select(handles);
            if ready > 0 || Instant::now() >= deadline {
                return ready;
            }
            thread::sleep(SELECT_POLL_INTERVAL);
        }
    }

    /// Closes a handle. `false` if it was already inactive.
    pub fn close(&self, handle: Handle) -> bool {
        match self.entries().remove(&handle) {
            Some(Entry::Stream(mut entry)) => {
                if let Err(e) = entry.flush_backlog() {
                    debug!("Dropping backlog of {} on close: {}", handle, e);
                }
                debug!("Closed {}", handle);
                true
            }
            Some(Entry::Listener(_)) => {
                debug!("Closed listener {}", handle);
                true
            }
            None => false,
        }
    }

    /// True while `handle` names a live connection or listener
    ///
    /// A handle stops being active when it is closed, or when a receive, send
    /// or flush on it found the connection gone.
    pub fn active(&self, handle: Handle) -> bool {
        self.entries().contains_key(&handle)
    }

    /// Local port of a listener or stream
    pub fn local_port(&self, handle: Handle) -> Option<u16> {
        self.entries()
            .get(&handle)
            .and_then(|entry| entry.local_addr().ok())
            .map(|addr| addr.port())
    }

    /// Remote address of a stream. `None` for listeners and inactive handles.
    pub fn peer_addr(&self, handle: Handle) -> Option<SocketAddr> {
        match self.entries().get(&handle) {
            Some(Entry::Stream(entry)) => entry.stream.peer_addr().ok(),
            _ => None,
        }
    }

    /// Bytes queued behind a partial write
    pub fn backlog(&self, handle: Handle) -> Option<usize> {
        match self.entries().get(&handle) {
            Some(Entry::Stream(entry)) => Some(entry.outbound.len()),
            _ => None,
        }
    }

    /// Number of active handles
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    /// True when no handle is active
    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}

impl Default for SocketRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn configure_stream(stream: &TcpStream) -> io::Result<()> {
    stream.set_nonblocking(true)?;
    stream.set_nodelay(true)?;
    Ok(())
}

fn create_listener(port: u16) -> io::Result<TcpListener> {
    let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;

    if !cfg!(target_os = "windows") {
        socket.set_reuse_address(true)?;
    }

    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    Ok(socket.into())
}
