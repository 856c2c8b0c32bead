//! Roster of clients connected to the relay
//!
//! This module tracks every accepted connection for as long as it is live:
//! - Uuid assignment, strictly increasing from 1 and never reused
//! - Per-connection frame re-assembly state
//! - Capacity limits on concurrent clients
//!
//! Clients are kept in accept order, which is also the order broadcasts visit
//! them. Only the relay worker thread touches the roster.

use log::info;
use shared::{FrameAssembler, Handle};
use std::time::Instant;

/// One accepted connection and its relay-assigned identity
#[derive(Debug)]
pub struct ConnectedClient {
    /// Relay-assigned identifier, unique for the relay's lifetime
    pub uuid: u32,
    /// Socket handle owned by the relay's registry
    pub socket: Handle,
    pub connected_at: Instant,
    /// Complete frames received from this client
    pub frames_relayed: u64,
    /// Bytes received but not yet forming a complete frame
    pub assembler: FrameAssembler,
}

impl ConnectedClient {
    pub fn new(uuid: u32, socket: Handle) -> Self {
        Self {
            uuid,
            socket,
            connected_at: Instant::now(),
            frames_relayed: 0,
            assembler: FrameAssembler::new(),
        }
    }
}

/// Accept-ordered collection of connected clients
pub struct ClientManager {
    clients: Vec<ConnectedClient>,
    /// Most recently issued uuid; zero before the first accept
    last_uuid: u32,
    max_clients: usize,
}

impl ClientManager {
    pub fn new(max_clients: usize) -> Self {
        Self {
            clients: Vec::new(),
            last_uuid: 0,
            max_clients,
        }
    }

    /// Registers a freshly accepted socket
    ///
    /// Returns the new client's uuid, or `None` when the relay is full. A
    /// refused socket does not consume a uuid.
    pub fn add_client(&mut self, socket: Handle) -> Option<u32> {
        if self.clients.len() >= self.max_clients {
            return None;
        }

        self.last_uuid += 1;
        let uuid = self.last_uuid;

        info!("Client {} connected on {}", uuid, socket);
        self.clients.push(ConnectedClient::new(uuid, socket));

        Some(uuid)
    }

    /// Removes a client, returning its record so the caller can close the socket
    pub fn remove_client(&mut self, uuid: u32) -> Option<ConnectedClient> {
        let index = self.clients.iter().position(|client| client.uuid == uuid)?;
        let client = self.clients.remove(index);
        info!(
            "Client {} disconnected after {:.1}s, {} frames received",
            client.uuid,
            client.connected_at.elapsed().as_secs_f32(),
            client.frames_relayed
        );
        Some(client)
    }

    pub fn get(&self, uuid: u32) -> Option<&ConnectedClient> {
        self.clients.iter().find(|client| client.uuid == uuid)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConnectedClient> {
        self.clients.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ConnectedClient> {
        self.clients.iter_mut()
    }

    /// Socket handles in accept order
    pub fn sockets(&self) -> Vec<Handle> {
        self.clients.iter().map(|client| client.socket).collect()
    }

    /// Takes every record out, leaving the roster empty
    pub fn drain(&mut self) -> Vec<ConnectedClient> {
        std::mem::take(&mut self.clients)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.clients.len() >= self.max_clients
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::SocketRegistry;

    /// Real handles from a scratch registry; the roster never touches sockets
    fn handles(count: usize) -> (SocketRegistry, Vec<Handle>) {
        let registry = SocketRegistry::new();
        let handles = (0..count)
            .map(|_| registry.listen(0).expect("listen on ephemeral port"))
            .collect();
        (registry, handles)
    }

    #[test]
    fn test_uuids_start_at_one_and_increase() {
        let (_registry, sockets) = handles(5);
        let mut manager = ClientManager::new(16);

        let uuids: Vec<u32> = sockets
            .iter()
            .map(|socket| manager.add_client(*socket).unwrap())
            .collect();

        assert_eq!(uuids, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_uuids_never_reused() {
        let (_registry, sockets) = handles(3);
        let mut manager = ClientManager::new(16);

        let first = manager.add_client(sockets[0]).unwrap();
        let second = manager.add_client(sockets[1]).unwrap();
        assert!(manager.remove_client(second).is_some());

        let third = manager.add_client(sockets[2]).unwrap();
        assert_eq!((first, second, third), (1, 2, 3));
    }

    #[test]
    fn test_capacity_limit() {
        let (_registry, sockets) = handles(3);
        let mut manager = ClientManager::new(2);

        assert_eq!(manager.add_client(sockets[0]), Some(1));
        assert_eq!(manager.add_client(sockets[1]), Some(2));
        assert!(manager.is_full());
        assert_eq!(manager.add_client(sockets[2]), None);

        manager.remove_client(1);
        assert_eq!(manager.add_client(sockets[2]), Some(3));
    }

    #[test]
    fn test_accept_order_preserved() {
        let (_registry, sockets) = handles(4);
        let mut manager = ClientManager::new(16);
        for socket in &sockets {
            manager.add_client(*socket);
        }
        manager.remove_client(2);

        assert_eq!(
            manager.sockets(),
            vec![sockets[0], sockets[2], sockets[3]]
        );
        let uuids: Vec<u32> = manager.iter().map(|client| client.uuid).collect();
        assert_eq!(uuids, vec![1, 3, 4]);
    }

    #[test]
    fn test_remove_unknown_client() {
        let mut manager = ClientManager::new(4);
        assert!(manager.remove_client(99).is_none());
        assert!(manager.is_empty());
    }

    #[test]
    fn test_drain_empties_roster() {
        let (_registry, sockets) = handles(2);
        let mut manager = ClientManager::new(4);
        manager.add_client(sockets[0]);
        manager.add_client(sockets[1]);

        let drained = manager.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(manager.len(), 0);
        assert_eq!(manager.get(1).map(|client| client.uuid), None);
    }
}
