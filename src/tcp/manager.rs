//! Connection registry.
//!
//! `TcpManager` owns every live connection, the virtual clock, the ISN
//! generator, and the ephemeral port allocator. All side-effects of
//! connection operations funnel through [`TcpManager::apply_effects`]:
//! outbound segments become [`SegmentFlight`]s waiting for the transport,
//! connection events become [`TcpEvent`]s visible on the observer bus and
//! the drainable event queue the HTTP layer consumes.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use bytes::Bytes;

use crate::clock::SimTime;
use crate::config::SimConfig;
use crate::device::{Device, DeviceId};
use crate::event::EventBus;
use crate::transport::SegmentFlight;

use super::connection::{
    ConnectionEvent, ConnectionId, ConnectionInfo, Effect, Effects, TcpConnection,
};
use super::segment::{Segment, TcpFlags};
use super::sequence::IsnGenerator;
use super::state::ConnectionState;

/// Registry-level event, tagged with the connection it happened on.
#[derive(Debug, Clone)]
pub enum TcpEvent {
    StateChange {
        connection: ConnectionId,
        old: ConnectionState,
        new: ConnectionState,
    },
    SegmentSent {
        connection: ConnectionId,
        segment: Segment,
        source: Device,
        destination: Device,
    },
    SegmentReceived {
        connection: ConnectionId,
        segment: Segment,
    },
    DataReceived {
        connection: ConnectionId,
        payload: Bytes,
    },
    Established {
        connection: ConnectionId,
    },
    ConnectionReset {
        connection: ConnectionId,
    },
}

/// Most queued-but-undrained events kept for [`TcpManager::poll_events`];
/// beyond this the oldest are discarded, so a subscriber-only consumer
/// cannot grow the queue without bound.
const EVENT_QUEUE_LIMIT: usize = 1024;

/// Aggregate view over all live connections.
#[derive(Debug, Clone, Default)]
pub struct TcpStats {
    pub total_connections: usize,
    pub established_connections: usize,
    pub state_distribution: HashMap<ConnectionState, usize>,
}

/// Owns and drives the set of simulated connections.
pub struct TcpManager {
    config: SimConfig,
    connections: HashMap<ConnectionId, TcpConnection>,
    isn_gen: IsnGenerator,
    now: SimTime,
    next_port: u16,
    bus: EventBus<TcpEvent>,
    event_queue: VecDeque<TcpEvent>,
    outbound: VecDeque<SegmentFlight>,
}

impl TcpManager {
    pub fn new(config: SimConfig) -> Self {
        let next_port = config.ephemeral_port_start;
        Self {
            config,
            connections: HashMap::new(),
            isn_gen: IsnGenerator::from_entropy(),
            now: SimTime::ZERO,
            next_port,
            bus: EventBus::new(),
            event_queue: VecDeque::new(),
            outbound: VecDeque::new(),
        }
    }

    /// Deterministic variant for tests and replayable scenarios.
    pub fn with_seed(config: SimConfig, seed: u64) -> Self {
        let mut manager = Self::new(config);
        manager.isn_gen = IsnGenerator::from_seed(seed);
        manager
    }

    pub fn now(&self) -> SimTime {
        self.now
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    /// Register an observer for every registry-level event.
    pub fn subscribe<F>(&mut self, handler: F)
    where
        F: FnMut(&TcpEvent) + 'static,
    {
        self.bus.subscribe(handler);
    }

    // === Connection lifecycle ===

    /// Create a connection. With `local_port` omitted an ephemeral port is
    /// allocated. A pre-existing connection on the same 4-tuple is reset
    /// and replaced so the key stays unique.
    pub fn create_connection(
        &mut self,
        local: Device,
        remote: Device,
        local_port: Option<u16>,
        remote_port: u16,
    ) -> ConnectionId {
        let local_port = local_port.unwrap_or_else(|| self.allocate_port());
        let isn = self.isn_gen.next_isn();
        let connection = TcpConnection::new(local, remote, local_port, remote_port, isn, &self.config);
        let id = connection.id().clone();

        if self.connections.contains_key(&id) {
            log::warn!("connection {id} already exists, resetting the stale one");
            self.reset(&id);
        }
        log::debug!("registered connection {id}");
        self.connections.insert(id.clone(), connection);
        id
    }

    pub fn connection(&self, id: &ConnectionId) -> Option<&TcpConnection> {
        self.connections.get(id)
    }

    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.connections.keys().cloned().collect()
    }

    pub fn connections_for_device(&self, device: &DeviceId) -> Vec<ConnectionId> {
        self.connections
            .keys()
            .filter(|id| &id.local == device || &id.remote == device)
            .cloned()
            .collect()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Reset then delete.
    pub fn remove_connection(&mut self, id: &ConnectionId) {
        if self.connections.contains_key(id) {
            self.reset(id);
            // `reset` already removed it via the Reset event; make sure.
            self.connections.remove(id);
            log::debug!("removed connection {id}");
        }
    }

    pub fn clear_all(&mut self) {
        let ids = self.connection_ids();
        for id in ids {
            self.reset(&id);
        }
        self.connections.clear();
        log::debug!("cleared all connections");
    }

    // === Permissive operation wrappers: log and continue on misuse ===

    pub fn listen(&mut self, id: &ConnectionId) {
        self.run_op(id, "listen", |conn, now| conn.listen(now));
    }

    pub fn connect(&mut self, id: &ConnectionId) {
        self.run_op(id, "connect", |conn, now| conn.connect(now));
    }

    /// Send application data; `false` when the connection is missing or
    /// not established.
    pub fn send(&mut self, id: &ConnectionId, payload: Bytes) -> bool {
        self.run_op(id, "send", |conn, now| conn.send(payload, now))
    }

    pub fn close(&mut self, id: &ConnectionId) {
        self.run_op(id, "close", |conn, now| conn.close(now));
    }

    pub fn reset(&mut self, id: &ConnectionId) {
        self.run_op(id, "reset", |conn, now| Ok(conn.reset(now)));
    }

    fn run_op<F>(&mut self, id: &ConnectionId, op: &'static str, f: F) -> bool
    where
        F: FnOnce(&mut TcpConnection, SimTime) -> Result<Effects, super::connection::ConnectionError>,
    {
        let now = self.now;
        let Some(conn) = self.connections.get_mut(id) else {
            log::warn!("{op}: no such connection {id}");
            return false;
        };
        match f(conn, now) {
            Ok(fx) => {
                self.apply_effects(id.clone(), fx);
                true
            }
            Err(err) => {
                log::warn!("{id}: {err}");
                false
            }
        }
    }

    // === Transport seam ===

    /// Drain segments waiting to be put "on the wire". Every flight must
    /// eventually come back through [`TcpManager::deliver`] or it stalls
    /// forever, which is exactly how packet loss is simulated.
    pub fn take_outbound(&mut self) -> Vec<SegmentFlight> {
        self.outbound.drain(..).collect()
    }

    pub fn has_outbound(&self) -> bool {
        !self.outbound.is_empty()
    }

    /// Deliver a flight to the counterpart connection (reverse 4-tuple).
    /// A SYN arriving with no counterpart reactively creates the listening
    /// server side, mirroring how the teaching tool spawns the passive
    /// opener on demand. Anything else without a counterpart is dropped.
    pub fn deliver(&mut self, flight: SegmentFlight) {
        let counterpart = flight.connection.reversed();
        if !self.connections.contains_key(&counterpart) {
            let segment = &flight.segment;
            if segment.has_flag(TcpFlags::SYN) && !segment.has_flag(TcpFlags::ACK) {
                log::debug!("reactively opening server side {counterpart}");
                let id = self.create_connection(
                    flight.destination.clone(),
                    flight.source.clone(),
                    Some(counterpart.local_port),
                    counterpart.remote_port,
                );
                self.listen(&id);
            } else {
                log::error!(
                    "no counterpart for {}: dropping {}",
                    flight.connection,
                    flight.segment
                );
                return;
            }
        }

        let now = self.now;
        if let Some(conn) = self.connections.get_mut(&counterpart) {
            let fx = conn.receive(flight.segment, now);
            self.apply_effects(counterpart, fx);
        }
    }

    // === Virtual time ===

    /// Advance the clock and fire any due connection timers.
    pub fn advance(&mut self, dt: Duration) {
        self.now = self.now + dt;
        let now = self.now;
        let ids = self.connection_ids();
        for id in ids {
            if let Some(conn) = self.connections.get_mut(&id) {
                let fx = conn.poll_timer(now);
                if !fx.is_empty() {
                    self.apply_effects(id, fx);
                }
            }
        }
    }

    // === Events ===

    /// Drain events for the composing layer (HTTP sessions, test drivers).
    ///
    /// Every event also reaches the subscribers registered via
    /// [`TcpManager::subscribe`]; consumers that only observe that way can
    /// skip polling, since the queue holds at most [`EVENT_QUEUE_LIMIT`]
    /// entries before shedding its oldest.
    pub fn poll_events(&mut self) -> Vec<TcpEvent> {
        self.event_queue.drain(..).collect()
    }

    pub fn statistics(&self) -> TcpStats {
        let mut stats = TcpStats {
            total_connections: self.connections.len(),
            ..Default::default()
        };
        for conn in self.connections.values() {
            *stats.state_distribution.entry(conn.state()).or_insert(0) += 1;
            if conn.state().is_established() {
                stats.established_connections += 1;
            }
        }
        stats
    }

    pub fn connection_infos(&self) -> Vec<ConnectionInfo> {
        self.connections.values().map(|c| c.info()).collect()
    }

    fn apply_effects(&mut self, id: ConnectionId, fx: Effects) {
        for effect in fx {
            match effect {
                Effect::Transmit(segment) => {
                    let (source, destination) = match self.connections.get(&id) {
                        Some(conn) => (conn.local_device().clone(), conn.remote_device().clone()),
                        None => {
                            log::error!("transmit from unknown connection {id}");
                            continue;
                        }
                    };
                    let flight = SegmentFlight {
                        connection: id.clone(),
                        segment: segment.clone(),
                        source: source.clone(),
                        destination: destination.clone(),
                    };
                    self.outbound.push_back(flight);
                    self.emit(TcpEvent::SegmentSent {
                        connection: id.clone(),
                        segment,
                        source,
                        destination,
                    });
                }
                Effect::Event(event) => {
                    let registry_event = match event {
                        ConnectionEvent::StateChange { old, new } => TcpEvent::StateChange {
                            connection: id.clone(),
                            old,
                            new,
                        },
                        ConnectionEvent::SegmentReceived { segment } => TcpEvent::SegmentReceived {
                            connection: id.clone(),
                            segment,
                        },
                        ConnectionEvent::DataReceived { payload, .. } => TcpEvent::DataReceived {
                            connection: id.clone(),
                            payload,
                        },
                        ConnectionEvent::Established => TcpEvent::Established {
                            connection: id.clone(),
                        },
                        ConnectionEvent::Reset => {
                            // A reset connection leaves the registry, like
                            // the original manager dropping it on
                            // connectionReset.
                            self.connections.remove(&id);
                            TcpEvent::ConnectionReset {
                                connection: id.clone(),
                            }
                        }
                    };
                    self.emit(registry_event);
                }
            }
        }
    }

    fn emit(&mut self, event: TcpEvent) {
        self.bus.emit(&event);
        self.event_queue.push_back(event);
        if self.event_queue.len() > EVENT_QUEUE_LIMIT {
            self.event_queue.pop_front();
            log::debug!("event queue past {EVENT_QUEUE_LIMIT} entries, shedding oldest");
        }
    }

    /// Round-robin ephemeral allocation: skip ports in use by either side
    /// of any connection, wrap past 65535 back to the configured start.
    fn allocate_port(&mut self) -> u16 {
        while self.port_in_use(self.next_port) {
            self.next_port = self.bump_port(self.next_port);
        }
        let port = self.next_port;
        self.next_port = self.bump_port(port);
        port
    }

    fn bump_port(&self, port: u16) -> u16 {
        if port >= 65535 {
            self.config.ephemeral_port_start
        } else {
            port + 1
        }
    }

    fn port_in_use(&self, port: u16) -> bool {
        self.connections
            .keys()
            .any(|id| id.local_port == port || id.remote_port == port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn devices() -> (Device, Device) {
        (
            Device::new("pc-1", "Client PC"),
            Device::new("srv-1", "Web Server"),
        )
    }

    fn manager() -> TcpManager {
        TcpManager::with_seed(SimConfig::default(), 1)
    }

    /// Shuttle flights back into the manager until nothing moves.
    fn pump(manager: &mut TcpManager) {
        loop {
            let flights = manager.take_outbound();
            if flights.is_empty() {
                break;
            }
            for flight in flights {
                manager.deliver(flight);
            }
        }
    }

    #[test]
    fn test_ephemeral_ports_are_unique() {
        let mut manager = manager();
        let (client, server) = devices();

        let mut ports = Vec::new();
        for i in 0..5 {
            let id = manager.create_connection(
                client.clone(),
                server.clone(),
                None,
                8000 + i as u16,
            );
            ports.push(id.local_port);
        }
        let mut deduped = ports.clone();
        deduped.sort_unstable();
        deduped.dedup();
        assert_eq!(deduped.len(), ports.len());
        assert!(ports.iter().all(|p| *p >= 1024));
    }

    #[test]
    fn test_port_allocation_wraps() {
        let config = SimConfig::default().with_ephemeral_port_start(65534);
        let mut manager = TcpManager::with_seed(config, 1);
        let (client, server) = devices();

        let a = manager.create_connection(client.clone(), server.clone(), None, 9001);
        let b = manager.create_connection(client.clone(), server.clone(), None, 9002);
        assert_eq!(a.local_port, 65534);
        assert_eq!(b.local_port, 65535);

        // Free the first port, then the next allocation wraps back to it.
        manager.remove_connection(&a);
        let c = manager.create_connection(client, server, None, 9003);
        assert_eq!(c.local_port, 65534);
    }

    #[test]
    fn test_allocation_skips_busy_ports() {
        let mut manager = manager();
        let (client, server) = devices();

        // Occupy 1024 and 1025 explicitly.
        manager.create_connection(client.clone(), server.clone(), Some(1024), 9000);
        manager.create_connection(client.clone(), server.clone(), Some(1025), 9001);

        let id = manager.create_connection(client, server, None, 9002);
        assert_eq!(id.local_port, 1026);
    }

    #[test]
    fn test_full_handshake_through_registry() {
        let mut manager = manager();
        let (client, server) = devices();

        let id = manager.create_connection(client, server, None, 80);
        manager.connect(&id);
        pump(&mut manager);

        let conn = manager.connection(&id).unwrap();
        assert!(conn.state().is_established());

        // Server side was created reactively and is established too.
        let server_conn = manager.connection(&id.reversed()).unwrap();
        assert!(server_conn.state().is_established());

        let established: Vec<_> = manager
            .poll_events()
            .into_iter()
            .filter(|ev| matches!(ev, TcpEvent::Established { .. }))
            .collect();
        assert_eq!(established.len(), 2);
    }

    #[test]
    fn test_observer_bus_sees_segments() {
        let mut manager = manager();
        let (client, server) = devices();
        let sent = Rc::new(RefCell::new(0usize));
        {
            let sent = Rc::clone(&sent);
            manager.subscribe(move |ev| {
                if matches!(ev, TcpEvent::SegmentSent { .. }) {
                    *sent.borrow_mut() += 1;
                }
            });
        }

        let id = manager.create_connection(client, server, None, 80);
        manager.connect(&id);
        pump(&mut manager);

        // SYN, SYN-ACK, ACK.
        assert_eq!(*sent.borrow(), 3);
    }

    #[test]
    fn test_reset_removes_connection() {
        let mut manager = manager();
        let (client, server) = devices();
        let id = manager.create_connection(client, server, None, 80);
        assert_eq!(manager.connection_count(), 1);

        manager.reset(&id);
        assert_eq!(manager.connection_count(), 0);
        assert!(manager
            .poll_events()
            .iter()
            .any(|ev| matches!(ev, TcpEvent::ConnectionReset { .. })));
    }

    #[test]
    fn test_send_on_missing_connection_is_false() {
        let mut manager = manager();
        let ghost = ConnectionId::new(DeviceId::new("a"), DeviceId::new("b"), 1, 2);
        assert!(!manager.send(&ghost, Bytes::from_static(b"data")));
    }

    #[test]
    fn test_send_before_established_is_false() {
        let mut manager = manager();
        let (client, server) = devices();
        let id = manager.create_connection(client, server, None, 80);
        assert!(!manager.send(&id, Bytes::from_static(b"too early")));
    }

    #[test]
    fn test_statistics() {
        let mut manager = manager();
        let (client, server) = devices();
        let id = manager.create_connection(client.clone(), server.clone(), None, 80);
        manager.connect(&id);
        pump(&mut manager);
        manager.create_connection(client, server, None, 81);

        let stats = manager.statistics();
        assert_eq!(stats.total_connections, 3);
        assert_eq!(stats.established_connections, 2);
        assert_eq!(
            stats.state_distribution.get(&ConnectionState::Closed),
            Some(&1)
        );
    }

    #[test]
    fn test_connections_for_device() {
        let mut manager = manager();
        let (client, server) = devices();
        let other = Device::new("pc-2", "Another PC");

        manager.create_connection(client.clone(), server.clone(), None, 80);
        manager.create_connection(other.clone(), server.clone(), None, 80);

        assert_eq!(manager.connections_for_device(client.id()).len(), 1);
        assert_eq!(manager.connections_for_device(server.id()).len(), 2);
        assert_eq!(manager.connections_for_device(other.id()).len(), 1);
    }

    #[test]
    fn test_clear_all() {
        let mut manager = manager();
        let (client, server) = devices();
        manager.create_connection(client.clone(), server.clone(), None, 80);
        manager.create_connection(client, server, None, 81);

        manager.clear_all();
        assert_eq!(manager.connection_count(), 0);
    }

    #[test]
    fn test_undrained_event_queue_is_bounded() {
        let mut manager = manager();
        let (client, server) = devices();
        let id = manager.create_connection(client, server, None, 80);
        manager.connect(&id);
        pump(&mut manager);
        let _ = manager.poll_events();

        // A subscriber-only consumer never polls; flood without draining.
        for _ in 0..2 * EVENT_QUEUE_LIMIT {
            manager.send(&id, Bytes::from_static(b"x"));
        }
        assert_eq!(manager.poll_events().len(), EVENT_QUEUE_LIMIT);
    }

    #[test]
    fn test_duplicate_tuple_replaces() {
        let mut manager = manager();
        let (client, server) = devices();
        let a = manager.create_connection(client.clone(), server.clone(), Some(2000), 80);
        let b = manager.create_connection(client, server, Some(2000), 80);
        assert_eq!(a, b);
        assert_eq!(manager.connection_count(), 1);
    }
}
