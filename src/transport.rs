//! The wire between connections.
//!
//! The registry never pushes segments at the other endpoint directly. It
//! parks them as [`SegmentFlight`]s, a transport carries them, and only
//! flights handed back via [`crate::tcp::TcpManager::deliver`] ever arrive.
//! Dropping a flight on the floor is the loss model: the sender's
//! retransmission timer is the only thing that will notice.

use std::collections::VecDeque;
use std::time::Duration;

use crate::clock::SimTime;
use crate::device::Device;
use crate::tcp::{ConnectionId, Segment, TcpManager};

/// One segment in transit between two devices.
#[derive(Debug, Clone)]
pub struct SegmentFlight {
    pub connection: ConnectionId,
    pub segment: Segment,
    pub source: Device,
    pub destination: Device,
}

/// Carries flights from `take_outbound` back to `deliver`.
pub trait Transport {
    /// Accept a flight for carriage.
    fn dispatch(&mut self, flight: SegmentFlight, now: SimTime);

    /// Flights that have arrived by `now`, in dispatch order.
    fn poll(&mut self, now: SimTime) -> Vec<SegmentFlight>;

    /// Whether anything is still in transit.
    fn in_transit(&self) -> usize;
}

/// Delivers on the next poll, preserving order.
#[derive(Default)]
pub struct ImmediateTransport {
    queue: VecDeque<SegmentFlight>,
}

impl ImmediateTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Transport for ImmediateTransport {
    fn dispatch(&mut self, flight: SegmentFlight, _now: SimTime) {
        self.queue.push_back(flight);
    }

    fn poll(&mut self, _now: SimTime) -> Vec<SegmentFlight> {
        self.queue.drain(..).collect()
    }

    fn in_transit(&self) -> usize {
        self.queue.len()
    }
}

/// Delivers after a fixed virtual delay.
pub struct LatencyTransport {
    delay: Duration,
    in_flight: VecDeque<(SimTime, SegmentFlight)>,
}

impl LatencyTransport {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            in_flight: VecDeque::new(),
        }
    }
}

impl Transport for LatencyTransport {
    fn dispatch(&mut self, flight: SegmentFlight, now: SimTime) {
        self.in_flight.push_back((now + self.delay, flight));
    }

    fn poll(&mut self, now: SimTime) -> Vec<SegmentFlight> {
        let mut arrived = Vec::new();
        while self.in_flight.front().is_some_and(|(due, _)| *due <= now) {
            if let Some((_, flight)) = self.in_flight.pop_front() {
                arrived.push(flight);
            }
        }
        arrived
    }

    fn in_transit(&self) -> usize {
        self.in_flight.len()
    }
}

/// Drops flights the predicate selects, carries the rest immediately.
pub struct LossyTransport {
    drop_if: Box<dyn FnMut(&SegmentFlight) -> bool>,
    queue: VecDeque<SegmentFlight>,
    dropped: usize,
}

impl LossyTransport {
    pub fn new<F>(drop_if: F) -> Self
    where
        F: FnMut(&SegmentFlight) -> bool + 'static,
    {
        Self {
            drop_if: Box::new(drop_if),
            queue: VecDeque::new(),
            dropped: 0,
        }
    }

    /// Drops everything. Useful for exercising the retransmission bound.
    pub fn blackhole() -> Self {
        Self::new(|_| true)
    }

    pub fn dropped(&self) -> usize {
        self.dropped
    }
}

impl Transport for LossyTransport {
    fn dispatch(&mut self, flight: SegmentFlight, _now: SimTime) {
        if (self.drop_if)(&flight) {
            log::debug!("dropping {} on the wire", flight.segment);
            self.dropped += 1;
        } else {
            self.queue.push_back(flight);
        }
    }

    fn poll(&mut self, _now: SimTime) -> Vec<SegmentFlight> {
        self.queue.drain(..).collect()
    }

    fn in_transit(&self) -> usize {
        self.queue.len()
    }
}

/// Shuttle segments between the registry and the transport until neither
/// side has anything deliverable *right now*. Flights still delayed inside
/// the transport survive; advance the clock and pump again to move them.
pub fn run_to_quiescence(manager: &mut TcpManager, transport: &mut dyn Transport) {
    loop {
        let now = manager.now();
        let mut moved = false;
        for flight in manager.take_outbound() {
            transport.dispatch(flight, now);
            moved = true;
        }
        for flight in transport.poll(now) {
            manager.deliver(flight);
            moved = true;
        }
        if !moved {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimConfig;
    use crate::tcp::TcpFlags;

    fn flight(manager: &mut TcpManager) -> SegmentFlight {
        let client = Device::new("pc-1", "Client PC");
        let server = Device::new("srv-1", "Web Server");
        let id = manager.create_connection(client, server, None, 80);
        manager.connect(&id);
        manager.take_outbound().remove(0)
    }

    #[test]
    fn test_immediate_delivers_in_order() {
        let mut manager = TcpManager::with_seed(SimConfig::default(), 7);
        let f = flight(&mut manager);
        let mut transport = ImmediateTransport::new();
        transport.dispatch(f.clone(), SimTime::ZERO);
        assert_eq!(transport.in_transit(), 1);

        let arrived = transport.poll(SimTime::ZERO);
        assert_eq!(arrived.len(), 1);
        assert_eq!(arrived[0].segment.id(), f.segment.id());
        assert_eq!(transport.in_transit(), 0);
    }

    #[test]
    fn test_latency_holds_until_due() {
        let mut manager = TcpManager::with_seed(SimConfig::default(), 7);
        let f = flight(&mut manager);
        let mut transport = LatencyTransport::new(Duration::from_millis(50));
        transport.dispatch(f, SimTime::ZERO);

        assert!(transport.poll(SimTime::from_millis(49)).is_empty());
        assert_eq!(transport.poll(SimTime::from_millis(50)).len(), 1);
    }

    #[test]
    fn test_lossy_drops_and_counts() {
        let mut manager = TcpManager::with_seed(SimConfig::default(), 7);
        let f = flight(&mut manager);
        let mut transport = LossyTransport::new(|fl| fl.segment.has_flag(TcpFlags::SYN));
        transport.dispatch(f, SimTime::ZERO);

        assert_eq!(transport.dropped(), 1);
        assert!(transport.poll(SimTime::ZERO).is_empty());
    }

    #[test]
    fn test_run_to_quiescence_establishes() {
        let mut manager = TcpManager::with_seed(SimConfig::default(), 7);
        let client = Device::new("pc-1", "Client PC");
        let server = Device::new("srv-1", "Web Server");
        let id = manager.create_connection(client, server, None, 80);
        manager.connect(&id);

        let mut transport = ImmediateTransport::new();
        run_to_quiescence(&mut manager, &mut transport);

        assert!(manager.connection(&id).unwrap().state().is_established());
    }
}
