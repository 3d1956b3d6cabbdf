//! A deterministic, event-driven simulation of TCP connections and HTTP
//! exchanges between named devices.
//!
//! Nothing here touches real sockets. Segments are plain values shuttled
//! between per-connection state machines by a [`transport::Transport`],
//! time only moves when the caller advances the virtual clock, and every
//! observable step surfaces as an event. The crate exists to make the
//! protocol choreography (handshakes, acknowledgements, retransmissions,
//! teardown) visible and scriptable.
//!
//! ```
//! use netsim_tcp::config::SimConfig;
//! use netsim_tcp::device::Device;
//! use netsim_tcp::http::{HttpSimulator, RequestOptions};
//! use netsim_tcp::transport::ImmediateTransport;
//!
//! let mut sim = HttpSimulator::new(SimConfig::default());
//! let client = Device::new("pc-1", "Client PC");
//! let server = Device::new("srv-1", "web.example");
//!
//! let id = sim.send_request(client, &server, RequestOptions::default());
//! let mut wire = ImmediateTransport::new();
//! sim.pump(&mut wire);
//!
//! let response = sim.session(&id).unwrap().response().unwrap();
//! assert_eq!(response.status, 200);
//! ```

pub mod clock;
pub mod config;
pub mod device;
pub mod event;
pub mod http;
pub mod tcp;
pub mod transport;

pub use clock::SimTime;
pub use config::{ConfigError, SimConfig, TimerMode};
pub use device::{Device, DeviceId};
pub use event::EventBus;
pub use tcp::{
    ConnectionId, ConnectionState, Segment, TcpConnection, TcpEvent, TcpFlags, TcpManager,
};
pub use transport::{
    ImmediateTransport, LatencyTransport, LossyTransport, SegmentFlight, Transport,
};
