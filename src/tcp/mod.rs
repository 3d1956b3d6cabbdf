//! Simulated TCP: segments, per-connection state machines, and the
//! registry that wires them to a transport.

pub mod connection;
pub mod manager;
pub mod segment;
pub mod sequence;
pub mod state;

pub use connection::{
    ConnectionError, ConnectionEvent, ConnectionId, ConnectionInfo, Effect, Effects,
    TcpConnection,
};
pub use manager::{TcpEvent, TcpManager, TcpStats};
pub use segment::{Segment, SegmentId, TcpFlags};
pub use sequence::IsnGenerator;
pub use state::ConnectionState;
