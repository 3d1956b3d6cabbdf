//! TCP connection states.
//!
//! The eleven states of the RFC 793 diagram. The transition logic lives in
//! [`crate::tcp::connection`]; this module keeps only the enum, its trace
//! spelling, and the predicates the rest of the crate keys decisions on.

use std::fmt;

/// Connection state per the classic TCP diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// No connection. Initial state, and final state after a reset.
    #[default]
    Closed,
    /// Passive open: waiting for a connection request.
    Listen,
    /// Active open sent, waiting for the matching SYN-ACK.
    SynSent,
    /// SYN received and answered, waiting for the final handshake ACK.
    SynReceived,
    /// Open connection; data flows.
    Established,
    /// Local close sent, waiting for its acknowledgment or the peer's FIN.
    FinWait1,
    /// Our FIN acknowledged, waiting for the peer's FIN.
    FinWait2,
    /// Peer closed; the local side may still send.
    CloseWait,
    /// Both sides closed simultaneously, waiting for our FIN's ACK.
    Closing,
    /// Passive close finished sending, waiting for the last ACK.
    LastAck,
    /// Lingering so a retransmitted final ACK can still be answered.
    TimeWait,
}

impl ConnectionState {
    pub fn is_closed(&self) -> bool {
        matches!(self, ConnectionState::Closed)
    }

    pub fn is_established(&self) -> bool {
        matches!(self, ConnectionState::Established)
    }

    /// True once either side has started teardown.
    pub fn is_closing(&self) -> bool {
        matches!(
            self,
            ConnectionState::FinWait1
                | ConnectionState::FinWait2
                | ConnectionState::CloseWait
                | ConnectionState::Closing
                | ConnectionState::LastAck
                | ConnectionState::TimeWait
        )
    }

    /// States from which `close()` may initiate or continue teardown.
    pub fn may_close(&self) -> bool {
        matches!(
            self,
            ConnectionState::Established | ConnectionState::CloseWait
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The teaching tool logs states in their underscore spelling.
        let name = match self {
            ConnectionState::Closed => "CLOSED",
            ConnectionState::Listen => "LISTEN",
            ConnectionState::SynSent => "SYN_SENT",
            ConnectionState::SynReceived => "SYN_RECEIVED",
            ConnectionState::Established => "ESTABLISHED",
            ConnectionState::FinWait1 => "FIN_WAIT_1",
            ConnectionState::FinWait2 => "FIN_WAIT_2",
            ConnectionState::CloseWait => "CLOSE_WAIT",
            ConnectionState::Closing => "CLOSING",
            ConnectionState::LastAck => "LAST_ACK",
            ConnectionState::TimeWait => "TIME_WAIT",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_closed() {
        let state: ConnectionState = Default::default();
        assert!(state.is_closed());
    }

    #[test]
    fn test_predicates() {
        assert!(ConnectionState::Established.is_established());
        assert!(ConnectionState::Established.may_close());
        assert!(ConnectionState::CloseWait.may_close());
        assert!(!ConnectionState::Listen.may_close());

        for state in [
            ConnectionState::FinWait1,
            ConnectionState::FinWait2,
            ConnectionState::CloseWait,
            ConnectionState::Closing,
            ConnectionState::LastAck,
            ConnectionState::TimeWait,
        ] {
            assert!(state.is_closing(), "{} should count as closing", state);
        }
        assert!(!ConnectionState::Established.is_closing());
        assert!(!ConnectionState::Closed.is_closing());
    }

    #[test]
    fn test_display_spelling() {
        assert_eq!(ConnectionState::SynSent.to_string(), "SYN_SENT");
        assert_eq!(ConnectionState::FinWait1.to_string(), "FIN_WAIT_1");
        assert_eq!(ConnectionState::TimeWait.to_string(), "TIME_WAIT");
    }
}
