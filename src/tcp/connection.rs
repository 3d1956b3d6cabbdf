//! One half of a simulated TCP conversation.
//!
//! A `TcpConnection` is a pure state machine: every operation returns the
//! ordered list of [`Effect`]s it produced (segments to put on the wire,
//! events for observers) and performs no I/O itself. The registry applies
//! the effects, which is what makes dispatch non-reentrant: a connection
//! can never call back into another connection mid-transition.
//!
//! Misuse (sending while not established, connecting twice) is an
//! [`ConnectionError::InvalidState`] that the registry logs and swallows,
//! matching the permissive behavior the teaching tool wants when a user
//! clicks buttons in the wrong order.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;

use crate::clock::SimTime;
use crate::config::{SimConfig, TimerMode};
use crate::device::{Device, DeviceId};

use super::segment::{Segment, SegmentId, TcpFlags};
use super::state::ConnectionState;

/// The 4-tuple identifying one side of a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId {
    pub local: DeviceId,
    pub remote: DeviceId,
    pub local_port: u16,
    pub remote_port: u16,
}

impl ConnectionId {
    pub fn new(local: DeviceId, remote: DeviceId, local_port: u16, remote_port: u16) -> Self {
        Self {
            local,
            remote,
            local_port,
            remote_port,
        }
    }

    /// The counterpart's key: endpoints and ports mirrored.
    pub fn reversed(&self) -> Self {
        Self {
            local: self.remote.clone(),
            remote: self.local.clone(),
            local_port: self.remote_port,
            remote_port: self.local_port,
        }
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}\u{2192}{}:{}",
            self.local, self.local_port, self.remote, self.remote_port
        )
    }
}

/// Invalid-state operation attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("{op} is not valid in state {state}")]
    InvalidState {
        op: &'static str,
        state: ConnectionState,
    },
}

/// Observer-visible happenings on a connection.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    StateChange {
        old: ConnectionState,
        new: ConnectionState,
    },
    SegmentReceived {
        segment: Segment,
    },
    /// A unique byte range arrived; fired at most once per range.
    DataReceived {
        payload: Bytes,
        segment: Segment,
    },
    Established,
    Reset,
}

/// One side-effect of a connection operation, in emission order.
#[derive(Debug, Clone)]
pub enum Effect {
    /// Hand this segment to the transport.
    Transmit(Segment),
    Event(ConnectionEvent),
}

pub type Effects = Vec<Effect>;

#[derive(Debug, Clone)]
enum TimerKind {
    Retransmit { segment: Segment, retries: u32 },
    TimeWait,
}

#[derive(Debug, Clone)]
struct ConnectionTimer {
    kind: TimerKind,
    /// `None` in inert mode: armed but never fires.
    deadline: Option<SimTime>,
}

/// Snapshot of a connection for inspection panels.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub state: ConnectionState,
    pub local_seq: u32,
    pub remote_seq: u32,
    pub local_ack: u32,
    pub sent_segments: usize,
    pub received_segments: usize,
}

/// One endpoint's view of a TCP conversation.
///
/// Client and server sides of the same conversation are two independent
/// `TcpConnection` values with mirrored 4-tuples; they are linked only by
/// the registry's counterpart lookup, never by shared references.
#[derive(Debug, Clone)]
pub struct TcpConnection {
    id: ConnectionId,
    local_device: Device,
    remote_device: Device,
    state: ConnectionState,
    local_seq: u32,
    remote_seq: u32,
    local_ack: u32,
    remote_ack: u32,
    window: u16,
    sent: Vec<Segment>,
    received: Vec<Segment>,
    timer: Option<ConnectionTimer>,
    retransmission_timeout: Duration,
    time_wait_timeout: Duration,
    max_retransmissions: u32,
    timer_mode: TimerMode,
}

impl TcpConnection {
    pub fn new(
        local_device: Device,
        remote_device: Device,
        local_port: u16,
        remote_port: u16,
        isn: u32,
        config: &SimConfig,
    ) -> Self {
        let id = ConnectionId::new(
            local_device.id().clone(),
            remote_device.id().clone(),
            local_port,
            remote_port,
        );
        log::debug!("new connection {id} (isn={isn})");
        Self {
            id,
            local_device,
            remote_device,
            state: ConnectionState::Closed,
            local_seq: isn,
            remote_seq: 0,
            local_ack: 0,
            remote_ack: 0,
            window: config.window_size,
            sent: Vec::new(),
            received: Vec::new(),
            timer: None,
            retransmission_timeout: config.retransmission_timeout,
            time_wait_timeout: config.time_wait_timeout(),
            max_retransmissions: config.max_retransmissions,
            timer_mode: config.timer_mode,
        }
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn local_device(&self) -> &Device {
        &self.local_device
    }

    pub fn remote_device(&self) -> &Device {
        &self.remote_device
    }

    pub fn local_port(&self) -> u16 {
        self.id.local_port
    }

    pub fn remote_port(&self) -> u16 {
        self.id.remote_port
    }

    pub fn local_seq(&self) -> u32 {
        self.local_seq
    }

    pub fn remote_seq(&self) -> u32 {
        self.remote_seq
    }

    pub fn local_ack(&self) -> u32 {
        self.local_ack
    }

    pub fn remote_ack(&self) -> u32 {
        self.remote_ack
    }

    /// Append-only log of everything this side has put on the wire,
    /// retransmissions included.
    pub fn sent_segments(&self) -> &[Segment] {
        &self.sent
    }

    pub fn received_segments(&self) -> &[Segment] {
        &self.received
    }

    pub fn has_active_timer(&self) -> bool {
        self.timer.is_some()
    }

    /// Resend count of the currently tracked segment, if one is tracked.
    pub fn retransmission_retries(&self) -> Option<u32> {
        match &self.timer {
            Some(ConnectionTimer {
                kind: TimerKind::Retransmit { retries, .. },
                ..
            }) => Some(*retries),
            _ => None,
        }
    }

    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id.clone(),
            state: self.state,
            local_seq: self.local_seq,
            remote_seq: self.remote_seq,
            local_ack: self.local_ack,
            sent_segments: self.sent.len(),
            received_segments: self.received.len(),
        }
    }

    // === User-facing operations ===

    /// Passive open: CLOSED -> LISTEN.
    pub fn listen(&mut self, _now: SimTime) -> Result<Effects, ConnectionError> {
        if self.state != ConnectionState::Closed {
            return Err(ConnectionError::InvalidState {
                op: "listen",
                state: self.state,
            });
        }
        let mut fx = Vec::new();
        self.set_state(&mut fx, ConnectionState::Listen);
        Ok(fx)
    }

    /// Active open: CLOSED -> SYN_SENT, emitting the SYN.
    pub fn connect(&mut self, now: SimTime) -> Result<Effects, ConnectionError> {
        if self.state != ConnectionState::Closed {
            return Err(ConnectionError::InvalidState {
                op: "connect",
                state: self.state,
            });
        }
        let mut fx = Vec::new();
        let syn = self.make_segment(TcpFlags::SYN, self.local_seq, 0, Bytes::new());
        self.set_state(&mut fx, ConnectionState::SynSent);
        self.transmit(&mut fx, syn, now);
        self.local_seq = self.local_seq.wrapping_add(1);
        Ok(fx)
    }

    /// Send application data. ESTABLISHED only.
    pub fn send(&mut self, payload: Bytes, now: SimTime) -> Result<Effects, ConnectionError> {
        if self.state != ConnectionState::Established {
            return Err(ConnectionError::InvalidState {
                op: "send",
                state: self.state,
            });
        }
        let len = payload.len() as u32;
        let mut fx = Vec::new();
        let seg = self.make_segment(
            TcpFlags::PSH | TcpFlags::ACK,
            self.local_seq,
            self.local_ack,
            payload,
        );
        self.transmit(&mut fx, seg, now);
        self.local_seq = self.local_seq.wrapping_add(len);
        Ok(fx)
    }

    /// Begin (ESTABLISHED) or continue (CLOSE_WAIT) an orderly teardown.
    pub fn close(&mut self, now: SimTime) -> Result<Effects, ConnectionError> {
        let next = match self.state {
            ConnectionState::Established => ConnectionState::FinWait1,
            ConnectionState::CloseWait => ConnectionState::LastAck,
            _ => {
                return Err(ConnectionError::InvalidState {
                    op: "close",
                    state: self.state,
                })
            }
        };
        let mut fx = Vec::new();
        let fin = self.make_segment(
            TcpFlags::FIN | TcpFlags::ACK,
            self.local_seq,
            self.local_ack,
            Bytes::new(),
        );
        self.set_state(&mut fx, next);
        self.transmit(&mut fx, fin, now);
        self.local_seq = self.local_seq.wrapping_add(1);
        Ok(fx)
    }

    /// Universal abort: cancel timers, force CLOSED, announce the reset.
    /// Safe from any state, including CLOSED, and safe to repeat.
    pub fn reset(&mut self, _now: SimTime) -> Effects {
        let mut fx = Vec::new();
        self.timer = None;
        self.set_state(&mut fx, ConnectionState::Closed);
        fx.push(Effect::Event(ConnectionEvent::Reset));
        fx
    }

    // === Inbound path ===

    /// Sole entry point for segments arriving from the counterpart.
    /// Unrecognized segments are logged and ignored; this never fails.
    pub fn receive(&mut self, segment: Segment, now: SimTime) -> Effects {
        log::debug!("{}: rcv {segment}", self.id);
        self.received.push(segment.clone());
        if segment.has_flag(TcpFlags::ACK) {
            self.remote_ack = segment.ack();
        }

        let mut fx = vec![Effect::Event(ConnectionEvent::SegmentReceived {
            segment: segment.clone(),
        })];
        match self.state {
            ConnectionState::Listen => self.on_listen(&mut fx, &segment, now),
            ConnectionState::SynSent => self.on_syn_sent(&mut fx, &segment, now),
            ConnectionState::SynReceived => self.on_syn_received(&mut fx, &segment, now),
            ConnectionState::Established => self.on_established(&mut fx, &segment, now),
            ConnectionState::FinWait1 => self.on_fin_wait1(&mut fx, &segment, now),
            ConnectionState::FinWait2 => self.on_fin_wait2(&mut fx, &segment, now),
            ConnectionState::CloseWait => self.on_close_wait(&mut fx, &segment),
            ConnectionState::Closing => self.on_closing(&mut fx, &segment, now),
            ConnectionState::LastAck => self.on_last_ack(&mut fx, &segment),
            ConnectionState::Closed | ConnectionState::TimeWait => {
                log::warn!("{}: segment ignored in state {}", self.id, self.state);
            }
        }
        fx
    }

    fn on_listen(&mut self, fx: &mut Effects, segment: &Segment, now: SimTime) {
        if !segment.has_flag(TcpFlags::SYN) {
            log::debug!("{}: non-SYN segment ignored in LISTEN", self.id);
            return;
        }
        self.remote_seq = segment.seq();
        self.local_ack = self.remote_seq.wrapping_add(1);
        let syn_ack = self.make_segment(
            TcpFlags::SYN | TcpFlags::ACK,
            self.local_seq,
            self.local_ack,
            Bytes::new(),
        );
        self.set_state(fx, ConnectionState::SynReceived);
        self.transmit(fx, syn_ack, now);
        self.local_seq = self.local_seq.wrapping_add(1);
    }

    fn on_syn_sent(&mut self, fx: &mut Effects, segment: &Segment, now: SimTime) {
        if !(segment.has_flag(TcpFlags::SYN) && segment.has_flag(TcpFlags::ACK)) {
            log::debug!("{}: expected SYN-ACK in SYN_SENT, ignoring", self.id);
            return;
        }
        self.remote_seq = segment.seq();
        self.local_ack = self.remote_seq.wrapping_add(1);
        self.cancel_timer();
        let ack = self.make_segment(TcpFlags::ACK, self.local_seq, self.local_ack, Bytes::new());
        self.set_state(fx, ConnectionState::Established);
        self.transmit(fx, ack, now);
        fx.push(Effect::Event(ConnectionEvent::Established));
    }

    fn on_syn_received(&mut self, fx: &mut Effects, segment: &Segment, now: SimTime) {
        if !segment.has_flag(TcpFlags::ACK) {
            log::debug!("{}: expected ACK in SYN_RECEIVED, ignoring", self.id);
            return;
        }
        self.cancel_timer();
        self.set_state(fx, ConnectionState::Established);
        fx.push(Effect::Event(ConnectionEvent::Established));
        // Data piggy-backed on the final handshake ACK takes the normal
        // ESTABLISHED path immediately.
        if segment.has_payload() {
            self.on_established(fx, segment, now);
        }
    }

    fn on_established(&mut self, fx: &mut Effects, segment: &Segment, now: SimTime) {
        if segment.has_flag(TcpFlags::FIN) {
            self.local_ack = segment.seq().wrapping_add(1);
            let ack =
                self.make_segment(TcpFlags::ACK, self.local_seq, self.local_ack, Bytes::new());
            self.set_state(fx, ConnectionState::CloseWait);
            self.transmit(fx, ack, now);
        } else if segment.has_payload() {
            self.handle_data(fx, segment, now);
        } else if segment.has_flag(TcpFlags::ACK) {
            self.handle_pure_ack(segment);
        }
    }

    /// A pure ACK cancels the retransmission timer only when it covers the
    /// next byte we expect to be acknowledged; stale ACKs leave it running.
    fn handle_pure_ack(&mut self, segment: &Segment) {
        if segment.ack() >= self.local_seq {
            self.cancel_timer();
        } else {
            log::debug!(
                "{}: stale ACK {} (expected >= {}), timer kept",
                self.id,
                segment.ack(),
                self.local_seq
            );
        }
    }

    fn handle_data(&mut self, fx: &mut Effects, segment: &Segment, now: SimTime) {
        let expected = self.local_ack;
        if segment.seq() < expected {
            // Duplicate delivery: re-acknowledge the position we already
            // hold and suppress the data event.
            log::debug!(
                "{}: duplicate data seq={} (expected {}), re-ACK only",
                self.id,
                segment.seq(),
                expected
            );
            let ack = self.make_segment(TcpFlags::ACK, self.local_seq, expected, Bytes::new());
            self.transmit(fx, ack, now);
            return;
        }

        self.local_ack = segment.seq().wrapping_add(segment.payload_len() as u32);
        let ack = self.make_segment(TcpFlags::ACK, self.local_seq, self.local_ack, Bytes::new());
        self.transmit(fx, ack, now);
        fx.push(Effect::Event(ConnectionEvent::DataReceived {
            payload: segment.payload().clone(),
            segment: segment.clone(),
        }));
    }

    fn on_fin_wait1(&mut self, fx: &mut Effects, segment: &Segment, now: SimTime) {
        if segment.has_flag(TcpFlags::FIN) {
            self.local_ack = segment.seq().wrapping_add(1);
            let ack =
                self.make_segment(TcpFlags::ACK, self.local_seq, self.local_ack, Bytes::new());
            // Peer FIN that also acknowledges our FIN skips CLOSING.
            if segment.has_flag(TcpFlags::ACK) && segment.ack() >= self.local_seq {
                self.set_state(fx, ConnectionState::TimeWait);
                self.arm_time_wait(now);
            } else {
                self.set_state(fx, ConnectionState::Closing);
            }
            self.transmit(fx, ack, now);
        } else if segment.has_flag(TcpFlags::ACK) && segment.ack() >= self.local_seq {
            self.set_state(fx, ConnectionState::FinWait2);
        }
    }

    fn on_fin_wait2(&mut self, fx: &mut Effects, segment: &Segment, now: SimTime) {
        if segment.has_flag(TcpFlags::FIN) {
            self.local_ack = segment.seq().wrapping_add(1);
            let ack =
                self.make_segment(TcpFlags::ACK, self.local_seq, self.local_ack, Bytes::new());
            self.set_state(fx, ConnectionState::TimeWait);
            self.arm_time_wait(now);
            self.transmit(fx, ack, now);
        }
    }

    fn on_close_wait(&mut self, fx: &mut Effects, segment: &Segment) {
        let _ = fx;
        if segment.has_flag(TcpFlags::ACK) && !segment.has_payload() {
            self.handle_pure_ack(segment);
        } else {
            log::debug!("{}: segment ignored in CLOSE_WAIT", self.id);
        }
    }

    fn on_closing(&mut self, fx: &mut Effects, segment: &Segment, now: SimTime) {
        if segment.has_flag(TcpFlags::ACK) && segment.ack() >= self.local_seq {
            self.set_state(fx, ConnectionState::TimeWait);
            self.arm_time_wait(now);
        }
    }

    fn on_last_ack(&mut self, fx: &mut Effects, segment: &Segment) {
        if segment.has_flag(TcpFlags::ACK) && segment.ack() >= self.local_seq {
            self.set_state(fx, ConnectionState::Closed);
        }
    }

    // === Timers ===

    /// Fire any due timer. Called by the registry after the clock advances.
    pub fn poll_timer(&mut self, now: SimTime) -> Effects {
        let due = match &self.timer {
            Some(ConnectionTimer {
                deadline: Some(deadline),
                ..
            }) => now >= *deadline,
            _ => false,
        };
        let Some(timer) = (if due { self.timer.take() } else { None }) else {
            return Vec::new();
        };
        match timer.kind {
            TimerKind::Retransmit { segment, retries } => {
                if retries < self.max_retransmissions {
                    log::warn!(
                        "{}: retransmitting {} (attempt {}/{})",
                        self.id,
                        segment.id(),
                        retries + 1,
                        self.max_retransmissions
                    );
                    self.sent.push(segment.clone());
                    let fx = vec![Effect::Transmit(segment.clone())];
                    self.timer = Some(ConnectionTimer {
                        kind: TimerKind::Retransmit {
                            segment,
                            retries: retries + 1,
                        },
                        deadline: Some(now + self.retransmission_timeout),
                    });
                    fx
                } else {
                    log::error!(
                        "{}: {} retransmissions exhausted, resetting",
                        self.id,
                        self.max_retransmissions
                    );
                    self.reset(now)
                }
            }
            TimerKind::TimeWait => {
                let mut fx = Vec::new();
                self.set_state(&mut fx, ConnectionState::Closed);
                fx
            }
        }
    }

    fn arm_retransmit(&mut self, segment: Segment, now: SimTime) {
        let deadline = match self.timer_mode {
            TimerMode::Active => Some(now + self.retransmission_timeout),
            TimerMode::Inert => None,
        };
        self.timer = Some(ConnectionTimer {
            kind: TimerKind::Retransmit {
                segment,
                retries: 0,
            },
            deadline,
        });
    }

    fn arm_time_wait(&mut self, now: SimTime) {
        // TIME_WAIT expiry is not a retransmission; it fires even in inert
        // timer mode so lingering connections eventually close.
        self.timer = Some(ConnectionTimer {
            kind: TimerKind::TimeWait,
            deadline: Some(now + self.time_wait_timeout),
        });
    }

    /// Idempotent: safe when nothing is armed.
    fn cancel_timer(&mut self) {
        self.timer = None;
    }

    // === Internals ===

    fn set_state(&mut self, fx: &mut Effects, new: ConnectionState) {
        let old = self.state;
        if old == new {
            return;
        }
        self.state = new;
        log::debug!("{}: {} -> {}", self.id, old, new);
        fx.push(Effect::Event(ConnectionEvent::StateChange { old, new }));
    }

    /// Log the segment as sent and queue it for the transport, arming the
    /// retransmission timer for segments that need reliability (SYN or
    /// payload-carrying).
    fn transmit(&mut self, fx: &mut Effects, segment: Segment, now: SimTime) {
        self.sent.push(segment.clone());
        let needs_retransmit = segment.has_flag(TcpFlags::SYN) || segment.has_payload();
        fx.push(Effect::Transmit(segment.clone()));
        if needs_retransmit {
            self.arm_retransmit(segment, now);
        }
    }

    fn make_segment(&self, flags: TcpFlags, seq: u32, ack: u32, payload: Bytes) -> Segment {
        Segment::new(
            SegmentId::next(),
            self.id.local_port,
            self.id.remote_port,
            seq,
            ack,
            flags,
            self.window,
            payload,
        )
    }
}
