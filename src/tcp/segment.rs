//! TCP segments as value objects.
//!
//! A segment is immutable after construction: retransmission re-sends a
//! clone carrying the same [`SegmentId`], which is what lets observers and
//! tests recognize "the same packet, again". There is no wire encoding and
//! no checksum; this is an in-memory simulation.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;

/// Control-flag bit set. Flags combine freely (`SYN | ACK`, `PSH | ACK`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TcpFlags(u8);

impl TcpFlags {
    pub const NONE: TcpFlags = TcpFlags(0);
    pub const FIN: TcpFlags = TcpFlags(0x01);
    pub const SYN: TcpFlags = TcpFlags(0x02);
    pub const RST: TcpFlags = TcpFlags(0x04);
    pub const PSH: TcpFlags = TcpFlags(0x08);
    pub const ACK: TcpFlags = TcpFlags(0x10);
    pub const URG: TcpFlags = TcpFlags(0x20);

    /// True if every flag in `other` is set in `self`.
    pub fn contains(&self, other: TcpFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    fn names(&self) -> Vec<&'static str> {
        const TABLE: [(TcpFlags, &str); 6] = [
            (TcpFlags::SYN, "SYN"),
            (TcpFlags::ACK, "ACK"),
            (TcpFlags::FIN, "FIN"),
            (TcpFlags::RST, "RST"),
            (TcpFlags::PSH, "PSH"),
            (TcpFlags::URG, "URG"),
        ];
        TABLE
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect()
    }
}

impl std::ops::BitOr for TcpFlags {
    type Output = TcpFlags;

    fn bitor(self, rhs: TcpFlags) -> TcpFlags {
        TcpFlags(self.0 | rhs.0)
    }
}

impl fmt::Display for TcpFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.names().join(","))
    }
}

/// Opaque per-segment identifier for tracing and retransmission identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SegmentId(u64);

static NEXT_SEGMENT_ID: AtomicU64 = AtomicU64::new(1);

impl SegmentId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Allocate a process-unique id.
    pub fn next() -> Self {
        Self(NEXT_SEGMENT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "seg-{:06}", self.0)
    }
}

/// One simulated TCP segment.
///
/// Construct via [`Segment::new`] and never mutate; all field accessors
/// are read-only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    id: SegmentId,
    source_port: u16,
    dest_port: u16,
    seq: u32,
    ack: u32,
    flags: TcpFlags,
    window: u16,
    payload: Bytes,
}

impl Segment {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: SegmentId,
        source_port: u16,
        dest_port: u16,
        seq: u32,
        ack: u32,
        flags: TcpFlags,
        window: u16,
        payload: Bytes,
    ) -> Self {
        Self {
            id,
            source_port,
            dest_port,
            seq,
            ack,
            flags,
            window,
            payload,
        }
    }

    pub fn id(&self) -> SegmentId {
        self.id
    }

    pub fn source_port(&self) -> u16 {
        self.source_port
    }

    pub fn dest_port(&self) -> u16 {
        self.dest_port
    }

    pub fn seq(&self) -> u32 {
        self.seq
    }

    pub fn ack(&self) -> u32 {
        self.ack
    }

    pub fn flags(&self) -> TcpFlags {
        self.flags
    }

    pub fn window(&self) -> u16 {
        self.window
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn has_flag(&self, flag: TcpFlags) -> bool {
        self.flags.contains(flag)
    }

    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    pub fn has_payload(&self) -> bool {
        !self.payload.is_empty()
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TCP[{}\u{2192}{}] Seq={} Ack={} Flags={} Win={}",
            self.source_port, self.dest_port, self.seq, self.ack, self.flags, self.window
        )
    }
}
