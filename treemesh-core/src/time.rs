//! Node clock and the three-leg time handshakes (offset sync and trip delay).
//!
//! The leg that reaches the responder last carries every timestamp it needs, so the
//! responder does the arithmetic: it adopts the initiator's clock (`TimeSync`) or
//! reports the trip delay to the initiator (`TimeDelay`).

use std::cmp::Reverse;
use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::identity::NodeId;
use crate::protocol::{NodeTree, TimePhase, TimeSync};

/// Clock offset estimate; positive means the initiator's clock is ahead.
///
/// All inputs are wrapping 32-bit microsecond clocks, so differences are taken mod 2^32.
pub fn clock_offset(t0: u32, t1: u32, t2: u32, t3: u32) -> i64 {
    let there = t1.wrapping_sub(t0) as i32 as i64;
    let back = t2.wrapping_sub(t3) as i32 as i64;
    (there + back) / 2
}

/// One-way trip delay: round trip on the responder minus time spent at the initiator.
pub fn trip_delay(t0: u32, t1: u32, t2: u32, t3: u32) -> i64 {
    let round = t3.wrapping_sub(t0) as i32 as i64;
    let held = t2.wrapping_sub(t1) as i32 as i64;
    (round - held) / 2
}

/// Whether `ours` is the clock reference on a link whose other side advertises `theirs`.
///
/// A root outranks everything, then a tree that contains the root, then the larger tree;
/// the lower node ID breaks remaining ties. Both ends evaluate the same ranking.
pub fn is_time_reference(ours: &NodeTree, theirs: &NodeTree) -> bool {
    let rank = |t: &NodeTree| (t.root, t.contains_root(), t.size(), Reverse(t.node_id));
    rank(ours) > rank(theirs)
}

/// Local monotonic time plus a wrapping adjustment learned from the mesh.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeClock {
    adjust: u32,
}

impl NodeClock {
    pub fn node_time(&self, now_us: u64) -> u32 {
        (now_us as u32).wrapping_add(self.adjust)
    }

    pub fn adjust_by(&mut self, offset: i64) {
        self.adjust = self.adjust.wrapping_add(offset as u32);
    }

    pub fn adjustment(&self) -> u32 {
        self.adjust
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TimeKind {
    Sync,
    Delay,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HandshakeId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Initiator,
    Responder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    pub peer: NodeId,
    pub kind: TimeKind,
    side: Side,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeResult {
    Offset { peer: NodeId, offset: i64 },
    Delay { peer: NodeId, delay_us: i64 },
}

/// What the caller must do after feeding a leg in.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct TimeStep {
    pub reply: Option<TimeSync>,
    /// A handshake record was opened; arm its expiry.
    pub opened: Option<HandshakeId>,
    pub result: Option<TimeResult>,
}

#[derive(Debug, Default)]
pub struct TimeSynchronizer {
    clock: NodeClock,
    handshakes: BTreeMap<HandshakeId, Handshake>,
    next_id: u64,
}

impl TimeSynchronizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clock(&self) -> NodeClock {
        self.clock
    }

    pub fn node_time(&self, now_us: u64) -> u32 {
        self.clock.node_time(now_us)
    }

    pub fn is_pending(&self, peer: NodeId, kind: TimeKind) -> bool {
        self.handshakes
            .values()
            .any(|h| h.peer == peer && h.kind == kind)
    }

    /// First leg. Replaces any handshake of the same kind already open with `peer`.
    pub fn start(&mut self, kind: TimeKind, me: NodeId, peer: NodeId) -> (HandshakeId, TimeSync) {
        let id = self.open(peer, kind, Side::Initiator);
        (id, TimeSync::request(me, peer))
    }

    /// Abandon a handshake whose deadline passed. None if it already completed.
    pub fn expire(&mut self, id: HandshakeId) -> Option<Handshake> {
        let h = self.handshakes.remove(&id)?;
        debug!(peer = %h.peer, kind = ?h.kind, "time handshake timed out");
        Some(h)
    }

    /// Drop every handshake with `peer`, e.g. when its link closes.
    pub fn forget(&mut self, peer: NodeId) {
        self.handshakes.retain(|_, h| h.peer != peer);
    }

    pub fn handle(&mut self, kind: TimeKind, msg: &TimeSync, now_us: u64) -> TimeStep {
        let stamp = self.clock.node_time(now_us);
        match msg.msg.phase {
            TimePhase::Request => {
                let opened = self.open(msg.from, kind, Side::Responder);
                TimeStep {
                    reply: msg.answer(stamp),
                    opened: Some(opened),
                    result: None,
                }
            }
            TimePhase::TRequest => {
                if self.close(msg.from, kind, Side::Initiator).is_none() {
                    warn!(peer = %msg.from, ?kind, "unexpected time reply, no handshake open");
                    return TimeStep::default();
                }
                TimeStep {
                    reply: msg.complete(stamp, stamp),
                    ..TimeStep::default()
                }
            }
            TimePhase::TReply => {
                if self.close(msg.from, kind, Side::Responder).is_none() {
                    warn!(peer = %msg.from, ?kind, "unexpected final time leg, no handshake open");
                    return TimeStep::default();
                }
                let TimeSync { from, msg: m, .. } = *msg;
                let result = match kind {
                    TimeKind::Sync => {
                        let offset = clock_offset(m.t0, m.t1, m.t2, stamp);
                        self.clock.adjust_by(offset);
                        debug!(peer = %from, offset, "adopted clock offset");
                        TimeResult::Offset { peer: from, offset }
                    }
                    TimeKind::Delay => TimeResult::Delay {
                        peer: from,
                        delay_us: trip_delay(m.t0, m.t1, m.t2, stamp),
                    },
                };
                TimeStep {
                    result: Some(result),
                    ..TimeStep::default()
                }
            }
        }
    }

    fn open(&mut self, peer: NodeId, kind: TimeKind, side: Side) -> HandshakeId {
        self.handshakes
            .retain(|_, h| !(h.peer == peer && h.kind == kind && h.side == side));
        self.next_id += 1;
        let id = HandshakeId(self.next_id);
        self.handshakes.insert(id, Handshake { peer, kind, side });
        id
    }

    fn close(&mut self, peer: NodeId, kind: TimeKind, side: Side) -> Option<Handshake> {
        let id = self
            .handshakes
            .iter()
            .find(|(_, h)| h.peer == peer && h.kind == kind && h.side == side)
            .map(|(id, _)| *id)?;
        self.handshakes.remove(&id)
    }
}
