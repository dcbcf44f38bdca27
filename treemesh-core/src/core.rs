//! Host-driven API: MeshNode receives events from the host, returns actions.
//!
//! The host owns links, the clock and storage. It feeds bytes, link changes and ticks in
//! (always with the current monotonic time in microseconds) and performs the returned
//! [`OutboundAction`]s. All protocol state lives in one `MeshNode`, so a host that uses
//! threads only needs to serialize calls into it.

use std::collections::HashMap;

use tracing::{debug, info, warn};

use crate::config::{us, MeshConfig};
use crate::identity::{LinkId, NodeId};
use crate::ota::{AbortReason, OtaDistributor, OtaEffect, OtaReceiver, UpdateId};
use crate::protocol::{Announce, AppPayload, Message, NodeSync, NodeTree};
use crate::router::Routing;
use crate::scheduler::Scheduler;
use crate::time::{self, HandshakeId, TimeKind, TimeResult, TimeStep, TimeSynchronizer};
use crate::tree::Topology;
use crate::wire::{self, DecodeError, Envelope, FrameDecodeError, FrameEncodeError};

/// Everything the node schedules. Timers carry ids, never references to state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timer {
    NodeSync,
    TimeSync,
    Announce,
    OtaRetry(UpdateId),
    TimeExpire(HandshakeId),
    Restart,
}

/// Something a collaborator may want to know about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeshEvent {
    NewConnection(NodeId),
    DroppedConnection(NodeId),
    ChangedConnections,
    TimeAdjusted { offset: i64 },
    NodeDelay { node: NodeId, delay_us: i64 },
    OtaProgress { part_no: u32, no_part: u32 },
    OtaCommitted { md5: String },
    OtaAborted { md5: String, reason: AbortReason },
}

/// Application payload that reached this node.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    Single { from: NodeId, msg: String },
    Broadcast { from: NodeId, msg: String },
    /// Untyped envelope with an application-defined tag.
    Custom(Envelope),
}

/// Action for host to perform.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundAction {
    /// Write one NUL-terminated frame to a link.
    Send(LinkId, Vec<u8>),
    Deliver(Delivery),
    Event(MeshEvent),
    CloseLink(LinkId),
    /// A new firmware image is committed; reboot into it.
    Restart,
}

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("no route to node {0}")]
    NoRoute(NodeId),
    #[error("cannot encode message: {0}")]
    Encode(#[from] FrameEncodeError),
}

enum Target {
    Link(LinkId),
    Node(NodeId),
    Flood { except: Option<LinkId> },
}

/// One mesh node: topology, clock, timers and the optional OTA roles.
pub struct MeshNode {
    node_id: NodeId,
    config: MeshConfig,
    topology: Topology,
    time: TimeSynchronizer,
    timers: Scheduler<Timer>,
    receiver: Option<OtaReceiver>,
    distributor: Option<OtaDistributor>,
    /// Partial inbound frames per link.
    buffers: HashMap<LinkId, Vec<u8>>,
    started: bool,
}

impl MeshNode {
    pub fn new(node_id: NodeId, config: MeshConfig) -> Self {
        let topology = Topology::new(node_id, false, config.root_tie_break);
        Self {
            node_id,
            config,
            topology,
            time: TimeSynchronizer::new(),
            timers: Scheduler::new(),
            receiver: None,
            distributor: None,
            buffers: HashMap::new(),
            started: false,
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    /// Declare this node root. The election may still prefer another declared root.
    pub fn set_root(&mut self, root: bool) {
        self.topology.set_root(root);
    }

    pub fn is_root(&self) -> bool {
        self.topology.is_root()
    }

    pub fn node_list(&self, include_self: bool) -> Vec<NodeId> {
        self.topology.node_list(include_self)
    }

    pub fn is_connected(&self, node: NodeId) -> bool {
        self.topology.is_connected(node)
    }

    pub fn tree(&self) -> NodeTree {
        self.topology.tree()
    }

    pub fn tree_json(&self) -> String {
        self.tree().to_json()
    }

    /// Mesh-synchronized time in microseconds (wraps at 2^32).
    pub fn node_time(&self, now_us: u64) -> u32 {
        self.time.node_time(now_us)
    }

    /// Earliest time `tick` has work to do.
    pub fn next_deadline(&self) -> Option<u64> {
        self.timers.next_deadline()
    }

    pub fn ota_receiver(&self) -> Option<&OtaReceiver> {
        self.receiver.as_ref()
    }

    pub fn enable_ota_receiver(&mut self, receiver: OtaReceiver) {
        self.receiver = Some(receiver);
    }

    /// Serve firmware and announce every build now and every `announce_interval_ms`.
    pub fn enable_ota_distributor(
        &mut self,
        distributor: OtaDistributor,
        now_us: u64,
    ) -> Vec<OutboundAction> {
        self.ensure_started(now_us);
        self.distributor = Some(distributor);
        self.timers.every(
            now_us,
            us(self.config.announce_interval_ms),
            None,
            Timer::Announce,
        );
        let mut out = Vec::new();
        self.announce_all(&mut out);
        out
    }

    /// Flood one announce.
    pub fn announce(&mut self, ann: Announce) -> Result<Vec<OutboundAction>, SendError> {
        let mut out = Vec::new();
        self.try_send(Message::Announce(ann), Target::Flood { except: None }, &mut out)?;
        Ok(out)
    }

    pub fn send_single(
        &mut self,
        dest: NodeId,
        msg: impl Into<String>,
    ) -> Result<Vec<OutboundAction>, SendError> {
        let payload = AppPayload {
            from: self.node_id,
            dest,
            msg: msg.into(),
        };
        let mut out = Vec::new();
        self.try_send(Message::Single(payload), Target::Node(dest), &mut out)?;
        Ok(out)
    }

    pub fn send_broadcast(&mut self, msg: impl Into<String>) -> Result<Vec<OutboundAction>, SendError> {
        let payload = AppPayload {
            from: self.node_id,
            dest: NodeId::BROADCAST,
            msg: msg.into(),
        };
        let mut out = Vec::new();
        self.try_send(Message::Broadcast(payload), Target::Flood { except: None }, &mut out)?;
        Ok(out)
    }

    /// Send an application envelope according to its routing hint.
    pub fn send_custom(&mut self, env: &Envelope) -> Result<Vec<OutboundAction>, SendError> {
        let frame = wire::encode_frame(env, self.config.max_frame_len)?;
        let target = match env.routing() {
            Routing::Broadcast => Target::Flood { except: None },
            Routing::Single | Routing::Neighbour => Target::Node(env.dest()),
            Routing::RoutingError => return Err(SendError::NoRoute(env.dest())),
        };
        let mut out = Vec::new();
        self.push_frame(frame, target, &mut out)?;
        Ok(out)
    }

    /// Ask `dest` to measure the trip delay to us; `dest` raises `NodeDelay` when done.
    pub fn start_delay_measurement(
        &mut self,
        dest: NodeId,
        now_us: u64,
    ) -> Result<Vec<OutboundAction>, SendError> {
        self.ensure_started(now_us);
        if self.topology.route(dest).is_none() {
            return Err(SendError::NoRoute(dest));
        }
        let (id, leg) = self.time.start(TimeKind::Delay, self.node_id, dest);
        self.arm_handshake_expiry(id, now_us);
        let mut out = Vec::new();
        self.try_send(Message::TimeDelay(leg), Target::Node(dest), &mut out)?;
        Ok(out)
    }

    /// A peer link came up; start syncing topology over it.
    pub fn on_link_opened(&mut self, link: LinkId, now_us: u64) -> Vec<OutboundAction> {
        self.ensure_started(now_us);
        debug!(%link, "link opened");
        self.topology.open_link(link, now_us);
        let mut out = Vec::new();
        self.send_node_sync(link, true, NodeId::BROADCAST, &mut out);
        out
    }

    pub fn on_link_closed(&mut self, link: LinkId, now_us: u64) -> Vec<OutboundAction> {
        self.ensure_started(now_us);
        let mut out = Vec::new();
        self.drop_link(link, &mut out);
        out
    }

    /// Raw stream bytes from a link; may hold any number of partial or complete frames.
    pub fn on_bytes_received(&mut self, link: LinkId, bytes: &[u8], now_us: u64) -> Vec<OutboundAction> {
        self.ensure_started(now_us);
        let mut buf = self.buffers.remove(&link).unwrap_or_default();
        buf.extend_from_slice(bytes);
        let mut out = Vec::new();
        loop {
            match wire::decode_frame(&buf, self.config.max_frame_len) {
                Ok((env, consumed)) => {
                    buf.drain(..consumed);
                    out.extend(self.on_envelope(link, env, now_us));
                }
                Err(FrameDecodeError::NeedMore) => break,
                Err(FrameDecodeError::TooLarge) => {
                    warn!(%link, "oversized frame, closing link");
                    out.push(OutboundAction::CloseLink(link));
                    self.drop_link(link, &mut out);
                    return out;
                }
                Err(FrameDecodeError::Decode { consumed, source }) => {
                    warn!(%link, error = %source, "dropping undecodable frame");
                    buf.drain(..consumed);
                }
            }
        }
        if !buf.is_empty() && self.topology.has_link(link) {
            self.buffers.insert(link, buf);
        }
        out
    }

    /// One complete message (terminator optional), for hosts that frame on their own.
    pub fn on_message_received(&mut self, link: LinkId, bytes: &[u8], now_us: u64) -> Vec<OutboundAction> {
        self.ensure_started(now_us);
        match Envelope::decode(bytes) {
            Ok(env) => self.on_envelope(link, env, now_us),
            Err(e) => {
                warn!(%link, error = %e, "dropping undecodable message");
                Vec::new()
            }
        }
    }

    /// Route one envelope: handle it here, forward it, or both.
    pub fn on_envelope(&mut self, link: LinkId, env: Envelope, now_us: u64) -> Vec<OutboundAction> {
        self.ensure_started(now_us);
        let mut out = Vec::new();
        if !self.topology.has_link(link) {
            warn!(%link, "message on unknown link dropped");
            return out;
        }
        let routing = env.routing();
        if routing == Routing::RoutingError {
            warn!(%link, tag = env.type_tag(), from = %env.from(), "unroutable message dropped");
            return out;
        }
        // Typed messages must parse before they are handled or relayed.
        let msg = match env.to_message() {
            Ok(m) => Some(m),
            Err(DecodeError::Untyped(_)) => None,
            Err(e) => {
                warn!(%link, tag = env.type_tag(), error = %e, "malformed message dropped");
                return out;
            }
        };
        match routing {
            Routing::Single => {
                let dest = env.dest();
                if dest == self.node_id {
                    self.handle_local(link, env, msg, now_us, &mut out);
                } else {
                    self.forward(link, &env, dest, &mut out);
                }
            }
            Routing::Broadcast => {
                match wire::encode_frame(&env, self.config.max_frame_len) {
                    Ok(frame) => self.flood(frame, Some(link), &mut out),
                    Err(e) => warn!(error = %e, "cannot re-encode broadcast"),
                }
                self.handle_local(link, env, msg, now_us, &mut out);
            }
            Routing::Neighbour | Routing::RoutingError => {
                self.handle_local(link, env, msg, now_us, &mut out)
            }
        }
        out
    }

    /// Fire due timers.
    pub fn tick(&mut self, now_us: u64) -> Vec<OutboundAction> {
        self.ensure_started(now_us);
        let mut out = Vec::new();
        for fired in self.timers.due(now_us) {
            match fired.task {
                Timer::NodeSync => self.periodic_sync(now_us, &mut out),
                Timer::TimeSync => {
                    for link in self.topology.links() {
                        if let Some(peer) = self.topology.neighbour(link) {
                            self.maybe_start_time_sync(link, peer, now_us, &mut out);
                        }
                    }
                }
                Timer::Announce => self.announce_all(&mut out),
                Timer::OtaRetry(id) => {
                    if let Some(rx) = self.receiver.as_mut() {
                        let effects = rx.on_retry(id, fired.exhausted, &mut self.timers);
                        self.apply_ota(effects, now_us, &mut out);
                    }
                }
                Timer::TimeExpire(id) => {
                    self.time.expire(id);
                }
                Timer::Restart => {
                    info!("restarting into new firmware");
                    out.push(OutboundAction::Restart);
                }
            }
        }
        out
    }

    fn ensure_started(&mut self, now_us: u64) {
        if self.started {
            return;
        }
        self.started = true;
        self.timers.every(
            now_us,
            us(self.config.node_sync_interval_ms),
            None,
            Timer::NodeSync,
        );
        self.timers.every(
            now_us,
            us(self.config.time_sync_interval_ms),
            None,
            Timer::TimeSync,
        );
    }

    /// `msg` is the typed form of `env`; None for application tags.
    fn handle_local(
        &mut self,
        link: LinkId,
        env: Envelope,
        msg: Option<Message>,
        now_us: u64,
        out: &mut Vec<OutboundAction>,
    ) {
        let Some(msg) = msg else {
            out.push(OutboundAction::Deliver(Delivery::Custom(env)));
            return;
        };
        match msg {
            Message::Single(p) => out.push(OutboundAction::Deliver(Delivery::Single {
                from: p.from,
                msg: p.msg,
            })),
            Message::Broadcast(p) => out.push(OutboundAction::Deliver(Delivery::Broadcast {
                from: p.from,
                msg: p.msg,
            })),
            Message::NodeSyncRequest(s) => self.on_node_sync(link, s, true, now_us, out),
            Message::NodeSyncReply(s) => self.on_node_sync(link, s, false, now_us, out),
            Message::TimeSync(t) => {
                let step = self.time.handle(TimeKind::Sync, &t, now_us);
                self.apply_time(step, TimeKind::Sync, Target::Link(link), now_us, out);
            }
            Message::TimeDelay(t) => {
                let step = self.time.handle(TimeKind::Delay, &t, now_us);
                self.apply_time(step, TimeKind::Delay, Target::Node(t.from), now_us, out);
            }
            Message::Announce(a) => {
                let is_root = self.topology.is_root();
                if let Some(rx) = self.receiver.as_mut() {
                    let effects = rx.on_announce(&a, self.node_id, is_root, now_us, &mut self.timers);
                    self.apply_ota(effects, now_us, out);
                }
            }
            Message::DataRequest(r) => {
                let reply = self
                    .distributor
                    .as_ref()
                    .and_then(|d| d.on_data_request(&r, self.node_id));
                if let Some(data) = reply {
                    let target = if data.broadcasted() {
                        Target::Flood { except: None }
                    } else {
                        Target::Node(data.request.dest)
                    };
                    self.send(Message::Data(data), target, out);
                }
            }
            Message::Data(d) => {
                if let Some(rx) = self.receiver.as_mut() {
                    let effects = rx.on_data(&d, self.node_id, now_us, &mut self.timers);
                    self.apply_ota(effects, now_us, out);
                }
            }
        }
    }

    fn on_node_sync(
        &mut self,
        link: LinkId,
        sync: NodeSync,
        reply: bool,
        now_us: u64,
        out: &mut Vec<OutboundAction>,
    ) {
        let peer = sync.from;
        let outcome = self.topology.apply_sync(link, sync.tree, now_us);
        if outcome.loop_detected {
            warn!(%link, %peer, "neighbour tree contains this node, closing link");
            out.push(OutboundAction::CloseLink(link));
            self.drop_link(link, out);
            return;
        }
        if reply {
            self.send_node_sync(link, false, peer, out);
        }
        if let Some(node) = outcome.new_connection {
            info!(%node, %link, "new connection");
            out.push(OutboundAction::Event(MeshEvent::NewConnection(node)));
        }
        if !outcome.changed {
            return;
        }
        debug!(joined = ?outcome.joined, left = ?outcome.left, "topology changed");
        out.push(OutboundAction::Event(MeshEvent::ChangedConnections));
        for other in self.topology.links() {
            if other != link {
                let dest = self.topology.neighbour(other).unwrap_or_default();
                self.send_node_sync(other, true, dest, out);
            }
        }
        self.maybe_start_time_sync(link, peer, now_us, out);
    }

    /// The time reference for a link initiates the offset handshake.
    fn maybe_start_time_sync(&mut self, link: LinkId, peer: NodeId, now_us: u64, out: &mut Vec<OutboundAction>) {
        let Some(theirs) = self.topology.subtree(link) else {
            return;
        };
        let ours = self.topology.tree_excluding(link);
        if !time::is_time_reference(&ours, theirs) || self.time.is_pending(peer, TimeKind::Sync) {
            return;
        }
        let (id, leg) = self.time.start(TimeKind::Sync, self.node_id, peer);
        self.arm_handshake_expiry(id, now_us);
        self.send(Message::TimeSync(leg), Target::Link(link), out);
    }

    fn apply_time(
        &mut self,
        step: TimeStep,
        kind: TimeKind,
        reply_to: Target,
        now_us: u64,
        out: &mut Vec<OutboundAction>,
    ) {
        if let Some(id) = step.opened {
            self.arm_handshake_expiry(id, now_us);
        }
        if let Some(leg) = step.reply {
            let msg = match kind {
                TimeKind::Sync => Message::TimeSync(leg),
                TimeKind::Delay => Message::TimeDelay(leg),
            };
            self.send(msg, reply_to, out);
        }
        match step.result {
            Some(TimeResult::Offset { offset, .. }) => {
                out.push(OutboundAction::Event(MeshEvent::TimeAdjusted { offset }));
            }
            Some(TimeResult::Delay { peer, delay_us }) => {
                out.push(OutboundAction::Event(MeshEvent::NodeDelay {
                    node: peer,
                    delay_us,
                }));
            }
            None => {}
        }
    }

    fn arm_handshake_expiry(&mut self, id: HandshakeId, now_us: u64) {
        self.timers.after(
            now_us,
            us(self.config.time_sync_timeout_ms),
            Timer::TimeExpire(id),
        );
    }

    fn apply_ota(&mut self, effects: Vec<OtaEffect>, now_us: u64, out: &mut Vec<OutboundAction>) {
        for effect in effects {
            match effect {
                OtaEffect::Send(req) => {
                    let dest = req.dest;
                    self.send(Message::DataRequest(req), Target::Node(dest), out);
                }
                OtaEffect::Progress { part_no, no_part } => {
                    out.push(OutboundAction::Event(MeshEvent::OtaProgress { part_no, no_part }));
                }
                OtaEffect::Committed(record) => {
                    self.timers.after(
                        now_us,
                        us(self.config.ota_restart_delay_ms),
                        Timer::Restart,
                    );
                    out.push(OutboundAction::Event(MeshEvent::OtaCommitted { md5: record.md5 }));
                }
                OtaEffect::Aborted { md5, reason } => {
                    out.push(OutboundAction::Event(MeshEvent::OtaAborted { md5, reason }));
                }
            }
        }
    }

    fn announce_all(&mut self, out: &mut Vec<OutboundAction>) {
        let anns = match &self.distributor {
            Some(d) => d.announcements(self.node_id, self.config.announce_broadcasted),
            None => return,
        };
        for ann in anns {
            debug!(md5 = %ann.firmware.md5, role = %ann.firmware.role, "announcing firmware");
            self.send(Message::Announce(ann), Target::Flood { except: None }, out);
        }
    }

    fn periodic_sync(&mut self, now_us: u64, out: &mut Vec<OutboundAction>) {
        for link in self
            .topology
            .stale_links(now_us, us(self.config.node_timeout_ms))
        {
            warn!(%link, "no node sync within timeout, closing link");
            out.push(OutboundAction::CloseLink(link));
            self.drop_link(link, out);
        }
        for link in self.topology.links() {
            let dest = self.topology.neighbour(link).unwrap_or_default();
            self.send_node_sync(link, true, dest, out);
        }
    }

    fn send_node_sync(&mut self, link: LinkId, request: bool, dest: NodeId, out: &mut Vec<OutboundAction>) {
        let tree = self.topology.tree_excluding(link);
        let sync = NodeSync::new(self.node_id, dest, tree.subs, tree.root);
        let msg = if request {
            Message::NodeSyncRequest(sync)
        } else {
            Message::NodeSyncReply(sync)
        };
        self.send(msg, Target::Link(link), out);
    }

    fn drop_link(&mut self, link: LinkId, out: &mut Vec<OutboundAction>) {
        self.buffers.remove(&link);
        let Some(dropped) = self.topology.close_link(link) else {
            return;
        };
        if let Some(node) = dropped.node {
            info!(%node, %link, "dropped connection");
            self.time.forget(node);
            out.push(OutboundAction::Event(MeshEvent::DroppedConnection(node)));
        }
        if !dropped.lost.is_empty() {
            out.push(OutboundAction::Event(MeshEvent::ChangedConnections));
            for other in self.topology.links() {
                let dest = self.topology.neighbour(other).unwrap_or_default();
                self.send_node_sync(other, true, dest, out);
            }
        }
    }

    fn forward(&mut self, from_link: LinkId, env: &Envelope, dest: NodeId, out: &mut Vec<OutboundAction>) {
        let next = match self.topology.route(dest) {
            Some(l) if l != from_link => l,
            _ => {
                warn!(%dest, tag = env.type_tag(), "no route for single message, dropped");
                return;
            }
        };
        match wire::encode_frame(env, self.config.max_frame_len) {
            Ok(frame) => out.push(OutboundAction::Send(next, frame)),
            Err(e) => warn!(error = %e, "cannot re-encode forwarded message"),
        }
    }

    fn flood(&self, frame: Vec<u8>, except: Option<LinkId>, out: &mut Vec<OutboundAction>) {
        for link in self.topology.links() {
            if Some(link) != except {
                out.push(OutboundAction::Send(link, frame.clone()));
            }
        }
    }

    /// Internal send; failures are logged, never surfaced.
    fn send(&mut self, msg: Message, target: Target, out: &mut Vec<OutboundAction>) {
        let kind = msg.kind();
        if let Err(e) = self.try_send(msg, target, out) {
            warn!(?kind, error = %e, "message not sent");
        }
    }

    fn try_send(&mut self, msg: Message, target: Target, out: &mut Vec<OutboundAction>) -> Result<(), SendError> {
        let frame = wire::encode_message(&msg, self.config.max_frame_len)?;
        self.push_frame(frame, target, out)
    }

    fn push_frame(&self, frame: Vec<u8>, target: Target, out: &mut Vec<OutboundAction>) -> Result<(), SendError> {
        match target {
            Target::Link(link) => out.push(OutboundAction::Send(link, frame)),
            Target::Node(dest) => {
                let link = self.topology.route(dest).ok_or(SendError::NoRoute(dest))?;
                out.push(OutboundAction::Send(link, frame));
            }
            Target::Flood { except } => self.flood(frame, except, out),
        }
        Ok(())
    }
}
