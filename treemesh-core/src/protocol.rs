//! Mesh wire protocol: type tags and typed message variants.
//!
//! Every variant is a flat JSON object once wrapped in an [`Envelope`](crate::wire::Envelope);
//! shared field groups are factored into structs and flattened on the wire.

use serde::{Deserialize, Serialize};

use crate::identity::NodeId;

pub const TIME_DELAY: i64 = 3;
pub const TIME_SYNC: i64 = 4;
pub const NODE_SYNC_REQUEST: i64 = 5;
pub const NODE_SYNC_REPLY: i64 = 6;
/// Legacy control messages; kept only so the tag is never reused.
pub const CONTROL: i64 = 7;
pub const BROADCAST: i64 = 8;
pub const SINGLE: i64 = 9;
pub const OTA_ANNOUNCE: i64 = 10;
pub const OTA_DATA_REQUEST: i64 = 11;
pub const OTA_DATA: i64 = 12;

/// Message kind, derived purely from the numeric `type` tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    TimeDelay,
    TimeSync,
    NodeSyncRequest,
    NodeSyncReply,
    Broadcast,
    Single,
    Announce,
    DataRequest,
    Data,
    /// Application-defined or future tag; carried as an untyped envelope.
    Untyped(i64),
}

impl MessageKind {
    pub fn from_tag(tag: i64) -> Self {
        match tag {
            TIME_DELAY => MessageKind::TimeDelay,
            TIME_SYNC => MessageKind::TimeSync,
            NODE_SYNC_REQUEST => MessageKind::NodeSyncRequest,
            NODE_SYNC_REPLY => MessageKind::NodeSyncReply,
            BROADCAST => MessageKind::Broadcast,
            SINGLE => MessageKind::Single,
            OTA_ANNOUNCE => MessageKind::Announce,
            OTA_DATA_REQUEST => MessageKind::DataRequest,
            OTA_DATA => MessageKind::Data,
            other => MessageKind::Untyped(other),
        }
    }

    pub fn tag(self) -> i64 {
        match self {
            MessageKind::TimeDelay => TIME_DELAY,
            MessageKind::TimeSync => TIME_SYNC,
            MessageKind::NodeSyncRequest => NODE_SYNC_REQUEST,
            MessageKind::NodeSyncReply => NODE_SYNC_REPLY,
            MessageKind::Broadcast => BROADCAST,
            MessageKind::Single => SINGLE,
            MessageKind::Announce => OTA_ANNOUNCE,
            MessageKind::DataRequest => OTA_DATA_REQUEST,
            MessageKind::Data => OTA_DATA,
            MessageKind::Untyped(tag) => tag,
        }
    }
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// Application payload for `Single` (point-to-point) and `Broadcast` (flood).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppPayload {
    pub from: NodeId,
    /// Ignored by receivers of a broadcast.
    #[serde(default)]
    pub dest: NodeId,
    #[serde(default)]
    pub msg: String,
}

/// A node and the subtree reachable through it.
///
/// Equality is structural and order-sensitive on `subs`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeTree {
    #[serde(rename = "nodeId", default)]
    pub node_id: NodeId,
    #[serde(default, skip_serializing_if = "is_false")]
    pub root: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subs: Vec<NodeTree>,
}

impl NodeTree {
    pub fn new(node_id: NodeId, root: bool) -> Self {
        Self {
            node_id,
            root,
            subs: Vec::new(),
        }
    }
}

/// Body of `NodeSyncRequest` and `NodeSyncReply`: the sender's tree plus routing metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSync {
    pub from: NodeId,
    #[serde(default)]
    pub dest: NodeId,
    #[serde(flatten)]
    pub tree: NodeTree,
}

impl NodeSync {
    pub fn new(from: NodeId, dest: NodeId, subs: Vec<NodeTree>, root: bool) -> Self {
        Self {
            from,
            dest,
            tree: NodeTree {
                node_id: from,
                root,
                subs,
            },
        }
    }
}

/// Phase of the three-leg clock handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum TimePhase {
    Request,
    TRequest,
    TReply,
}

impl TimePhase {
    pub fn next(self) -> Option<TimePhase> {
        match self {
            TimePhase::Request => Some(TimePhase::TRequest),
            TimePhase::TRequest => Some(TimePhase::TReply),
            TimePhase::TReply => None,
        }
    }
}

impl TryFrom<i32> for TimePhase {
    type Error = String;

    fn try_from(v: i32) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(TimePhase::Request),
            1 => Ok(TimePhase::TRequest),
            2 => Ok(TimePhase::TReply),
            other => Err(format!("invalid time sync phase {}", other)),
        }
    }
}

impl From<TimePhase> for i32 {
    fn from(p: TimePhase) -> i32 {
        match p {
            TimePhase::Request => 0,
            TimePhase::TRequest => 1,
            TimePhase::TReply => 2,
        }
    }
}

/// Inner `msg` object of a time message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeStamps {
    #[serde(rename = "type")]
    pub phase: TimePhase,
    #[serde(default)]
    pub t0: u32,
    #[serde(default)]
    pub t1: u32,
    #[serde(default)]
    pub t2: u32,
}

/// `TimeSync` (neighbour clock offset) and `TimeDelay` (trip delay) share this body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSync {
    pub from: NodeId,
    pub dest: NodeId,
    pub msg: TimeStamps,
}

impl TimeSync {
    /// First leg.
    pub fn request(from: NodeId, dest: NodeId) -> Self {
        Self {
            from,
            dest,
            msg: TimeStamps {
                phase: TimePhase::Request,
                t0: 0,
                t1: 0,
                t2: 0,
            },
        }
    }

    /// Second leg: echo our clock as `t0`. None unless this is a `Request`.
    pub fn answer(&self, t0: u32) -> Option<TimeSync> {
        if self.msg.phase != TimePhase::Request {
            return None;
        }
        let mut next = self.swapped()?;
        next.msg.t0 = t0;
        Some(next)
    }

    /// Third leg: attach receipt time of leg two (`t1`) and our send time (`t2`).
    /// None unless this is a `TRequest`.
    pub fn complete(&self, t1: u32, t2: u32) -> Option<TimeSync> {
        if self.msg.phase != TimePhase::TRequest {
            return None;
        }
        let mut next = self.swapped()?;
        next.msg.t1 = t1;
        next.msg.t2 = t2;
        Some(next)
    }

    fn swapped(&self) -> Option<TimeSync> {
        Some(TimeSync {
            from: self.dest,
            dest: self.from,
            msg: TimeStamps {
                phase: self.msg.phase.next()?,
                ..self.msg
            },
        })
    }
}

/// Identity of a firmware build: content hash plus target hardware class and role.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FirmwareId {
    pub md5: String,
    pub hardware: String,
    pub role: String,
}

/// Flooded advertisement of an available firmware build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announce {
    pub from: NodeId,
    #[serde(flatten)]
    pub firmware: FirmwareId,
    #[serde(rename = "noPart")]
    pub no_part: u32,
    /// Install even if the node already runs this build.
    #[serde(default, skip_serializing_if = "is_false")]
    pub forced: bool,
    /// Root pulls chunks on behalf of everyone; other nodes observe the flood.
    #[serde(default)]
    pub broadcasted: bool,
}

/// Request for one part of a firmware build, sent to the distributor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataRequest {
    #[serde(flatten)]
    pub announce: Announce,
    pub dest: NodeId,
    #[serde(rename = "partNo")]
    pub part_no: u32,
}

impl DataRequest {
    /// First request after an announce: addressed to whoever announced.
    pub fn reply_to_announce(ann: &Announce, from: NodeId, part_no: u32) -> Self {
        Self {
            announce: Announce {
                from,
                ..ann.clone()
            },
            dest: ann.from,
            part_no,
        }
    }

    /// Follow-up request after a chunk: addressed to whoever sent the chunk.
    pub fn reply_to_data(data: &Data, from: NodeId, part_no: u32) -> Self {
        let req = &data.request;
        Self {
            announce: Announce {
                from,
                ..req.announce.clone()
            },
            dest: req.announce.from,
            part_no,
        }
    }

    pub fn firmware(&self) -> &FirmwareId {
        &self.announce.firmware
    }
}

/// One base64-encoded firmware part.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Data {
    #[serde(flatten)]
    pub request: DataRequest,
    #[serde(default)]
    pub data: String,
}

impl Data {
    pub fn reply_to(req: &DataRequest, data: String) -> Self {
        Self {
            request: DataRequest {
                announce: Announce {
                    from: req.dest,
                    ..req.announce.clone()
                },
                dest: req.announce.from,
                part_no: req.part_no,
            },
            data,
        }
    }

    pub fn firmware(&self) -> &FirmwareId {
        &self.request.announce.firmware
    }

    pub fn part_no(&self) -> u32 {
        self.request.part_no
    }

    pub fn no_part(&self) -> u32 {
        self.request.announce.no_part
    }

    pub fn broadcasted(&self) -> bool {
        self.request.announce.broadcasted
    }
}

/// All typed message variants. Anything else travels as an untyped envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Single(AppPayload),
    Broadcast(AppPayload),
    NodeSyncRequest(NodeSync),
    NodeSyncReply(NodeSync),
    TimeSync(TimeSync),
    TimeDelay(TimeSync),
    Announce(Announce),
    DataRequest(DataRequest),
    Data(Data),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Single(_) => MessageKind::Single,
            Message::Broadcast(_) => MessageKind::Broadcast,
            Message::NodeSyncRequest(_) => MessageKind::NodeSyncRequest,
            Message::NodeSyncReply(_) => MessageKind::NodeSyncReply,
            Message::TimeSync(_) => MessageKind::TimeSync,
            Message::TimeDelay(_) => MessageKind::TimeDelay,
            Message::Announce(_) => MessageKind::Announce,
            Message::DataRequest(_) => MessageKind::DataRequest,
            Message::Data(_) => MessageKind::Data,
        }
    }

    pub fn from(&self) -> NodeId {
        match self {
            Message::Single(p) | Message::Broadcast(p) => p.from,
            Message::NodeSyncRequest(s) | Message::NodeSyncReply(s) => s.from,
            Message::TimeSync(t) | Message::TimeDelay(t) => t.from,
            Message::Announce(a) => a.from,
            Message::DataRequest(r) => r.announce.from,
            Message::Data(d) => d.request.announce.from,
        }
    }

    /// Destination node; `BROADCAST` for flooded variants.
    pub fn dest(&self) -> NodeId {
        match self {
            Message::Single(p) => p.dest,
            Message::Broadcast(_) | Message::Announce(_) => NodeId::BROADCAST,
            Message::NodeSyncRequest(s) | Message::NodeSyncReply(s) => s.dest,
            Message::TimeSync(t) | Message::TimeDelay(t) => t.dest,
            Message::DataRequest(r) => r.dest,
            Message::Data(d) => d.request.dest,
        }
    }
}
