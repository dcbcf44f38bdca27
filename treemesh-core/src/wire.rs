//! Envelope model and stream framing.
//!
//! An [`Envelope`] is any mesh message as a generic JSON object. It can be classified
//! from its `type` tag, re-parsed into a typed [`Message`], and re-serialized.
//! Unknown tags stay untyped so application message types pass through.
//!
//! Framing over a link: each JSON document is terminated by a single NUL byte.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::identity::NodeId;
use crate::protocol::{Message, MessageKind, NodeSync};
use crate::router::{self, Routing};

const TERMINATOR: u8 = 0;
/// Default cap on a single frame, terminator excluded.
pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024;

/// Generic, re-interpretable wire message.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    fields: Map<String, Value>,
}

impl Envelope {
    /// Parse one JSON document. A trailing NUL terminator is tolerated.
    pub fn decode(bytes: &[u8]) -> Result<Envelope, DecodeError> {
        let bytes = match bytes.last() {
            Some(&TERMINATOR) => &bytes[..bytes.len() - 1],
            _ => bytes,
        };
        match serde_json::from_slice::<Value>(bytes)? {
            Value::Object(fields) => Self::from_fields(fields),
            _ => Err(DecodeError::NotAnObject),
        }
    }

    /// Wrap an already parsed object. It must carry an integer `type`.
    pub fn from_fields(fields: Map<String, Value>) -> Result<Envelope, DecodeError> {
        match fields.get("type") {
            Some(v) if v.as_i64().is_some() => Ok(Envelope { fields }),
            Some(_) => Err(DecodeError::Malformed("type")),
            None => Err(DecodeError::Missing("type")),
        }
    }

    /// Build an application-defined message with a custom tag.
    pub fn custom(
        tag: i64,
        from: NodeId,
        dest: NodeId,
        routing: Routing,
        mut fields: Map<String, Value>,
    ) -> Envelope {
        fields.insert("type".into(), tag.into());
        fields.insert("from".into(), from.as_u32().into());
        fields.insert("dest".into(), dest.as_u32().into());
        fields.insert("routing".into(), routing.code().into());
        Envelope { fields }
    }

    /// Compact JSON text.
    pub fn encode(&self) -> Vec<u8> {
        Value::Object(self.fields.clone()).to_string().into_bytes()
    }

    pub fn type_tag(&self) -> i64 {
        self.fields
            .get("type")
            .and_then(Value::as_i64)
            .unwrap_or_default()
    }

    pub fn kind(&self) -> MessageKind {
        MessageKind::from_tag(self.type_tag())
    }

    pub fn from(&self) -> NodeId {
        self.node_field("from").unwrap_or_default()
    }

    /// Destination, or `BROADCAST` when absent.
    pub fn dest(&self) -> NodeId {
        self.node_field("dest").unwrap_or_default()
    }

    pub fn routing_hint(&self) -> Option<i64> {
        self.fields.get("routing").and_then(Value::as_i64)
    }

    pub fn routing(&self) -> Routing {
        router::routing_with_hint(self.kind(), self.routing_hint())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// Re-parse the fields a concrete body type requires; unknown keys are ignored.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, DecodeError> {
        Ok(serde_json::from_value(Value::Object(self.fields.clone()))?)
    }

    /// Interpret as a typed message. Untyped tags are an error here, not at decode.
    pub fn to_message(&self) -> Result<Message, DecodeError> {
        let msg = match self.kind() {
            MessageKind::Single => Message::Single(self.parse()?),
            MessageKind::Broadcast => Message::Broadcast(self.parse()?),
            MessageKind::NodeSyncRequest => Message::NodeSyncRequest(self.parse_node_sync()?),
            MessageKind::NodeSyncReply => Message::NodeSyncReply(self.parse_node_sync()?),
            MessageKind::TimeSync => Message::TimeSync(self.parse()?),
            MessageKind::TimeDelay => Message::TimeDelay(self.parse()?),
            MessageKind::Announce => Message::Announce(self.parse()?),
            MessageKind::DataRequest => Message::DataRequest(self.parse()?),
            MessageKind::Data => Message::Data(self.parse()?),
            MessageKind::Untyped(tag) => return Err(DecodeError::Untyped(tag)),
        };
        Ok(msg)
    }

    /// Copy with `from`/`dest` rewritten; used when re-addressing custom envelopes.
    pub fn with_addresses(&self, from: NodeId, dest: NodeId) -> Envelope {
        let mut fields = self.fields.clone();
        fields.insert("from".into(), from.as_u32().into());
        fields.insert("dest".into(), dest.as_u32().into());
        Envelope { fields }
    }

    fn parse_node_sync(&self) -> Result<NodeSync, DecodeError> {
        let mut sync: NodeSync = self.parse()?;
        // Older peers leave the node id implicit in `from`.
        if !self.fields.contains_key("nodeId") {
            sync.tree.node_id = sync.from;
        }
        Ok(sync)
    }

    fn node_field(&self, key: &str) -> Option<NodeId> {
        self.fields
            .get(key)
            .and_then(Value::as_u64)
            .and_then(|v| u32::try_from(v).ok())
            .map(NodeId)
    }
}

/// Classify purely from the `type` tag.
pub fn classify(env: &Envelope) -> MessageKind {
    env.kind()
}

fn body_fields<T: Serialize>(body: &T) -> Result<Map<String, Value>, FrameEncodeError> {
    match serde_json::to_value(body)? {
        Value::Object(fields) => Ok(fields),
        _ => Err(FrameEncodeError::NotAnObject),
    }
}

impl TryFrom<&Message> for Envelope {
    type Error = FrameEncodeError;

    fn try_from(msg: &Message) -> Result<Self, Self::Error> {
        let (mut fields, routing) = match msg {
            Message::Single(p) | Message::Broadcast(p) => (body_fields(p)?, None),
            Message::NodeSyncRequest(s) | Message::NodeSyncReply(s) => (body_fields(s)?, None),
            Message::TimeSync(t) | Message::TimeDelay(t) => (body_fields(t)?, None),
            Message::Announce(a) => (body_fields(a)?, Some(Routing::Broadcast)),
            Message::DataRequest(r) => (body_fields(r)?, Some(Routing::Single)),
            Message::Data(d) => {
                let routing = if d.broadcasted() {
                    Routing::Broadcast
                } else {
                    Routing::Single
                };
                (body_fields(d)?, Some(routing))
            }
        };
        fields.insert("type".into(), msg.kind().tag().into());
        if let Some(r) = routing {
            fields.insert("routing".into(), r.code().into());
        }
        Ok(Envelope { fields })
    }
}

impl TryFrom<Message> for Envelope {
    type Error = FrameEncodeError;

    fn try_from(msg: Message) -> Result<Self, Self::Error> {
        Envelope::try_from(&msg)
    }
}

/// Encode an envelope into one frame: JSON text + NUL terminator.
pub fn encode_frame(env: &Envelope, max_len: usize) -> Result<Vec<u8>, FrameEncodeError> {
    let mut out = env.encode();
    if out.len() > max_len {
        return Err(FrameEncodeError::TooLarge);
    }
    out.push(TERMINATOR);
    Ok(out)
}

/// Encode a typed message straight into a frame.
pub fn encode_message(msg: &Message, max_len: usize) -> Result<Vec<u8>, FrameEncodeError> {
    encode_frame(&Envelope::try_from(msg)?, max_len)
}

/// Error encoding a message into a frame (serialization or size limit).
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("message body is not a JSON object")]
    NotAnObject,
    #[error("frame too large")]
    TooLarge,
}

/// Decode one frame from the front of `bytes`. Returns the envelope and the number of bytes consumed.
/// Call with partial buffer; returns `NeedMore` if no terminator yet (caller should try again after more data).
pub fn decode_frame(bytes: &[u8], max_len: usize) -> Result<(Envelope, usize), FrameDecodeError> {
    let Some(end) = bytes.iter().position(|&b| b == TERMINATOR) else {
        if bytes.len() > max_len {
            return Err(FrameDecodeError::TooLarge);
        }
        return Err(FrameDecodeError::NeedMore);
    };
    if end > max_len {
        return Err(FrameDecodeError::TooLarge);
    }
    let consumed = end + 1;
    match Envelope::decode(&bytes[..end]) {
        Ok(env) => Ok((env, consumed)),
        Err(source) => Err(FrameDecodeError::Decode { consumed, source }),
    }
}

/// Error decoding a frame (need more bytes, too large, or a bad document).
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large")]
    TooLarge,
    /// The frame was complete but unusable; skip `consumed` bytes and continue.
    #[error("decode error: {source}")]
    Decode {
        consumed: usize,
        #[source]
        source: DecodeError,
    },
}

/// Malformed or unparseable message.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("message is not a JSON object")]
    NotAnObject,
    #[error("missing field `{0}`")]
    Missing(&'static str),
    #[error("malformed field `{0}`")]
    Malformed(&'static str),
    #[error("untyped message (type {0})")]
    Untyped(i64),
}
