//! Routing classes: how a message propagates once received.

use crate::protocol::{MessageKind, BROADCAST, NODE_SYNC_REPLY, NODE_SYNC_REQUEST, SINGLE, TIME_DELAY, TIME_SYNC};

/// How a received message must be propagated.
///
/// `Neighbour` messages are consumed by the immediate link. `Single` messages are
/// forwarded toward `dest` and handled only there. `Broadcast` messages are handled
/// everywhere and forwarded on every other link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Routing {
    RoutingError,
    Neighbour,
    Single,
    Broadcast,
}

impl Routing {
    /// Value of the optional `routing` hint on the wire.
    pub fn code(self) -> i64 {
        match self {
            Routing::RoutingError => -1,
            Routing::Neighbour => 0,
            Routing::Single => 1,
            Routing::Broadcast => 2,
        }
    }

    pub fn from_code(code: i64) -> Routing {
        match code {
            0 => Routing::Neighbour,
            1 => Routing::Single,
            2 => Routing::Broadcast,
            _ => Routing::RoutingError,
        }
    }
}

/// Routing class implied by a type tag alone.
pub fn routing_of(tag: i64) -> Routing {
    match tag {
        TIME_SYNC | NODE_SYNC_REQUEST | NODE_SYNC_REPLY => Routing::Neighbour,
        // Delay measurements cover the path to a possibly remote node.
        SINGLE | TIME_DELAY => Routing::Single,
        BROADCAST => Routing::Broadcast,
        _ => Routing::RoutingError,
    }
}

/// Routing class for a kind; an explicit hint on the envelope takes precedence.
pub fn routing_with_hint(kind: MessageKind, hint: Option<i64>) -> Routing {
    match hint {
        Some(code) => Routing::from_code(code),
        None => routing_of(kind.tag()),
    }
}
