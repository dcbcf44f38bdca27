//! TreeMesh protocol core: self-healing spanning-tree mesh with time sync and OTA.
//! Host-driven: no I/O; host passes events and receives actions.

pub mod config;
pub mod core;
pub mod firmware;
pub mod identity;
pub mod integrity;
pub mod ota;
pub mod protocol;
pub mod router;
pub mod scheduler;
pub mod time;
pub mod tree;
pub mod wire;

pub use config::MeshConfig;
pub use core::{Delivery, MeshEvent, MeshNode, OutboundAction, SendError};
pub use firmware::{
    FirmwareError, FirmwareImage, FirmwareRecord, FirmwareSink, FirmwareSource, FirmwareWriter,
    ImageLibrary, StateStore,
};
pub use identity::{LinkId, NodeId};
pub use ota::{OtaDistributor, OtaReceiver};
pub use protocol::{Message, MessageKind, NodeTree};
pub use router::{routing_of, Routing};
pub use tree::RootTieBreak;
pub use wire::{decode_frame, encode_frame, DecodeError, Envelope, FrameDecodeError, FrameEncodeError};
