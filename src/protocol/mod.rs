//! Host ⇄ viewer message protocol.
//!
//! Requests arrive as [`Envelope`]s and are answered on their origin [`Port`]; notifications
//! go out through a [`Publisher`]. [`stdio::StdioBridge`] carries both over JSON lines.

mod handler;
mod messages;
pub mod stdio;

pub use handler::{dispatch, Envelope, Port, ProtocolHandler, Publisher, ViewerCommands};
pub use messages::{
    ErrorPayload, HostRequest, Inbound, JointCommand, JointMappingData, JointUpdateResponse, LoadModelData, MessageType,
    ModelIdData, ModelSummary, OutboundMessage, RawMessage, RobotLoaded, RootPoseData, SetViewData,
};
