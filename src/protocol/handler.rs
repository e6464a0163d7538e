use std::sync::mpsc::{Receiver, Sender, TryRecvError};

use serde::Serialize;
use serde_json::{json, Value};

use super::messages::{
    HostRequest, Inbound, JointUpdateResponse, LoadModelData, MessageType, ModelSummary, OutboundMessage, RawMessage,
    RobotLoaded,
};
use crate::error::{ViewerError, ViewerResult};
use crate::joints::{Axis, JointAliasMap, JointTarget, JointUpdate, RobotSnapshot};
use crate::lifecycle::ViewDirection;
use crate::scene::{SceneConfig, SceneConfigPatch};

/// Reply channel back to whoever sent a request.
#[derive(Debug, Clone)]
pub struct Port {
    outbox: Sender<OutboundMessage>,
}

impl Port {
    pub fn new(outbox: Sender<OutboundMessage>) -> Self {
        Self { outbox }
    }

    pub fn post(&self, message: OutboundMessage) {
        if self.outbox.send(message).is_err() {
            log::debug!("[protocol] reply dropped; sender has gone away");
        }
    }
}

/// Fire-and-forget notifications to the host.
#[derive(Debug, Clone, Default)]
pub struct Publisher {
    outbox: Option<Sender<OutboundMessage>>,
}

impl Publisher {
    pub fn new(outbox: Sender<OutboundMessage>) -> Self {
        Self { outbox: Some(outbox) }
    }

    /// A publisher with no host attached; notifications go nowhere.
    pub fn detached() -> Self {
        Self::default()
    }

    pub fn publish(&self, message_type: MessageType, data: impl Serialize) {
        let Some(outbox) = &self.outbox else { return };
        let data = match serde_json::to_value(data) {
            Ok(data) => data,
            Err(err) => {
                log::warn!("[protocol] could not encode {message_type}: {err}");
                return;
            }
        };
        if outbox.send(OutboundMessage::new(message_type, data, None)).is_err() {
            log::debug!("[protocol] {message_type} dropped; host has gone away");
        }
    }
}

/// One inbound message and the port its reply goes to.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub origin: Port,
    pub payload: Value,
}

/// What the protocol can ask of the viewer.
pub trait ViewerCommands {
    fn load_model(&mut self, data: LoadModelData) -> ViewerResult<RobotLoaded>;

    fn update_joint(&mut self, robot_id: Option<&str>, joint_name: &str, angle: f32) -> ViewerResult<JointUpdate>;

    /// Returns how many joints changed.
    fn update_joints(&mut self, updates: &[JointTarget]) -> usize;

    fn set_view(&mut self, view: ViewDirection);

    fn joints_snapshot(&self) -> Vec<RobotSnapshot>;

    fn reset_scene(&mut self);

    fn set_joint_mapping(&mut self, robot_id: Option<&str>, aliases: JointAliasMap) -> ViewerResult<()>;

    fn set_scene_config(&mut self, patch: &SceneConfigPatch) -> ViewerResult<SceneConfig>;

    fn set_position(&mut self, robot_id: &str, axis: Axis, value: Option<f32>);

    fn set_rotation(&mut self, robot_id: &str, axis: Axis, degrees: Option<f32>);

    fn list_models(&self) -> Vec<ModelSummary>;

    fn activate_model(&mut self, robot_id: &str) -> ViewerResult<RobotLoaded>;

    fn deactivate_model(&mut self, robot_id: &str) -> ViewerResult<()>;

    fn delete_model(&mut self, robot_id: &str) -> ViewerResult<()>;

    /// Returns how many models were removed.
    fn clear_models(&mut self) -> usize;
}

/// Routes inbound envelopes to [`ViewerCommands`] and replies on the originating port.
#[derive(Debug, Default)]
pub struct ProtocolHandler {
    inbox: Option<Receiver<Envelope>>,
}

impl ProtocolHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts listening on `inbox`, replacing any previous listener.
    pub fn init(&mut self, inbox: Receiver<Envelope>) {
        self.inbox = Some(inbox);
    }

    pub fn is_listening(&self) -> bool {
        self.inbox.is_some()
    }

    /// Stops listening. Safe to call repeatedly or before `init`.
    pub fn destroy(&mut self) {
        if self.inbox.take().is_some() {
            log::debug!("[protocol] listener removed");
        }
    }

    /// Handles every envelope already queued without blocking. Returns how many were handled.
    pub fn pump(&mut self, target: &mut dyn ViewerCommands) -> usize {
        let mut handled = 0;
        loop {
            let Some(inbox) = &self.inbox else { break };
            match inbox.try_recv() {
                Ok(envelope) => {
                    if let Some(reply) = dispatch(target, envelope.payload) {
                        envelope.origin.post(reply);
                    }
                    handled += 1;
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    log::info!("[protocol] inbox closed");
                    self.inbox = None;
                    break;
                }
            }
        }
        handled
    }
}

/// Handles one inbound JSON message. Returns the reply, which exists only when the request
/// carried a `requestId`.
pub fn dispatch(target: &mut dyn ViewerCommands, payload: Value) -> Option<OutboundMessage> {
    let raw = RawMessage::from_value(payload);
    let request_id = raw.request_id.clone();
    let (message_type, request) = match Inbound::decode(raw) {
        Ok(Inbound::Request(message_type, request)) => (message_type, request),
        Ok(Inbound::Broadcast(_)) if request_id.is_some() => {
            let err = ViewerError::protocol("UPDATE_JOINT batches are broadcast-only and cannot carry a requestId");
            return reject(&err, None, request_id);
        }
        Ok(Inbound::Broadcast(updates)) => {
            let updated = target.update_joints(&updates);
            log::debug!("[protocol] broadcast updated {updated} of {} joint(s)", updates.len());
            return None;
        }
        Err(err) => return reject(&err, None, request_id),
    };
    let response_type = message_type.response()?;
    let joint_name = match &request {
        HostRequest::UpdateJoint(command) => Some(command.joint_name.clone()),
        _ => None,
    };
    match route(target, request) {
        Ok(data) => request_id.map(|id| OutboundMessage::new(response_type, data, Some(id))),
        Err(err) => reject(&err, joint_name.as_deref(), request_id),
    }
}

fn reject(err: &ViewerError, joint_name: Option<&str>, request_id: Option<Value>) -> Option<OutboundMessage> {
    match request_id {
        Some(id) => Some(OutboundMessage::error(err, joint_name, Some(id))),
        None => {
            log::warn!("[protocol] {err}");
            None
        }
    }
}

fn route(target: &mut dyn ViewerCommands, request: HostRequest) -> ViewerResult<Value> {
    match request {
        HostRequest::LoadModel(data) => to_json(target.load_model(data)?),
        HostRequest::UpdateJoint(command) => {
            let update = target.update_joint(command.robot_id.as_deref(), &command.joint_name, command.angle)?;
            to_json(JointUpdateResponse { success: true, joint_name: command.joint_name, angle: update.angle })
        }
        HostRequest::SetView(data) => {
            target.set_view(data.view);
            Ok(json!({ "view": data.view }))
        }
        HostRequest::GetJoints => to_json(target.joints_snapshot()),
        HostRequest::ResetScene => {
            target.reset_scene();
            Ok(json!({ "success": true }))
        }
        HostRequest::UpdateJointMapping(data) => {
            let robot_id = data.robot_id.clone();
            target.set_joint_mapping(robot_id.as_deref(), data.into())?;
            Ok(json!({ "success": true }))
        }
        HostRequest::SetSceneConfig(patch) => to_json(target.set_scene_config(&patch)?),
        HostRequest::SetPosition(data) => {
            target.set_position(&data.robot_id, data.axis, data.value);
            Ok(json!({ "success": true }))
        }
        HostRequest::SetRotation(data) => {
            target.set_rotation(&data.robot_id, data.axis, data.value);
            Ok(json!({ "success": true }))
        }
        HostRequest::ListModels => to_json(target.list_models()),
        HostRequest::ActivateModel(data) => to_json(target.activate_model(&data.robot_id)?),
        HostRequest::DeactivateModel(data) => {
            target.deactivate_model(&data.robot_id)?;
            Ok(json!({ "success": true, "robotId": data.robot_id }))
        }
        HostRequest::DeleteModel(data) => {
            target.delete_model(&data.robot_id)?;
            Ok(json!({ "success": true, "robotId": data.robot_id }))
        }
        HostRequest::ClearModels => {
            let removed = target.clear_models();
            Ok(json!({ "success": true, "removed": removed }))
        }
    }
}

fn to_json(value: impl Serialize) -> ViewerResult<Value> {
    serde_json::to_value(value).map_err(|err| ViewerError::protocol(format!("could not encode response: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ViewerConfig;
    use crate::session::Session;
    use std::sync::mpsc;

    #[test]
    fn pump_replies_on_the_originating_port() {
        let mut session = Session::new(SceneConfig::default(), ViewerConfig::default());
        let mut handler = ProtocolHandler::new();
        let (inbox_tx, inbox_rx) = mpsc::channel();
        handler.init(inbox_rx);

        let (first_tx, first_rx) = mpsc::channel();
        let (second_tx, second_rx) = mpsc::channel();
        inbox_tx
            .send(Envelope { origin: Port::new(first_tx), payload: json!({"type": "LIST_MODELS", "requestId": 1}) })
            .expect("queue first");
        inbox_tx
            .send(Envelope { origin: Port::new(second_tx), payload: json!({"type": "RESET_SCENE", "requestId": "b"}) })
            .expect("queue second");

        assert_eq!(handler.pump(&mut session), 2);
        let first = first_rx.try_recv().expect("first reply");
        assert_eq!(first.message_type, "LIST_MODELS_RESPONSE");
        assert_eq!(first.data, json!([]));
        let second = second_rx.try_recv().expect("second reply");
        assert_eq!(second.request_id, Some(json!("b")));

        drop(inbox_tx);
        assert_eq!(handler.pump(&mut session), 0);
        assert!(!handler.is_listening(), "closed inbox stops the listener");
    }

    #[test]
    fn destroy_is_idempotent() {
        let mut handler = ProtocolHandler::new();
        handler.destroy();
        let (_tx, rx) = mpsc::channel();
        handler.init(rx);
        assert!(handler.is_listening());
        handler.destroy();
        handler.destroy();
        assert!(!handler.is_listening());
    }

    #[test]
    fn unmounted_viewer_still_answers_set_view() {
        let mut session = Session::new(SceneConfig::default(), ViewerConfig::default());
        let reply = dispatch(&mut session, json!({"type": "SET_VIEW", "requestId": 4, "data": {"view": "+y"}}))
            .expect("reply");
        assert_eq!(reply.message_type, "SET_VIEW_RESPONSE");
        assert_eq!(reply.data["view"], "+y");
    }
}
