//! Wire shapes of the host ⇄ viewer protocol.
//!
//! Inbound JSON is read as a loose [`RawMessage`] and then checked into an [`Inbound`] holding a [`HostRequest`]
//! union. Anything that fails the check never reaches a subsystem.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use base64::Engine;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::descriptor::{new_robot_id, FileBlob, RigState, RobotDescriptor, URDF_MEDIA_TYPE};
use crate::error::{ErrorKind, ViewerError, ViewerResult};
use crate::joints::{Axis, JointAliasMap, JointTarget};
use crate::lifecycle::ViewDirection;
use crate::scene::SceneConfigPatch;

macro_rules! message_types {
    ($($variant:ident => $wire:literal),+ $(,)?) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum MessageType {
            $($variant),+
        }

        impl MessageType {
            pub fn as_str(self) -> &'static str {
                match self {
                    $(MessageType::$variant => $wire),+
                }
            }
        }

        impl FromStr for MessageType {
            type Err = ViewerError;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                match value {
                    $($wire => Ok(MessageType::$variant),)+
                    other => Err(ViewerError::protocol(format!("Unknown message type '{other}'"))),
                }
            }
        }
    };
}

message_types! {
    LoadModel => "LOAD_MODEL",
    ModelLoaded => "MODEL_LOADED",
    UpdateJoint => "UPDATE_JOINT",
    UpdateJointResponse => "UPDATE_JOINT_RESPONSE",
    SetView => "SET_VIEW",
    SetViewResponse => "SET_VIEW_RESPONSE",
    GetJoints => "GET_JOINTS",
    GetJointsResponse => "GET_JOINTS_RESPONSE",
    ResetScene => "RESET_SCENE",
    ResetSceneResponse => "RESET_SCENE_RESPONSE",
    UpdateJointMapping => "UPDATE_JOINT_MAPPING",
    UpdateJointMappingResponse => "UPDATE_JOINT_MAPPING_RESPONSE",
    SetSceneConfig => "SET_SCENE_CONFIG",
    SetSceneConfigResponse => "SET_SCENE_CONFIG_RESPONSE",
    SetPosition => "SET_POSITION",
    SetPositionResponse => "SET_POSITION_RESPONSE",
    SetRotation => "SET_ROTATION",
    SetRotationResponse => "SET_ROTATION_RESPONSE",
    ListModels => "LIST_MODELS",
    ListModelsResponse => "LIST_MODELS_RESPONSE",
    ActivateModel => "ACTIVATE_MODEL",
    ActivateModelResponse => "ACTIVATE_MODEL_RESPONSE",
    DeactivateModel => "DEACTIVATE_MODEL",
    DeactivateModelResponse => "DEACTIVATE_MODEL_RESPONSE",
    DeleteModel => "DELETE_MODEL",
    DeleteModelResponse => "DELETE_MODEL_RESPONSE",
    ClearModels => "CLEAR_MODELS",
    ClearModelsResponse => "CLEAR_MODELS_RESPONSE",
    RobotLoaded => "ROBOT_LOADED",
    Error => "ERROR",
}

impl MessageType {
    /// Response type for a request type; `None` for viewer→host types.
    pub fn response(self) -> Option<MessageType> {
        use MessageType::*;
        Some(match self {
            LoadModel => ModelLoaded,
            UpdateJoint => UpdateJointResponse,
            SetView => SetViewResponse,
            GetJoints => GetJointsResponse,
            ResetScene => ResetSceneResponse,
            UpdateJointMapping => UpdateJointMappingResponse,
            SetSceneConfig => SetSceneConfigResponse,
            SetPosition => SetPositionResponse,
            SetRotation => SetRotationResponse,
            ListModels => ListModelsResponse,
            ActivateModel => ActivateModelResponse,
            DeactivateModel => DeactivateModelResponse,
            DeleteModel => DeleteModelResponse,
            ClearModels => ClearModelsResponse,
            _ => return None,
        })
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `{type, data?, requestId?}` before validation. The request id is kept as raw JSON so it
/// echoes back exactly as sent.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawMessage {
    #[serde(rename = "type", default)]
    pub message_type: Option<String>,
    #[serde(default)]
    pub data: Value,
    #[serde(rename = "requestId", default)]
    pub request_id: Option<Value>,
}

impl RawMessage {
    /// Best-effort read of any JSON value; non-objects yield an untyped message.
    pub fn from_value(value: Value) -> Self {
        let request_id = value.get("requestId").filter(|id| !id.is_null()).cloned();
        match serde_json::from_value::<RawMessage>(value) {
            Ok(mut raw) => {
                raw.request_id = request_id;
                raw
            }
            Err(_) => RawMessage { message_type: None, data: Value::Null, request_id },
        }
    }
}

/// Viewer→host message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboundMessage {
    #[serde(rename = "type")]
    pub message_type: &'static str,
    pub data: Value,
    #[serde(rename = "requestId", skip_serializing_if = "Option::is_none")]
    pub request_id: Option<Value>,
}

impl OutboundMessage {
    pub fn new(message_type: MessageType, data: Value, request_id: Option<Value>) -> Self {
        Self { message_type: message_type.as_str(), data, request_id }
    }

    pub fn error(error: &ViewerError, joint_name: Option<&str>, request_id: Option<Value>) -> Self {
        let payload = ErrorPayload {
            message: error.to_string(),
            code: error.kind(),
            joint_name: joint_name.or_else(|| error.joint_name()).map(str::to_string),
        };
        Self::new(MessageType::Error, serde_json::to_value(payload).unwrap_or(Value::Null), request_id)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub message: String,
    pub code: ErrorKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub joint_name: Option<String>,
}

/// Geometry bytes travel as base64 strings keyed by file name.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadModelData {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    pub urdf_content: String,
    #[serde(default)]
    pub mesh_files: BTreeMap<String, String>,
}

impl LoadModelData {
    pub fn into_descriptor(self) -> ViewerResult<RobotDescriptor> {
        let id = self.id.unwrap_or_else(new_robot_id);
        let name = self.name.unwrap_or_else(|| format!("{id}.urdf"));
        let description =
            FileBlob::new(name.clone(), self.urdf_content.into_bytes()).with_media_type(URDF_MEDIA_TYPE);
        let mut geometry = Vec::with_capacity(self.mesh_files.len());
        for (file, encoded) in self.mesh_files {
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(encoded.trim())
                .map_err(|err| ViewerError::protocol(format!("meshFiles['{file}'] is not valid base64: {err}")))?;
            geometry.push(FileBlob::new(file, bytes));
        }
        Ok(RobotDescriptor::with_id(id, name, description, geometry))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JointCommand {
    #[serde(default)]
    pub robot_id: Option<String>,
    pub joint_name: String,
    pub angle: f32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SetViewData {
    pub view: ViewDirection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JointMappingData {
    #[serde(default)]
    pub robot_id: Option<String>,
    pub mappings: IndexMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RootPoseData {
    pub robot_id: String,
    pub axis: Axis,
    #[serde(default)]
    pub value: Option<f32>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelIdData {
    pub robot_id: String,
}

/// Every request the viewer accepts, checked at the boundary.
#[derive(Debug, Clone)]
pub enum HostRequest {
    LoadModel(LoadModelData),
    UpdateJoint(JointCommand),
    SetView(SetViewData),
    GetJoints,
    ResetScene,
    UpdateJointMapping(JointMappingData),
    SetSceneConfig(SceneConfigPatch),
    SetPosition(RootPoseData),
    SetRotation(RootPoseData),
    ListModels,
    ActivateModel(ModelIdData),
    DeactivateModel(ModelIdData),
    DeleteModel(ModelIdData),
    ClearModels,
}

/// A checked inbound message.
#[derive(Debug)]
pub enum Inbound {
    /// `UPDATE_JOINT` with an array payload: applied to every active robot, never answered.
    Broadcast(Vec<JointTarget>),
    Request(MessageType, HostRequest),
}

impl Inbound {
    pub fn decode(raw: RawMessage) -> ViewerResult<Inbound> {
        let type_name = raw.message_type.ok_or_else(|| ViewerError::protocol("Message has no type"))?;
        let message_type: MessageType = type_name.parse()?;
        let data = raw.data;
        let request = match message_type {
            MessageType::UpdateJoint if data.is_array() => {
                return Ok(Inbound::Broadcast(decode_data(message_type, data)?));
            }
            MessageType::LoadModel => HostRequest::LoadModel(decode_data(message_type, data)?),
            MessageType::UpdateJoint => HostRequest::UpdateJoint(decode_data(message_type, data)?),
            MessageType::SetView => HostRequest::SetView(decode_data(message_type, data)?),
            MessageType::GetJoints => HostRequest::GetJoints,
            MessageType::ResetScene => HostRequest::ResetScene,
            MessageType::UpdateJointMapping => HostRequest::UpdateJointMapping(decode_data(message_type, data)?),
            MessageType::SetSceneConfig => HostRequest::SetSceneConfig(decode_data(message_type, data)?),
            MessageType::SetPosition => HostRequest::SetPosition(decode_data(message_type, data)?),
            MessageType::SetRotation => HostRequest::SetRotation(decode_data(message_type, data)?),
            MessageType::ListModels => HostRequest::ListModels,
            MessageType::ActivateModel => HostRequest::ActivateModel(decode_data(message_type, data)?),
            MessageType::DeactivateModel => HostRequest::DeactivateModel(decode_data(message_type, data)?),
            MessageType::DeleteModel => HostRequest::DeleteModel(decode_data(message_type, data)?),
            MessageType::ClearModels => HostRequest::ClearModels,
            other => return Err(ViewerError::protocol(format!("{other} is not a request"))),
        };
        Ok(Inbound::Request(message_type, request))
    }
}

fn decode_data<T: serde::de::DeserializeOwned>(message_type: MessageType, data: Value) -> ViewerResult<T> {
    serde_json::from_value(data).map_err(|err| ViewerError::protocol(format!("Invalid {message_type} data: {err}")))
}

impl From<JointMappingData> for JointAliasMap {
    fn from(data: JointMappingData) -> Self {
        JointAliasMap::new(data.mappings)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RobotLoaded {
    pub robot_id: String,
    pub name: String,
    pub joints: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JointUpdateResponse {
    pub success: bool,
    pub joint_name: String,
    pub angle: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelSummary {
    pub id: String,
    pub name: String,
    pub state: RigState,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decode(value: Value) -> ViewerResult<Inbound> {
        Inbound::decode(RawMessage::from_value(value))
    }

    #[test]
    fn update_joint_has_single_and_batch_forms() {
        let single = decode(json!({"type": "UPDATE_JOINT", "data": {"robotId": "r1", "jointName": "j1", "angle": 10}}))
            .expect("single");
        assert!(matches!(
            single,
            Inbound::Request(MessageType::UpdateJoint, HostRequest::UpdateJoint(JointCommand { ref joint_name, .. }))
                if joint_name == "j1"
        ));

        let batch = decode(json!({"type": "UPDATE_JOINT", "data": [{"jointName": "j1", "angle": 10}]})).expect("batch");
        assert!(matches!(batch, Inbound::Broadcast(ref updates) if updates.len() == 1));
    }

    #[test]
    fn unknown_and_response_types_are_rejected() {
        let err = decode(json!({"type": "FLY"})).expect_err("unknown");
        assert_eq!(err.kind(), ErrorKind::ProtocolError);
        assert!(decode(json!({"type": "MODEL_LOADED"})).is_err());
        assert!(decode(json!({"data": {}})).is_err());
        assert!(decode(json!(42)).is_err());
    }

    #[test]
    fn malformed_data_is_a_protocol_error() {
        let err = decode(json!({"type": "SET_VIEW", "data": {"view": "sideways"}})).expect_err("bad view");
        assert!(err.to_string().contains("SET_VIEW"));
        assert!(decode(json!({"type": "UPDATE_JOINT", "data": {"jointName": "j1"}})).is_err());
    }

    #[test]
    fn request_ids_survive_any_json_type() {
        let raw = RawMessage::from_value(json!({"type": "GET_JOINTS", "requestId": 7}));
        assert_eq!(raw.request_id, Some(json!(7)));
        let raw = RawMessage::from_value(json!({"type": 3, "requestId": "abc"}));
        assert_eq!(raw.request_id, Some(json!("abc")));
        assert_eq!(raw.message_type, None);
        assert_eq!(RawMessage::from_value(json!({"type": "GET_JOINTS", "requestId": null})).request_id, None);
    }

    #[test]
    fn load_model_decodes_base64_meshes() {
        let data: LoadModelData = serde_json::from_value(json!({
            "name": "arm.urdf",
            "urdfContent": "<robot name=\"arm\"/>",
            "meshFiles": {"base.stl": "AQID"}
        }))
        .expect("load data");
        let descriptor = data.into_descriptor().expect("descriptor");
        assert_eq!(descriptor.geometry["base.stl"].bytes.as_ref(), &[1, 2, 3]);
        assert_eq!(descriptor.description.media_type.as_deref(), Some(URDF_MEDIA_TYPE));
        assert!(descriptor.id.starts_with("robot-"));

        let bad: LoadModelData =
            serde_json::from_value(json!({"urdfContent": "<robot/>", "meshFiles": {"a.stl": "!!"}})).expect("data");
        assert_eq!(bad.into_descriptor().expect_err("bad base64").kind(), ErrorKind::ProtocolError);
    }

    #[test]
    fn error_payload_carries_code_and_joint() {
        let err = ViewerError::OutOfLimits { joint: "j1".into(), angle: 120.0, lower: -90.0, upper: 90.0 };
        let message = OutboundMessage::error(&err, None, Some(json!("req-1")));
        let json = serde_json::to_value(&message).expect("serialize");
        assert_eq!(json["type"], "ERROR");
        assert_eq!(json["requestId"], "req-1");
        assert_eq!(json["data"]["code"], "OutOfLimits");
        assert_eq!(json["data"]["jointName"], "j1");
        assert_eq!(MessageType::LoadModel.response(), Some(MessageType::ModelLoaded));
        assert_eq!(MessageType::Error.response(), None);
    }
}
