use serde::Serialize;
use thiserror::Error;

/// Coarse error category reported to protocol clients alongside the message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    NotFound,
    OutOfLimits,
    LoadFailure,
    StoreFailure,
    ProtocolError,
}

#[derive(Debug, Error)]
pub enum ViewerError {
    #[error("Robot {0} not found")]
    RobotNotFound(String),

    #[error("Joint {0} not found")]
    JointNotFound(String),

    #[error("Joint {joint} angle {angle} out of limits [{lower}, {upper}]")]
    OutOfLimits { joint: String, angle: f32, lower: f32, upper: f32 },

    #[error("failed to load '{label}': {message}")]
    LoadFailure { label: String, message: String },

    #[error("model store: {0}")]
    StoreFailure(String),

    #[error("{0}")]
    ProtocolError(String),
}

impl ViewerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ViewerError::RobotNotFound(_) | ViewerError::JointNotFound(_) => ErrorKind::NotFound,
            ViewerError::OutOfLimits { .. } => ErrorKind::OutOfLimits,
            ViewerError::LoadFailure { .. } => ErrorKind::LoadFailure,
            ViewerError::StoreFailure(_) => ErrorKind::StoreFailure,
            ViewerError::ProtocolError(_) => ErrorKind::ProtocolError,
        }
    }

    /// Joint the error refers to, when there is one.
    pub fn joint_name(&self) -> Option<&str> {
        match self {
            ViewerError::JointNotFound(name) => Some(name),
            ViewerError::OutOfLimits { joint, .. } => Some(joint),
            _ => None,
        }
    }

    pub fn load(label: impl Into<String>, err: impl std::fmt::Display) -> Self {
        ViewerError::LoadFailure { label: label.into(), message: format!("{err:#}") }
    }

    pub fn store(context: &str, err: impl std::fmt::Display) -> Self {
        ViewerError::StoreFailure(format!("{context}: {err}"))
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        ViewerError::ProtocolError(message.into())
    }
}

pub type ViewerResult<T> = Result<T, ViewerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_match_protocol_wording() {
        assert_eq!(ViewerError::RobotNotFound("r1".into()).to_string(), "Robot r1 not found");
        assert_eq!(ViewerError::JointNotFound("j1".into()).to_string(), "Joint j1 not found");
        let err = ViewerError::OutOfLimits { joint: "j1".into(), angle: 120.0, lower: -90.0, upper: 90.0 };
        assert_eq!(err.to_string(), "Joint j1 angle 120 out of limits [-90, 90]");
        assert_eq!(err.kind(), ErrorKind::OutOfLimits);
        assert_eq!(err.joint_name(), Some("j1"));
    }

    #[test]
    fn load_failure_keeps_label() {
        let err = ViewerError::load("arm", anyhow::anyhow!("bad mesh"));
        assert_eq!(err.kind(), ErrorKind::LoadFailure);
        assert!(err.to_string().contains("arm"));
        assert!(err.joint_name().is_none());
    }
}
