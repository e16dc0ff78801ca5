use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::Frame;

#[derive(Debug, Error)]
pub enum CameraError {
    #[error("camera stream already started")]
    AlreadyStreaming,

    #[error("camera unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("invalid camera identity: {0}")]
    InvalidIdentity(String),
}

/// Identity of a discovered dual-sensor camera, as handed over by the
/// platform shell (serialized as JSON across the activity boundary).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceIdentity {
    pub device_id: String,
}

impl DeviceIdentity {
    #[must_use]
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
        }
    }

    pub fn from_json(json: &str) -> Result<Self, CameraError> {
        serde_json::from_str(json).map_err(|e| CameraError::InvalidIdentity(e.to_string()))
    }

    /// True for the vendor's on-device emulator.
    #[must_use]
    pub fn is_emulator(&self) -> bool {
        self.device_id.contains("EMULATED FLIR ONE")
    }

    /// True for physical cameras, excluding both emulator flavors.
    #[must_use]
    pub fn is_real_camera(&self) -> bool {
        !self.is_emulator() && !self.device_id.contains("C++ Emulator")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

/// Device discovery notifications from the camera collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiscoveryEvent {
    Found(DeviceIdentity),
    Lost(DeviceIdentity),
    Error { message: String },
}

/// Everything the camera collaborator can tell the pipeline, delivered
/// through one channel and consumed at a single dispatch point
/// (`FusionPipeline::handle_event`).
#[derive(Debug, Clone)]
pub enum CameraEvent {
    ConnectionChanged(ConnectionStatus),
    StreamData { thermal: Frame, visible: Frame },
}

/// The camera collaborator. `start_stream`/`stop_stream` are called exactly
/// once per connection lifecycle; frames and status changes arrive on the
/// supplied channel from the collaborator's own callback context.
pub trait FrameSource {
    fn start_stream(&mut self, events: Sender<CameraEvent>) -> Result<(), CameraError>;

    fn stop_stream(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_decodes_from_shell_json() {
        let identity = DeviceIdentity::from_json(r#"{"deviceId": "FLIR-123456"}"#).unwrap();
        assert_eq!(identity.device_id, "FLIR-123456");
    }

    #[test]
    fn invalid_identity_json_rejected() {
        assert!(matches!(
            DeviceIdentity::from_json("not json"),
            Err(CameraError::InvalidIdentity(_))
        ));
    }

    #[test]
    fn emulator_identities_classified() {
        assert!(DeviceIdentity::new("EMULATED FLIR ONE 1").is_emulator());
        assert!(!DeviceIdentity::new("EMULATED FLIR ONE 1").is_real_camera());
        assert!(!DeviceIdentity::new("C++ Emulator 2").is_real_camera());
        assert!(!DeviceIdentity::new("C++ Emulator 2").is_emulator());

        let physical = DeviceIdentity::new("FLIR ONE PRO 85");
        assert!(physical.is_real_camera());
        assert!(!physical.is_emulator());
    }

    #[test]
    fn identity_round_trips_through_json() {
        let identity = DeviceIdentity::new("FLIR-42");
        let json = serde_json::to_string(&identity).unwrap();
        assert_eq!(DeviceIdentity::from_json(&json).unwrap(), identity);
    }
}
